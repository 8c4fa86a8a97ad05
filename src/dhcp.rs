//! Per-network DHCP service on an overlay: an internal gateway port on the
//! designated host's bridge plus a dnsmasq instance bound to it.

use crate::executor::{CommandRunner, ExecTarget};
use crate::host::{HostRegistry, HostStatus};
use crate::network::Network;
use crate::persist;
use crate::provision::OsFamily;
use crate::{ReciraError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_LEASE_TIME: &str = "24h";
pub const DEFAULT_DNS_SERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

/// Static MAC-to-IP binding served by dnsmasq.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub host_ip: String,
    pub bridge: String,
    pub port_name: String,
    pub gateway: String,
    pub dhcp_start: String,
    pub dhcp_end: String,
    pub netmask: String,
    pub lease_time: String,
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    pub config_path: String,
    pub enabled_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub expires: i64,
    pub mac: String,
    pub ip: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub expires_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDhcp {
    dhcp_configs: BTreeMap<String, DhcpConfig>,
    last_updated: String,
}

pub fn gateway_port_name(vni: u32) -> String {
    format!("vni{}-gw", vni)
}

pub fn config_file_path(network_id: u32) -> String {
    format!("/etc/dnsmasq.d/recira-network-{}.conf", network_id)
}

pub fn lease_file_path(network_id: u32) -> String {
    format!("/var/lib/misc/dnsmasq-recira-{}.leases", network_id)
}

pub fn normalize_mac(mac: &str) -> String {
    mac.to_lowercase().replace('-', ":")
}

/// Dotted-quad netmask for a prefix length, by the usual shift formula.
pub fn netmask_from_prefix(prefix: u32) -> String {
    let mask: u32 = if prefix == 0 {
        0
    } else {
        (!0u32) << (32 - prefix.min(32))
    };
    format!(
        "{}.{}.{}.{}",
        (mask >> 24) & 0xff,
        (mask >> 16) & 0xff,
        (mask >> 8) & 0xff,
        mask & 0xff
    )
}

/// Split a CIDR subnet into (netmask, prefix), defaulting to a /24 when the
/// prefix cannot be parsed.
pub fn subnet_netmask(subnet: &str) -> (String, String) {
    match subnet
        .split_once('/')
        .and_then(|(_, prefix)| prefix.trim().parse::<u32>().ok())
        .filter(|p| *p <= 32)
    {
        Some(prefix) => (netmask_from_prefix(prefix), prefix.to_string()),
        None => ("255.255.255.0".to_string(), "24".to_string()),
    }
}

/// Render the dnsmasq fragment for one overlay network.
pub fn render_config(
    network_id: u32,
    vni: u32,
    interface: &str,
    dhcp_start: &str,
    dhcp_end: &str,
    gateway: &str,
    netmask: &str,
    lease_time: &str,
    dns_servers: &[String],
    reservations: &[Reservation],
) -> String {
    let mut config = format!(
        "# Recira DHCP configuration for network {} (VNI {})\n\
         # Auto-generated - do not edit manually\n\
         \n\
         # Listen only on the overlay interface\n\
         interface={}\n\
         bind-interfaces\n\
         \n\
         # DHCP range\n\
         dhcp-range={},{},{},{}\n\
         \n\
         # Gateway\n\
         dhcp-option=option:router,{}\n\
         \n\
         # DNS servers\n\
         dhcp-option=option:dns-server,{}\n\
         \n\
         # Lease file\n\
         dhcp-leasefile={}\n\
         \n\
         # Log DHCP transactions\n\
         log-dhcp\n\
         \n\
         # Don't use /etc/hosts\n\
         no-hosts\n\
         \n\
         # Don't read /etc/resolv.conf\n\
         no-resolv\n\
         \n\
         # Upstream DNS\n",
        network_id,
        vni,
        interface,
        dhcp_start,
        dhcp_end,
        netmask,
        lease_time,
        gateway,
        dns_servers.join(","),
        lease_file_path(network_id),
    );
    for dns in dns_servers {
        config.push_str(&format!("server={}\n", dns));
    }

    if !reservations.is_empty() {
        config.push_str("\n# Static DHCP reservations\n");
        for res in reservations {
            if res.mac.is_empty() || res.ip.is_empty() {
                continue;
            }
            if res.hostname.is_empty() {
                config.push_str(&format!("dhcp-host={},{}\n", res.mac, res.ip));
            } else {
                config.push_str(&format!("dhcp-host={},{},{}\n", res.mac, res.ip, res.hostname));
            }
        }
    }

    config
}

/// Parse a dnsmasq lease file: `expiry mac ip hostname [client_id]` per
/// line. A `*` hostname renders empty; expiry 0 means infinite.
pub fn parse_leases(contents: &str) -> Vec<Lease> {
    let mut leases = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let expires: i64 = fields[0].parse().unwrap_or(0);
        let expires_at = if expires > 0 {
            chrono::DateTime::from_timestamp(expires, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| "infinite".to_string())
        } else {
            "infinite".to_string()
        };
        leases.push(Lease {
            expires,
            mac: fields[1].to_string(),
            ip: fields[2].to_string(),
            hostname: if fields[3] == "*" {
                String::new()
            } else {
                fields[3].to_string()
            },
            client_id: fields.get(4).map(|s| s.to_string()),
            expires_at,
        });
    }
    leases
}

pub struct DhcpManager {
    configs: BTreeMap<u32, DhcpConfig>,
    state_file: PathBuf,
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
    install_timeout: Duration,
}

impl DhcpManager {
    pub fn new(
        state_file: PathBuf,
        runner: Arc<dyn CommandRunner>,
        command_timeout: Duration,
        install_timeout: Duration,
    ) -> Self {
        DhcpManager {
            configs: BTreeMap::new(),
            state_file,
            runner,
            command_timeout,
            install_timeout,
        }
    }

    pub fn load(&mut self) -> Result<usize> {
        let persisted: Option<PersistedDhcp> = persist::load_json(&self.state_file)?;
        let Some(persisted) = persisted else {
            info!(file = %self.state_file.display(), "no persisted DHCP state");
            return Ok(0);
        };
        for (key, config) in persisted.dhcp_configs {
            match key.parse::<u32>() {
                Ok(network_id) => {
                    self.configs.insert(network_id, config);
                }
                Err(_) => warn!(key = %key, "ignoring DHCP entry with malformed network id"),
            }
        }
        info!(count = self.configs.len(), "loaded DHCP configurations");
        Ok(self.configs.len())
    }

    pub fn save(&self) -> Result<()> {
        let persisted = PersistedDhcp {
            dhcp_configs: self
                .configs
                .iter()
                .map(|(id, config)| (id.to_string(), config.clone()))
                .collect(),
            last_updated: Utc::now().to_rfc3339(),
        };
        persist::write_json(&self.state_file, &persisted)
    }

    pub fn get(&self, network_id: u32) -> Option<&DhcpConfig> {
        self.configs.get(&network_id)
    }

    pub fn is_enabled(&self, network_id: u32) -> bool {
        self.configs.contains_key(&network_id)
    }

    pub fn enabled_count(&self) -> usize {
        self.configs.len()
    }

    async fn run(&self, target: &ExecTarget, command: &str) -> crate::executor::CommandOutput {
        self.runner
            .execute(target, command, self.command_timeout)
            .await
    }

    /// Install dnsmasq when absent, using the host's package family.
    /// Callers may invoke this ahead of [`DhcpManager::enable`] so the slow
    /// install happens before any registry lock is taken; the re-check
    /// inside `enable` is then a single fast probe.
    pub async fn ensure_dnsmasq(&self, target: &ExecTarget) -> Result<()> {
        if self.run(target, "which dnsmasq").await.success() {
            return Ok(());
        }

        let os_release = self.run(target, "cat /etc/os-release").await;
        if !os_release.success() {
            return Err(ReciraError::CommandFailed(
                "failed to detect OS for dnsmasq install".to_string(),
            ));
        }
        let os_id = os_release
            .stdout
            .lines()
            .find_map(|line| line.strip_prefix("ID="))
            .map(|v| v.trim_matches('"').to_lowercase())
            .unwrap_or_default();

        let install = match OsFamily::from_os_id(&os_id) {
            Some(OsFamily::Debian) => "DEBIAN_FRONTEND=noninteractive apt-get install -y dnsmasq",
            Some(OsFamily::Rhel) => "yum install -y dnsmasq",
            None => {
                return Err(ReciraError::CommandFailed(format!(
                    "unsupported OS for dnsmasq install: {}",
                    os_id
                )));
            }
        };

        info!(target = target.label(), os = %os_id, "installing dnsmasq");
        let out = self
            .runner
            .execute(target, install, self.install_timeout)
            .await;
        if !out.success() {
            return Err(ReciraError::CommandFailed(format!(
                "dnsmasq install failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Create the internal gateway port on the member bridge and address
    /// it. Safe to repeat: an existing port and address are reused.
    async fn ensure_gateway_port(
        &self,
        target: &ExecTarget,
        bridge: &str,
        port: &str,
        gateway: &str,
        prefix: &str,
    ) -> Result<()> {
        let listing = self
            .run(target, &format!("ovs-vsctl list-ports {}", bridge))
            .await;
        let exists = listing.success() && listing.stdout.lines().any(|l| l.trim() == port);

        if !exists {
            let add = self
                .run(
                    target,
                    &format!(
                        "ovs-vsctl add-port {bridge} {port} -- set interface {port} type=internal"
                    ),
                )
                .await;
            if !add.success() {
                return Err(ReciraError::CommandFailed(format!(
                    "failed to create gateway port {}: {}",
                    port,
                    add.stderr.trim()
                )));
            }
            info!(port, bridge, "created internal gateway port");
        }

        // The address may already be assigned from a previous enable.
        let _ = self
            .run(
                target,
                &format!("ip addr add {}/{} dev {} 2>/dev/null || true", gateway, prefix, port),
            )
            .await;

        let up = self.run(target, &format!("ip link set {} up", port)).await;
        if !up.success() {
            return Err(ReciraError::CommandFailed(format!(
                "failed to bring up {}: {}",
                port,
                up.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Ship the rendered config over stdin into `tee`; the payload is the
    /// exact file bytes, no shell quoting involved.
    async fn deploy_config(&self, target: &ExecTarget, path: &str, content: &str) -> Result<()> {
        let command = format!("mkdir -p /etc/dnsmasq.d /var/lib/misc && tee {} >/dev/null", path);
        let out = self
            .runner
            .execute_with_input(target, &command, content.as_bytes(), self.command_timeout)
            .await;
        if !out.success() {
            return Err(ReciraError::CommandFailed(format!(
                "failed to write dnsmasq config {}: {}",
                path,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn restart_dnsmasq(&self, target: &ExecTarget) -> Result<()> {
        let restart = self.run(target, "systemctl restart dnsmasq").await;
        if !restart.success() {
            let start = self.run(target, "systemctl start dnsmasq").await;
            if !start.success() {
                return Err(ReciraError::CommandFailed(format!(
                    "failed to start dnsmasq: {}",
                    start.stderr.trim()
                )));
            }
        }
        Ok(())
    }

    fn resolve_target(&self, registry: &HostRegistry, host_ip: &str) -> Result<ExecTarget> {
        let host = registry
            .find_by_ip(host_ip)
            .ok_or_else(|| ReciraError::InvalidRequest(format!("host {} is not registered", host_ip)))?;
        if host.status != HostStatus::Online {
            return Err(ReciraError::HostUnreachable(host_ip.to_string()));
        }
        Ok(host.exec_target())
    }

    /// Enable DHCP for a network on the designated host. Aborts on the
    /// first failing step without rolling back earlier ones.
    pub async fn enable(
        &mut self,
        registry: &mut HostRegistry,
        network: &Network,
        host_ip: &str,
        dhcp_start: &str,
        dhcp_end: &str,
        dns_servers: Option<Vec<String>>,
        lease_time: Option<String>,
    ) -> Result<DhcpConfig> {
        if network.gateway.is_empty() {
            return Err(ReciraError::InvalidRequest(
                "network must have a gateway IP configured".to_string(),
            ));
        }
        if network.subnet.is_empty() {
            return Err(ReciraError::InvalidRequest(
                "network must have a subnet configured".to_string(),
            ));
        }

        let (netmask, prefix) = subnet_netmask(&network.subnet);

        let host = registry
            .find_by_ip(host_ip)
            .ok_or_else(|| ReciraError::InvalidRequest(format!("host {} is not registered", host_ip)))?;
        if host.status != HostStatus::Online {
            return Err(ReciraError::HostUnreachable(host_ip.to_string()));
        }
        let host_id = host.id;
        let target = host.exec_target();

        let bridge = registry
            .switches()
            .into_iter()
            .find(|s| s.host_id == host_id && network.switches.contains(&s.id))
            .map(|s| s.name)
            .ok_or_else(|| {
                ReciraError::InvalidRequest(format!(
                    "no switch on host {} is part of network {}",
                    host_ip, network.id
                ))
            })?;

        let port = gateway_port_name(network.vni);
        let dns_servers = dns_servers.unwrap_or_else(|| {
            DEFAULT_DNS_SERVERS.iter().map(|s| s.to_string()).collect()
        });
        let lease_time = lease_time.unwrap_or_else(|| DEFAULT_LEASE_TIME.to_string());

        info!(
            network = %network.name,
            vni = network.vni,
            host = host_ip,
            bridge = %bridge,
            "enabling DHCP"
        );

        self.ensure_dnsmasq(&target).await?;
        self.ensure_gateway_port(&target, &bridge, &port, &network.gateway, &prefix)
            .await?;

        let reservations = self
            .configs
            .get(&network.id)
            .map(|c| c.reservations.clone())
            .unwrap_or_default();
        let config_path = config_file_path(network.id);
        let rendered = render_config(
            network.id,
            network.vni,
            &port,
            dhcp_start,
            dhcp_end,
            &network.gateway,
            &netmask,
            &lease_time,
            &dns_servers,
            &reservations,
        );
        self.deploy_config(&target, &config_path, &rendered).await?;
        self.restart_dnsmasq(&target).await?;
        let _ = self.run(&target, "systemctl enable dnsmasq").await;

        registry.note_port(host_id, &bridge, &port, true);

        let config = DhcpConfig {
            enabled: true,
            host_ip: host_ip.to_string(),
            bridge,
            port_name: port,
            gateway: network.gateway.clone(),
            dhcp_start: dhcp_start.to_string(),
            dhcp_end: dhcp_end.to_string(),
            netmask,
            lease_time,
            dns_servers,
            reservations,
            config_path,
            enabled_at: Utc::now().to_rfc3339(),
        };
        self.configs.insert(network.id, config.clone());
        self.save()?;

        info!(network = %network.name, "DHCP enabled");
        Ok(config)
    }

    /// Remove the config file, bounce dnsmasq, delete the gateway port,
    /// and drop the stored configuration.
    pub async fn disable(&mut self, registry: &mut HostRegistry, network_id: u32) -> Result<()> {
        let config = self
            .configs
            .get(&network_id)
            .cloned()
            .ok_or(ReciraError::DhcpNotEnabled(network_id))?;

        info!(network_id, host = %config.host_ip, "disabling DHCP");
        match self.resolve_target(registry, &config.host_ip) {
            Ok(target) => {
                let _ = self
                    .run(&target, &format!("rm -f {}", config.config_path))
                    .await;
                let _ = self.run(&target, "systemctl restart dnsmasq").await;
                let _ = self
                    .run(
                        &target,
                        &format!("ovs-vsctl del-port {} {}", config.bridge, config.port_name),
                    )
                    .await;
                let host_id = registry.find_by_ip(&config.host_ip).map(|h| h.id);
                if let Some(host_id) = host_id {
                    registry.note_port(host_id, &config.bridge, &config.port_name, false);
                }
            }
            Err(err) => {
                warn!(network_id, error = %err, "DHCP host unavailable; dropping config anyway");
            }
        }

        self.configs.remove(&network_id);
        self.save()
    }

    /// Add or update a reservation: an existing entry for the same MAC is
    /// replaced, never duplicated. The config is re-rendered, redeployed,
    /// and dnsmasq restarted.
    pub async fn add_reservation(
        &mut self,
        registry: &HostRegistry,
        network: &Network,
        mac: &str,
        ip: &str,
        hostname: &str,
    ) -> Result<Reservation> {
        let mac = normalize_mac(mac);
        let reservation = Reservation {
            mac: mac.clone(),
            ip: ip.to_string(),
            hostname: hostname.to_string(),
        };

        {
            let config = self
                .configs
                .get_mut(&network.id)
                .ok_or(ReciraError::DhcpNotEnabled(network.id))?;
            match config.reservations.iter_mut().find(|r| r.mac == mac) {
                Some(existing) => *existing = reservation.clone(),
                None => config.reservations.push(reservation.clone()),
            }
        }

        self.redeploy(registry, network).await?;
        self.save()?;
        info!(network = %network.name, mac = %mac, ip, "reservation stored");
        Ok(reservation)
    }

    pub async fn delete_reservation(
        &mut self,
        registry: &HostRegistry,
        network: &Network,
        mac: &str,
    ) -> Result<()> {
        let mac = normalize_mac(mac);
        {
            let config = self
                .configs
                .get_mut(&network.id)
                .ok_or(ReciraError::DhcpNotEnabled(network.id))?;
            let before = config.reservations.len();
            config.reservations.retain(|r| r.mac != mac);
            if config.reservations.len() == before {
                return Err(ReciraError::InvalidRequest(format!(
                    "no reservation for {}",
                    mac
                )));
            }
        }

        self.redeploy(registry, network).await?;
        self.save()?;
        info!(network = %network.name, mac = %mac, "reservation removed");
        Ok(())
    }

    async fn redeploy(&self, registry: &HostRegistry, network: &Network) -> Result<()> {
        let config = self
            .configs
            .get(&network.id)
            .ok_or(ReciraError::DhcpNotEnabled(network.id))?;
        let target = self.resolve_target(registry, &config.host_ip)?;

        let rendered = render_config(
            network.id,
            network.vni,
            &config.port_name,
            &config.dhcp_start,
            &config.dhcp_end,
            &config.gateway,
            &config.netmask,
            &config.lease_time,
            &config.dns_servers,
            &config.reservations,
        );
        self.deploy_config(&target, &config.config_path, &rendered)
            .await?;
        self.restart_dnsmasq(&target).await
    }

    /// Read the per-network lease file from the designated host.
    pub async fn leases(&self, registry: &HostRegistry, network_id: u32) -> Result<Vec<Lease>> {
        let config = self
            .configs
            .get(&network_id)
            .ok_or(ReciraError::DhcpNotEnabled(network_id))?;
        let target = self.resolve_target(registry, &config.host_ip)?;

        let out = self
            .run(
                &target,
                &format!("cat {} 2>/dev/null || true", lease_file_path(network_id)),
            )
            .await;
        Ok(parse_leases(&out.stdout))
    }
}
