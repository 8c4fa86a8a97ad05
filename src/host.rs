//! Host registry: the authoritative record of every machine whose OVS
//! datapaths this controller manages.
//!
//! The local machine is discovered at startup; remote machines are
//! registered over SSH. Remote host records (including their credentials)
//! persist to a single JSON document and are re-probed when the controller
//! restarts.

use crate::executor::{CommandRunner, Credential, ExecTarget};
use crate::ovs;
use crate::persist;
use crate::{ReciraError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Detached,
    Unreachable,
}

/// One OVS bridge as discovered on a host. The core never mutates bridges
/// directly except by adding or removing tunnel and gateway ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bridge {
    pub name: String,
    pub dpid: u64,
    pub dpid_hex: String,
    #[serde(default)]
    pub controller: String,
    #[serde(default)]
    pub fail_mode: String,
    pub ports: usize,
    /// Advisory only: a controller target is configured and that target
    /// shows up in the `ovs-vsctl show` dump. Not a liveness signal.
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub port_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: u32,
    pub hostname: String,
    /// Management address; also the SSH endpoint for remote hosts.
    pub ip: String,
    /// Overlay tunnel endpoint. Falls back to the management address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxlan_ip: Option<String>,
    #[serde(rename = "type")]
    pub kind: HostKind,
    pub status: HostStatus,
    pub ovs_version: String,
    #[serde(default)]
    pub bridges: Vec<Bridge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Persisted verbatim; a documented lab-grade limitation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(default = "Utc::now")]
    pub created_at: chrono::DateTime<Utc>,
    /// Fields written by a newer controller version survive a round trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Host {
    pub fn overlay_ip(&self) -> &str {
        self.vxlan_ip.as_deref().unwrap_or(&self.ip)
    }

    pub fn exec_target(&self) -> ExecTarget {
        match self.kind {
            HostKind::Local => ExecTarget::Local,
            HostKind::Remote => ExecTarget::Remote {
                address: self.ip.clone(),
                username: self.username.clone().unwrap_or_else(|| "root".to_string()),
                credential: self
                    .credential
                    .clone()
                    .unwrap_or(Credential::Password(String::new())),
            },
        }
    }

    /// Record as exposed over the API: everything except the secret.
    pub fn sanitized(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("credential");
        }
        value
    }
}

/// A flattened (host, bridge) pair. The switch view is recomputed over all
/// online hosts on each listing; ids are stable for a given registry state.
#[derive(Debug, Clone, Serialize)]
pub struct Switch {
    pub id: u32,
    pub dpid: u64,
    pub dpid_hex: String,
    pub name: String,
    pub host_id: u32,
    pub hostname: String,
    pub host_ip: String,
    pub controller: String,
    pub fail_mode: String,
    pub ports: usize,
    pub connected: bool,
    pub port_list: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRegistry {
    hosts: BTreeMap<String, Host>,
    next_host_id: u32,
    last_updated: String,
}

pub struct HostRegistry {
    hosts: BTreeMap<u32, Host>,
    next_host_id: u32,
    state_file: PathBuf,
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
}

impl HostRegistry {
    pub fn new(
        state_file: PathBuf,
        runner: Arc<dyn CommandRunner>,
        command_timeout: Duration,
    ) -> Self {
        HostRegistry {
            hosts: BTreeMap::new(),
            next_host_id: 1,
            state_file,
            runner,
            command_timeout,
        }
    }

    async fn run(&self, target: &ExecTarget, command: &str) -> crate::executor::CommandOutput {
        self.runner
            .execute(target, command, self.command_timeout)
            .await
    }

    /// Probe hostname, OVS version, and bridge inventory on a target.
    /// Any failure of the first two probes aborts with an error.
    async fn probe(&self, target: &ExecTarget) -> Result<(String, String, Vec<Bridge>)> {
        let hostname = self.run(target, "hostname").await;
        if !hostname.success() {
            return Err(ReciraError::HostUnreachable(target.label().to_string()));
        }
        let hostname = hostname.stdout.trim().to_string();

        let version = self.run(target, "ovs-vsctl --version").await;
        if !version.success() {
            return Err(ReciraError::CommandFailed(format!(
                "ovs-vsctl --version failed on {}: {}",
                target.label(),
                version.stderr.trim()
            )));
        }
        let ovs_version = ovs::parse_ovs_version(&version.stdout);

        let bridges = self.enumerate_bridges(target).await?;
        Ok((hostname, ovs_version, bridges))
    }

    /// List bridges and read the per-bridge detail fields. One `ovs-vsctl
    /// show` dump backs the reachable-from-controller heuristic.
    pub async fn enumerate_bridges(&self, target: &ExecTarget) -> Result<Vec<Bridge>> {
        let listing = self.run(target, "ovs-vsctl list-br").await;
        if !listing.success() {
            return Err(ReciraError::CommandFailed(format!(
                "ovs-vsctl list-br failed on {}: {}",
                target.label(),
                listing.stderr.trim()
            )));
        }

        let names = ovs::parse_name_list(&listing.stdout);
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let show = self.run(target, "ovs-vsctl show").await;
        let show_dump = if show.success() {
            show.stdout
        } else {
            String::new()
        };

        let mut bridges = Vec::new();
        for name in names {
            let dpid_out = self
                .run(target, &format!("ovs-vsctl get bridge {} datapath-id", name))
                .await;
            let dpid_hex = dpid_out.stdout.trim().trim_matches('"').to_string();
            let dpid = ovs::dpid_from_hex(&dpid_hex);

            let controller_out = self
                .run(target, &format!("ovs-vsctl get-controller {}", name))
                .await;
            let controller = if controller_out.success() {
                controller_out.stdout.trim().to_string()
            } else {
                String::new()
            };

            let fail_mode_out = self
                .run(target, &format!("ovs-vsctl get-fail-mode {}", name))
                .await;
            // Failed or empty reads keep the OVS default on the local
            // host; a remote bridge we could not read stays unknown.
            let fail_mode_fallback = match target {
                ExecTarget::Local => "standalone",
                ExecTarget::Remote { .. } => "unknown",
            };
            let fail_mode = if fail_mode_out.success() && !fail_mode_out.stdout.trim().is_empty() {
                fail_mode_out.stdout.trim().to_string()
            } else {
                fail_mode_fallback.to_string()
            };

            let ports_out = self
                .run(target, &format!("ovs-vsctl list-ports {}", name))
                .await;
            let port_list = ovs::parse_name_list(&ports_out.stdout);

            let connected = !controller.is_empty() && show_dump.contains(&controller);

            bridges.push(Bridge {
                name,
                dpid,
                dpid_hex,
                controller,
                fail_mode,
                ports: port_list.len(),
                connected,
                port_list,
            });
        }
        Ok(bridges)
    }

    /// Discover the controller's own machine. The resulting record is never
    /// persisted.
    pub async fn discover_localhost(&mut self) -> Result<Host> {
        let target = ExecTarget::Local;
        let (hostname, ovs_version, bridges) = self.probe(&target).await?;

        let ip_out = self.run(&target, "hostname -I").await;
        let ip = ip_out
            .stdout
            .split_whitespace()
            .next()
            .unwrap_or("127.0.0.1")
            .to_string();

        let id = self.allocate_id();
        let host = Host {
            id,
            hostname,
            ip,
            vxlan_ip: None,
            kind: HostKind::Local,
            status: HostStatus::Online,
            ovs_version,
            bridges,
            username: None,
            credential: None,
            created_at: Utc::now(),
            extra: serde_json::Map::new(),
        };
        info!(host = %host.hostname, ip = %host.ip, "discovered local host");
        self.hosts.insert(id, host.clone());
        Ok(host)
    }

    /// Register a remote host. All probes must succeed; on any failure no
    /// partial record is retained.
    pub async fn register_remote(
        &mut self,
        ip: &str,
        username: &str,
        credential: Credential,
        vxlan_ip: Option<String>,
    ) -> Result<Host> {
        if self.hosts.values().any(|h| h.ip == ip) {
            return Err(ReciraError::InvalidRequest(format!(
                "host {} is already registered",
                ip
            )));
        }

        let target = ExecTarget::Remote {
            address: ip.to_string(),
            username: username.to_string(),
            credential: credential.clone(),
        };
        let (hostname, ovs_version, bridges) = self.probe(&target).await?;

        let id = self.allocate_id();
        let host = Host {
            id,
            hostname,
            ip: ip.to_string(),
            vxlan_ip,
            kind: HostKind::Remote,
            status: HostStatus::Online,
            ovs_version,
            bridges,
            username: Some(username.to_string()),
            credential: Some(credential),
            created_at: Utc::now(),
            extra: serde_json::Map::new(),
        };
        info!(host = %host.hostname, ip = %host.ip, id, "registered remote host");
        self.hosts.insert(id, host.clone());
        self.save()?;
        Ok(host)
    }

    /// Refresh a known host's view of the world (hostname, version,
    /// bridges), marking it online or unreachable.
    pub async fn refresh(&mut self, host_id: u32) -> Result<HostStatus> {
        let target = match self.hosts.get(&host_id) {
            Some(host) => host.exec_target(),
            None => return Err(ReciraError::HostNotFound(host_id)),
        };

        let probed = self.probe(&target).await;
        let host = self
            .hosts
            .get_mut(&host_id)
            .ok_or(ReciraError::HostNotFound(host_id))?;
        let status = match probed {
            Ok((hostname, ovs_version, bridges)) => {
                host.hostname = hostname;
                host.ovs_version = ovs_version;
                host.bridges = bridges;
                host.status = HostStatus::Online;
                HostStatus::Online
            }
            Err(err) => {
                warn!(host_id, error = %err, "host did not answer probe");
                host.status = HostStatus::Unreachable;
                HostStatus::Unreachable
            }
        };
        self.save()?;
        Ok(status)
    }

    /// Load persisted remote hosts and re-probe each one that is not
    /// detached. Hosts that answer come back online with fresh bridge
    /// state; the rest are kept as unreachable.
    pub async fn load_and_reconnect(&mut self) -> Result<usize> {
        let persisted: Option<PersistedRegistry> = persist::load_json(&self.state_file)?;
        let Some(persisted) = persisted else {
            info!(file = %self.state_file.display(), "no persisted host registry");
            return Ok(0);
        };

        let mut max_id = 0;
        for (_, host) in persisted.hosts {
            max_id = max_id.max(host.id);
            self.hosts.insert(host.id, host);
        }
        self.next_host_id = persisted.next_host_id.max(max_id + 1);

        let ids: Vec<u32> = self
            .hosts
            .values()
            .filter(|h| h.kind == HostKind::Remote && h.status != HostStatus::Detached)
            .map(|h| h.id)
            .collect();
        let total = ids.len();
        for id in ids {
            self.refresh(id).await?;
        }
        info!(count = total, "reconnected persisted hosts");
        Ok(total)
    }

    /// Detach: the record and credentials stay, but the host is excluded
    /// from the switch view and from active operations until reattached.
    pub fn detach(&mut self, host_id: u32) -> Result<()> {
        let host = self
            .hosts
            .get_mut(&host_id)
            .ok_or(ReciraError::HostNotFound(host_id))?;
        host.status = HostStatus::Detached;
        info!(host_id, "detached host");
        self.save()
    }

    /// Forget: drop the record entirely. The host's OVS state is untouched.
    pub fn forget(&mut self, host_id: u32) -> Result<()> {
        if self.hosts.remove(&host_id).is_none() {
            return Err(ReciraError::HostNotFound(host_id));
        }
        info!(host_id, "forgot host");
        self.save()
    }

    pub async fn reattach(&mut self, host_id: u32) -> Result<HostStatus> {
        if !self.hosts.contains_key(&host_id) {
            return Err(ReciraError::HostNotFound(host_id));
        }
        self.refresh(host_id).await
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_host_id;
        self.next_host_id += 1;
        id
    }

    pub fn get(&self, host_id: u32) -> Option<&Host> {
        self.hosts.get(&host_id)
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.hosts.values().cloned().collect()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn find_by_ip(&self, ip: &str) -> Option<&Host> {
        self.hosts.values().find(|h| h.ip == ip)
    }

    pub fn find_by_overlay_ip(&self, ip: &str) -> Option<&Host> {
        self.hosts
            .values()
            .find(|h| h.overlay_ip() == ip || h.ip == ip)
    }

    /// Flattened view of every bridge on every online host. Ids start at 1
    /// and follow ascending host id, bridge discovery order.
    pub fn switches(&self) -> Vec<Switch> {
        let mut switches = Vec::new();
        let mut switch_id = 1;
        for host in self.hosts.values() {
            if host.status != HostStatus::Online {
                continue;
            }
            for bridge in &host.bridges {
                switches.push(Switch {
                    id: switch_id,
                    dpid: bridge.dpid,
                    dpid_hex: bridge.dpid_hex.clone(),
                    name: bridge.name.clone(),
                    host_id: host.id,
                    hostname: host.hostname.clone(),
                    host_ip: host.ip.clone(),
                    controller: bridge.controller.clone(),
                    fail_mode: bridge.fail_mode.clone(),
                    ports: bridge.ports,
                    connected: bridge.connected,
                    port_list: bridge.port_list.clone(),
                });
                switch_id += 1;
            }
        }
        switches
    }

    pub fn switch(&self, switch_id: u32) -> Option<Switch> {
        self.switches().into_iter().find(|s| s.id == switch_id)
    }

    /// Record a port added to or removed from a bridge so the in-memory
    /// view stays consistent without a full re-enumeration.
    pub fn note_port(&mut self, host_id: u32, bridge_name: &str, port: &str, added: bool) {
        if let Some(host) = self.hosts.get_mut(&host_id) {
            if let Some(bridge) = host.bridges.iter_mut().find(|b| b.name == bridge_name) {
                if added {
                    if !bridge.port_list.iter().any(|p| p == port) {
                        bridge.port_list.push(port.to_string());
                    }
                } else {
                    bridge.port_list.retain(|p| p != port);
                }
                bridge.ports = bridge.port_list.len();
            }
        }
    }

    /// Write remote hosts to the registry document (temp file + rename).
    /// The local host is never persisted.
    pub fn save(&self) -> Result<()> {
        let persisted = PersistedRegistry {
            hosts: self
                .hosts
                .values()
                .filter(|h| h.kind == HostKind::Remote)
                .map(|h| (h.id.to_string(), h.clone()))
                .collect(),
            next_host_id: self.next_host_id,
            last_updated: Utc::now().to_rfc3339(),
        };
        persist::write_json(&self.state_file, &persisted)
    }
}
