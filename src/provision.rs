//! Automated host preparation: OS detection, Open vSwitch installation,
//! MTU tuning for VXLAN, and host health probes.

use crate::executor::{CommandRunner, Credential, ExecTarget};
use crate::ovs;
use crate::{ReciraError, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    Rhel,
}

impl OsFamily {
    /// Map an `/etc/os-release` ID onto a supported package family.
    pub fn from_os_id(id: &str) -> Option<Self> {
        match id {
            "ubuntu" | "debian" => Some(OsFamily::Debian),
            "centos" | "rhel" | "rocky" | "almalinux" => Some(OsFamily::Rhel),
            _ => None,
        }
    }

    fn ovs_service(&self) -> &'static str {
        match self {
            OsFamily::Debian => "openvswitch-switch",
            OsFamily::Rhel => "openvswitch",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OsInfo {
    pub id: String,
    pub version: String,
    pub family: Option<OsFamily>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub success: bool,
    pub ip: String,
    pub os_detected: bool,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub ovs_installed: bool,
    pub ovs_version: Option<String>,
    pub mtu_configured: bool,
    pub optimizations_applied: bool,
    pub vxlan_interface: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostHealth {
    pub timestamp: String,
    pub ip: String,
    pub reachable: bool,
    pub ovs_installed: bool,
    pub ovs_running: bool,
    pub ovs_version: Option<String>,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub uptime: Option<String>,
    pub load_average: Option<String>,
}

/// A candidate overlay NIC found on a host.
#[derive(Debug, Clone, Serialize)]
pub struct HostInterface {
    pub name: String,
    pub ip: String,
    pub prefix: String,
    pub cidr: String,
    pub mtu: String,
    pub state: String,
}

pub struct HostProvisioner {
    runner: Arc<dyn CommandRunner>,
    target: ExecTarget,
    ip: String,
    command_timeout: Duration,
    install_timeout: Duration,
}

impl HostProvisioner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ip: &str,
        username: &str,
        credential: Credential,
        command_timeout: Duration,
        install_timeout: Duration,
    ) -> Self {
        HostProvisioner {
            runner,
            target: ExecTarget::Remote {
                address: ip.to_string(),
                username: username.to_string(),
                credential,
            },
            ip: ip.to_string(),
            command_timeout,
            install_timeout,
        }
    }

    async fn run(&self, command: &str) -> crate::executor::CommandOutput {
        self.runner
            .execute(&self.target, command, self.command_timeout)
            .await
    }

    async fn run_long(&self, command: &str) -> crate::executor::CommandOutput {
        self.runner
            .execute(&self.target, command, self.install_timeout)
            .await
    }

    pub async fn detect_os(&self) -> Result<OsInfo> {
        let out = self.run("cat /etc/os-release").await;
        if !out.success() {
            return Err(ReciraError::HostUnreachable(self.ip.clone()));
        }

        let mut id = String::new();
        let mut version = "unknown".to_string();
        for line in out.stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').to_string();
                match key {
                    "ID" => id = value.to_lowercase(),
                    "VERSION_ID" => version = value,
                    _ => {}
                }
            }
        }

        Ok(OsInfo {
            family: OsFamily::from_os_id(&id),
            id,
            version,
        })
    }

    /// Returns the installed OVS version, or `None` when `ovs-vsctl` is
    /// absent.
    pub async fn check_ovs(&self) -> Option<String> {
        let out = self.run("ovs-vsctl --version").await;
        if out.success() {
            Some(ovs::parse_ovs_version(&out.stdout))
        } else {
            None
        }
    }

    async fn install_ovs(&self, family: OsFamily) -> Result<String> {
        info!(ip = %self.ip, ?family, "installing Open vSwitch");

        match family {
            OsFamily::Debian => {
                let update = self.run_long("apt-get update").await;
                if !update.success() {
                    return Err(ReciraError::CommandFailed(format!(
                        "apt-get update failed: {}",
                        update.stderr.trim()
                    )));
                }
                let install = self
                    .run_long(
                        "DEBIAN_FRONTEND=noninteractive apt-get install -y openvswitch-switch",
                    )
                    .await;
                if !install.success() {
                    return Err(ReciraError::CommandFailed(format!(
                        "openvswitch-switch install failed: {}",
                        install.stderr.trim()
                    )));
                }
            }
            OsFamily::Rhel => {
                let install = self.run_long("yum install -y openvswitch").await;
                if !install.success() {
                    return Err(ReciraError::CommandFailed(format!(
                        "openvswitch install failed: {}",
                        install.stderr.trim()
                    )));
                }
            }
        }

        let service = family.ovs_service();
        let _ = self.run(&format!("systemctl enable {}", service)).await;
        let _ = self.run(&format!("systemctl start {}", service)).await;

        self.check_ovs().await.ok_or_else(|| {
            ReciraError::CommandFailed("OVS installation verification failed".to_string())
        })
    }

    /// Set the MTU on one interface, or on every physical interface when
    /// none is given. Per-interface failures are warnings.
    pub async fn configure_mtu(&self, mtu: u32, target_interface: Option<&str>) -> bool {
        if let Some(iface) = target_interface {
            let out = self.run(&format!("ip link set {} mtu {}", iface, mtu)).await;
            if !out.success() {
                warn!(ip = %self.ip, iface, "failed to set MTU: {}", out.stderr.trim());
            }
            return out.success();
        }

        let listing = self
            .run(r#"ip -o link show | awk -F': ' '{print $2}' | grep -v '^lo\|^ovs\|^docker\|^veth'"#)
            .await;
        if !listing.success() {
            warn!(ip = %self.ip, "could not list interfaces for MTU tuning");
            return false;
        }

        let mut configured = 0;
        for iface in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let out = self.run(&format!("ip link set {} mtu {}", iface, mtu)).await;
            if out.success() {
                configured += 1;
            } else {
                warn!(ip = %self.ip, iface, "failed to set MTU: {}", out.stderr.trim());
            }
        }
        configured > 0
    }

    /// Apply datapath tuning knobs. Failures are logged, never fatal.
    pub async fn optimize_ovs(&self) -> bool {
        let settings = [
            ("other-config:max-idle", "30000"),
            ("other-config:flow-eviction-threshold", "10000"),
        ];
        for (key, value) in settings {
            let out = self
                .run(&format!("ovs-vsctl set Open_vSwitch . {}={}", key, value))
                .await;
            if !out.success() {
                warn!(ip = %self.ip, key, "failed to apply OVS setting: {}", out.stderr.trim());
            }
        }
        true
    }

    pub async fn health(&self) -> HostHealth {
        let mut health = HostHealth {
            timestamp: Utc::now().to_rfc3339(),
            ip: self.ip.clone(),
            reachable: false,
            ovs_installed: false,
            ovs_running: false,
            ovs_version: None,
            os_type: None,
            os_version: None,
            uptime: None,
            load_average: None,
        };

        let ping = self.run("echo ping").await;
        if !ping.success() {
            return health;
        }
        health.reachable = true;

        if let Ok(os) = self.detect_os().await {
            health.os_type = Some(os.id);
            health.os_version = Some(os.version);
        }

        if let Some(version) = self.check_ovs().await {
            health.ovs_installed = true;
            health.ovs_version = Some(version);
            let active = self
                .run("systemctl is-active openvswitch-switch || systemctl is-active openvswitch")
                .await;
            health.ovs_running = active.success() && active.stdout.contains("active");
        }

        let uptime = self.run("uptime -p").await;
        if uptime.success() {
            health.uptime = Some(uptime.stdout.trim().to_string());
        }

        let load = self
            .run(r#"uptime | awk -F'load average:' '{print $2}'"#)
            .await;
        if load.success() {
            health.load_average = Some(load.stdout.trim().to_string());
        }

        health
    }

    /// Enumerate IPv4-bearing interfaces usable as overlay endpoints,
    /// skipping loopback and container plumbing.
    pub async fn scan_interfaces(&self) -> Result<Vec<HostInterface>> {
        let out = self.run("ip -4 -o addr show").await;
        if !out.success() {
            return Err(ReciraError::CommandFailed(
                "failed to query interfaces".to_string(),
            ));
        }

        let mut interfaces = Vec::new();
        for line in out.stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }
            let name = fields[1].to_string();
            if name == "lo" || name.starts_with("docker") || name.starts_with("veth") {
                continue;
            }
            let Some(cidr) = fields.iter().find(|f| f.contains('/')) else {
                continue;
            };
            let Some((ip, prefix)) = cidr.split_once('/') else {
                continue;
            };

            let mtu_out = self
                .run(&format!("cat /sys/class/net/{}/mtu", name))
                .await;
            let mtu = if mtu_out.success() {
                mtu_out.stdout.trim().to_string()
            } else {
                "unknown".to_string()
            };

            let state_out = self
                .run(&format!("cat /sys/class/net/{}/operstate", name))
                .await;
            let state = if state_out.success() {
                state_out.stdout.trim().to_string()
            } else {
                "unknown".to_string()
            };

            interfaces.push(HostInterface {
                name,
                ip: ip.to_string(),
                prefix: prefix.to_string(),
                cidr: cidr.to_string(),
                mtu,
                state,
            });
        }
        Ok(interfaces)
    }

    /// Detect the OS, install OVS when absent, then optionally tune MTU
    /// and apply datapath settings.
    pub async fn provision(
        &self,
        configure_mtu: bool,
        optimize: bool,
        vxlan_interface: Option<&str>,
    ) -> ProvisionReport {
        let mut report = ProvisionReport {
            success: false,
            ip: self.ip.clone(),
            os_detected: false,
            os_type: None,
            os_version: None,
            ovs_installed: false,
            ovs_version: None,
            mtu_configured: false,
            optimizations_applied: false,
            vxlan_interface: vxlan_interface.map(|s| s.to_string()),
            errors: Vec::new(),
        };

        let os = match self.detect_os().await {
            Ok(os) => os,
            Err(err) => {
                report.errors.push(err.to_string());
                return report;
            }
        };
        let Some(family) = os.family else {
            report
                .errors
                .push(format!("unsupported OS: {}", os.id));
            return report;
        };
        report.os_detected = true;
        report.os_type = Some(os.id.clone());
        report.os_version = Some(os.version.clone());

        let version = match self.check_ovs().await {
            Some(version) => version,
            None => match self.install_ovs(family).await {
                Ok(version) => version,
                Err(err) => {
                    report.errors.push(err.to_string());
                    return report;
                }
            },
        };
        report.ovs_installed = true;
        report.ovs_version = Some(version);

        if configure_mtu {
            if self.configure_mtu(9000, vxlan_interface).await {
                report.mtu_configured = true;
            } else {
                report
                    .errors
                    .push("MTU configuration had warnings (non-fatal)".to_string());
            }
        }

        if optimize {
            report.optimizations_applied = self.optimize_ovs().await;
        }

        report.success = true;
        info!(ip = %self.ip, "host provisioning complete");
        report
    }
}
