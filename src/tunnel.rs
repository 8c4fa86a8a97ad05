//! VXLAN tunnel fabric: point-to-point overlay links between bridges.
//!
//! A tunnel is a symmetric pair of VXLAN ports, one per endpoint bridge,
//! each keyed with the same VNI and pointing at the peer's overlay
//! address. Port names encode the VNI and the peer's last address octet so
//! several tunnels sharing a VNI can coexist on one bridge.

use crate::executor::{CommandRunner, ExecTarget};
use crate::host::{Host, HostRegistry, HostStatus};
use crate::ovs;
use crate::{ReciraError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: u32,
    pub src_switch_id: u32,
    pub dst_switch_id: u32,
    pub src_host_id: u32,
    pub dst_host_id: u32,
    pub src_switch_name: String,
    pub dst_switch_name: String,
    pub src_host: String,
    pub dst_host: String,
    pub vni: u32,
    pub src_vxlan_ip: String,
    pub dst_vxlan_ip: String,
    pub tunnel_name_src: String,
    pub tunnel_name_dst: String,
    pub status: String,
    #[serde(default)]
    pub discovered: bool,
}

/// Port name on the side that sees `peer_ip` as its remote endpoint.
pub fn port_name(vni: u32, peer_ip: &str) -> String {
    let octet = peer_ip.rsplit('.').next().unwrap_or(peer_ip);
    format!("vxlan{}_{}", vni, octet)
}

pub struct TunnelManager {
    tunnels: BTreeMap<u32, Tunnel>,
    next_tunnel_id: u32,
    next_vni: u32,
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
}

impl TunnelManager {
    pub fn new(runner: Arc<dyn CommandRunner>, command_timeout: Duration) -> Self {
        TunnelManager {
            tunnels: BTreeMap::new(),
            next_tunnel_id: 1,
            next_vni: 100,
            runner,
            command_timeout,
        }
    }

    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.tunnels.values().cloned().collect()
    }

    pub fn get(&self, tunnel_id: u32) -> Option<&Tunnel> {
        self.tunnels.get(&tunnel_id)
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn vnis_in_use(&self) -> HashSet<u32> {
        self.tunnels.values().map(|t| t.vni).collect()
    }

    /// Next free VNI, skipping values held by any known tunnel and by the
    /// caller's additional reservations (network VNIs).
    pub fn allocate_vni(&mut self, reserved: &HashSet<u32>) -> u32 {
        let in_use = self.vnis_in_use();
        while in_use.contains(&self.next_vni) || reserved.contains(&self.next_vni) {
            self.next_vni += 1;
        }
        let vni = self.next_vni;
        self.next_vni += 1;
        vni
    }

    async fn add_vxlan_port(
        &self,
        host: &Host,
        bridge: &str,
        port: &str,
        remote_ip: &str,
        vni: u32,
    ) -> Result<()> {
        let command = format!(
            "ovs-vsctl add-port {bridge} {port} -- set interface {port} type=vxlan options:remote_ip={remote_ip} options:key={vni}",
        );
        let out = self
            .runner
            .execute(&host.exec_target(), &command, self.command_timeout)
            .await;
        if !out.success() {
            return Err(ReciraError::CommandFailed(format!(
                "failed to add port {} on {}:{}: {}",
                port,
                host.hostname,
                bridge,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn del_vxlan_port(&self, target: &ExecTarget, bridge: &str, port: &str) -> bool {
        let command = format!("ovs-vsctl del-port {} {}", bridge, port);
        self.runner
            .execute(target, &command, self.command_timeout)
            .await
            .success()
    }

    /// Create a tunnel between two switches. When `vni` is omitted one is
    /// allocated; `reserved_vnis` carries the VNIs already claimed by
    /// networks. The second port add is rolled back on failure so a half
    /// tunnel never survives.
    pub async fn create(
        &mut self,
        registry: &mut HostRegistry,
        src_switch_id: u32,
        dst_switch_id: u32,
        vni: Option<u32>,
        reserved_vnis: &HashSet<u32>,
    ) -> Result<Tunnel> {
        let src = registry
            .switch(src_switch_id)
            .ok_or(ReciraError::SwitchNotFound(src_switch_id))?;
        let dst = registry
            .switch(dst_switch_id)
            .ok_or(ReciraError::SwitchNotFound(dst_switch_id))?;

        if src.host_id == dst.host_id {
            return Err(ReciraError::InvalidRequest(format!(
                "switches {} and {} reside on the same host; a tunnel needs two hosts",
                src_switch_id, dst_switch_id
            )));
        }

        let src_host = registry
            .get(src.host_id)
            .ok_or(ReciraError::HostNotFound(src.host_id))?
            .clone();
        let dst_host = registry
            .get(dst.host_id)
            .ok_or(ReciraError::HostNotFound(dst.host_id))?
            .clone();

        let vni = match vni {
            Some(vni) => vni,
            None => self.allocate_vni(reserved_vnis),
        };

        let src_ip = src_host.overlay_ip().to_string();
        let dst_ip = dst_host.overlay_ip().to_string();
        let name_src = port_name(vni, &dst_ip);
        let name_dst = port_name(vni, &src_ip);

        info!(
            vni,
            src = %format!("{}@{}", src.name, src_host.hostname),
            dst = %format!("{}@{}", dst.name, dst_host.hostname),
            "creating VXLAN tunnel"
        );

        self.add_vxlan_port(&src_host, &src.name, &name_src, &dst_ip, vni)
            .await?;

        if let Err(err) = self
            .add_vxlan_port(&dst_host, &dst.name, &name_dst, &src_ip, vni)
            .await
        {
            // Roll the first side back so we never leave a half tunnel.
            if !self
                .del_vxlan_port(&src_host.exec_target(), &src.name, &name_src)
                .await
            {
                warn!(
                    port = %name_src,
                    host = %src_host.hostname,
                    "rollback of source port failed"
                );
            }
            return Err(err);
        }

        let tunnel = Tunnel {
            id: self.next_tunnel_id,
            src_switch_id,
            dst_switch_id,
            src_host_id: src_host.id,
            dst_host_id: dst_host.id,
            src_switch_name: src.name.clone(),
            dst_switch_name: dst.name.clone(),
            src_host: src_host.hostname.clone(),
            dst_host: dst_host.hostname.clone(),
            vni,
            src_vxlan_ip: src_ip,
            dst_vxlan_ip: dst_ip,
            tunnel_name_src: name_src.clone(),
            tunnel_name_dst: name_dst.clone(),
            status: "up".to_string(),
            discovered: false,
        };
        self.next_tunnel_id += 1;

        registry.note_port(src_host.id, &src.name, &name_src, true);
        registry.note_port(dst_host.id, &dst.name, &name_dst, true);

        self.tunnels.insert(tunnel.id, tunnel.clone());
        Ok(tunnel)
    }

    /// Delete a tunnel's two ports and drop the record. A missing or
    /// unreachable endpoint host downgrades to a warning; the record is
    /// removed regardless so no dangling state accumulates.
    pub async fn delete(&mut self, registry: &mut HostRegistry, tunnel_id: u32) -> Result<()> {
        let tunnel = self
            .tunnels
            .get(&tunnel_id)
            .cloned()
            .ok_or(ReciraError::TunnelNotFound(tunnel_id))?;

        for (host_id, bridge, port) in [
            (
                tunnel.src_host_id,
                &tunnel.src_switch_name,
                &tunnel.tunnel_name_src,
            ),
            (
                tunnel.dst_host_id,
                &tunnel.dst_switch_name,
                &tunnel.tunnel_name_dst,
            ),
        ] {
            let endpoint = registry
                .get(host_id)
                .filter(|h| h.status == HostStatus::Online)
                .map(|h| (h.exec_target(), h.hostname.clone()));
            match endpoint {
                Some((target, hostname)) => {
                    if self.del_vxlan_port(&target, bridge, port).await {
                        registry.note_port(host_id, bridge, port, false);
                    } else {
                        warn!(tunnel_id, port = %port, host = %hostname, "failed to delete tunnel port");
                    }
                }
                None => {
                    warn!(
                        tunnel_id,
                        host_id, "endpoint host gone or offline; removing tunnel record anyway"
                    );
                }
            }
        }

        self.tunnels.remove(&tunnel_id);
        info!(tunnel_id, "tunnel removed");
        Ok(())
    }

    /// Inspect every online host's `ovs-vsctl show` dump and adopt VXLAN
    /// ports configured out of band. Bidirectional pairs are deduplicated
    /// on `(vni, lower ip, higher ip)`; peers we do not manage are
    /// skipped. The VNI counter advances past everything observed.
    pub async fn discover(&mut self, registry: &HostRegistry) -> usize {
        let mut seen: HashSet<(u32, String, String)> = self
            .tunnels
            .values()
            .map(|t| canonical_key(t.vni, &t.src_vxlan_ip, &t.dst_vxlan_ip))
            .collect();
        let mut discovered = 0;

        let hosts: Vec<Host> = registry
            .hosts()
            .into_iter()
            .filter(|h| h.status == HostStatus::Online)
            .collect();
        let switches = registry.switches();

        for host in &hosts {
            let show = self
                .runner
                .execute(&host.exec_target(), "ovs-vsctl show", self.command_timeout)
                .await;
            if !show.success() {
                warn!(host = %host.hostname, "could not dump OVS state for discovery");
                continue;
            }

            let host_ip = host.overlay_ip().to_string();
            for port in ovs::parse_vxlan_ports(&show.stdout) {
                let key = canonical_key(port.vni, &host_ip, &port.remote_ip);
                if seen.contains(&key) {
                    continue;
                }

                let Some(remote_host) = hosts
                    .iter()
                    .find(|h| h.overlay_ip() == port.remote_ip || h.ip == port.remote_ip)
                else {
                    // Peer is not managed by this controller.
                    continue;
                };

                let Some(src_switch) = switches
                    .iter()
                    .find(|s| s.host_id == host.id && s.name == port.bridge)
                else {
                    continue;
                };
                let Some(dst_switch) = switches.iter().find(|s| s.host_id == remote_host.id)
                else {
                    continue;
                };

                seen.insert(key);

                let tunnel = Tunnel {
                    id: self.next_tunnel_id,
                    src_switch_id: src_switch.id,
                    dst_switch_id: dst_switch.id,
                    src_host_id: host.id,
                    dst_host_id: remote_host.id,
                    src_switch_name: src_switch.name.clone(),
                    dst_switch_name: dst_switch.name.clone(),
                    src_host: host.hostname.clone(),
                    dst_host: remote_host.hostname.clone(),
                    vni: port.vni,
                    src_vxlan_ip: host_ip.clone(),
                    dst_vxlan_ip: port.remote_ip.clone(),
                    tunnel_name_src: port_name(port.vni, &port.remote_ip),
                    tunnel_name_dst: port_name(port.vni, &host_ip),
                    status: "up".to_string(),
                    discovered: true,
                };
                self.tunnels.insert(tunnel.id, tunnel);
                self.next_tunnel_id += 1;
                discovered += 1;

                if port.vni >= self.next_vni {
                    self.next_vni = port.vni + 1;
                }
            }
        }

        info!(discovered, "tunnel discovery finished");
        discovered
    }
}

fn canonical_key(vni: u32, ip_a: &str, ip_b: &str) -> (u32, String, String) {
    if ip_a <= ip_b {
        (vni, ip_a.to_string(), ip_b.to_string())
    } else {
        (vni, ip_b.to_string(), ip_a.to_string())
    }
}
