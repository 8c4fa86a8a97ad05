//! Virtual network layer: named overlays that provision a full mesh of
//! VXLAN tunnels between their member switches.

use crate::host::HostRegistry;
use crate::persist;
use crate::tunnel::TunnelManager;
use crate::{ReciraError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: u32,
    pub name: String,
    pub vni: u32,
    /// CIDR notation; empty when the network has no addressing.
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub switches: Vec<u32>,
    pub created_at: String,
    /// Tunnels actually realized for this network. Pairs whose creation
    /// failed are absent; the mesh is re-completed by operator action.
    #[serde(default)]
    pub tunnels: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedNetworks {
    networks: Vec<Network>,
    next_network_id: u32,
    next_vni: u32,
    last_updated: String,
}

pub struct NetworkManager {
    networks: BTreeMap<u32, Network>,
    next_network_id: u32,
    next_vni: u32,
    state_file: PathBuf,
}

impl NetworkManager {
    pub fn new(state_file: PathBuf) -> Self {
        NetworkManager {
            networks: BTreeMap::new(),
            next_network_id: 1,
            next_vni: 1000,
            state_file,
        }
    }

    pub fn load(&mut self) -> Result<usize> {
        let persisted: Option<PersistedNetworks> = persist::load_json(&self.state_file)?;
        let Some(persisted) = persisted else {
            info!(file = %self.state_file.display(), "no persisted networks");
            return Ok(0);
        };
        let count = persisted.networks.len();
        for network in persisted.networks {
            self.networks.insert(network.id, network);
        }
        self.next_network_id = persisted.next_network_id;
        self.next_vni = persisted.next_vni;
        info!(count, "loaded networks");
        Ok(count)
    }

    pub fn save(&self) -> Result<()> {
        let persisted = PersistedNetworks {
            networks: self.networks.values().cloned().collect(),
            next_network_id: self.next_network_id,
            next_vni: self.next_vni,
            last_updated: Utc::now().to_rfc3339(),
        };
        persist::write_json(&self.state_file, &persisted)
    }

    pub fn get(&self, network_id: u32) -> Option<&Network> {
        self.networks.get(&network_id)
    }

    pub fn networks(&self) -> Vec<Network> {
        self.networks.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.networks.len()
    }

    pub fn vnis_in_use(&self) -> HashSet<u32> {
        self.networks.values().map(|n| n.vni).collect()
    }

    /// Next free network VNI: skips VNIs held by any network and by any
    /// known tunnel, including tunnels adopted by discovery.
    fn allocate_vni(&mut self, tunnel_vnis: &HashSet<u32>) -> u32 {
        let used = self.vnis_in_use();
        while used.contains(&self.next_vni) || tunnel_vnis.contains(&self.next_vni) {
            self.next_vni += 1;
        }
        let vni = self.next_vni;
        self.next_vni += 1;
        vni
    }

    /// Create a network and provision its full tunnel mesh. A failing pair
    /// is logged and skipped: hosts can be transiently unreachable, and a
    /// partial mesh is more useful than none.
    pub async fn create(
        &mut self,
        registry: &mut HostRegistry,
        tunnels: &mut TunnelManager,
        name: &str,
        switches: Vec<u32>,
        vni: Option<u32>,
        subnet: Option<String>,
        gateway: Option<String>,
    ) -> Result<Network> {
        if switches.len() < 2 {
            return Err(ReciraError::InvalidRequest(
                "a network needs at least two switches".to_string(),
            ));
        }
        let mut unique = HashSet::new();
        for &switch_id in &switches {
            if !unique.insert(switch_id) {
                return Err(ReciraError::InvalidRequest(format!(
                    "switch {} listed more than once",
                    switch_id
                )));
            }
            if registry.switch(switch_id).is_none() {
                return Err(ReciraError::SwitchNotFound(switch_id));
            }
        }

        let vni = match vni {
            Some(vni) => {
                if let Some(existing) = self.networks.values().find(|n| n.vni == vni) {
                    warn!(vni, network = %existing.name, "requested VNI already in use");
                    return Err(ReciraError::VniInUse(vni));
                }
                vni
            }
            None => self.allocate_vni(&tunnels.vnis_in_use()),
        };

        info!(name, vni, "creating full-mesh tunnels");
        let reserved: HashSet<u32> = [vni].into_iter().collect();
        let mut created = Vec::new();
        for (i, &src) in switches.iter().enumerate() {
            for &dst in &switches[i + 1..] {
                match tunnels
                    .create(registry, src, dst, Some(vni), &reserved)
                    .await
                {
                    Ok(tunnel) => created.push(tunnel.id),
                    Err(err) => {
                        warn!(src, dst, error = %err, "mesh tunnel creation failed");
                    }
                }
            }
        }

        let network = Network {
            id: self.next_network_id,
            name: name.to_string(),
            vni,
            subnet: subnet.unwrap_or_default(),
            gateway: gateway.unwrap_or_default(),
            switches,
            created_at: Utc::now().to_rfc3339(),
            tunnels: created,
        };
        self.next_network_id += 1;
        self.networks.insert(network.id, network.clone());
        self.save()?;

        info!(
            network = %network.name,
            tunnels = network.tunnels.len(),
            "network created"
        );
        Ok(network)
    }

    /// Tear down every tunnel of the network and drop the record. Tunnel
    /// deletion failures are tolerated the same way creation failures are.
    /// DHCP must already be disabled by the caller.
    pub async fn delete(
        &mut self,
        registry: &mut HostRegistry,
        tunnels: &mut TunnelManager,
        network_id: u32,
    ) -> Result<Network> {
        let network = self
            .networks
            .get(&network_id)
            .cloned()
            .ok_or(ReciraError::NetworkNotFound(network_id))?;

        info!(network = %network.name, vni = network.vni, "deleting network");
        for tunnel_id in &network.tunnels {
            if let Err(err) = tunnels.delete(registry, *tunnel_id).await {
                warn!(tunnel_id, error = %err, "failed to delete network tunnel");
            }
        }

        self.networks.remove(&network_id);
        self.save()?;
        Ok(network)
    }

    /// Add a switch to a network and link it to every existing member.
    pub async fn add_switch(
        &mut self,
        registry: &mut HostRegistry,
        tunnels: &mut TunnelManager,
        network_id: u32,
        switch_id: u32,
    ) -> Result<Network> {
        let network = self
            .networks
            .get(&network_id)
            .ok_or(ReciraError::NetworkNotFound(network_id))?;
        if network.switches.contains(&switch_id) {
            return Err(ReciraError::InvalidRequest(format!(
                "switch {} is already a member of network {}",
                switch_id, network.name
            )));
        }
        if registry.switch(switch_id).is_none() {
            return Err(ReciraError::SwitchNotFound(switch_id));
        }

        let vni = network.vni;
        let members = network.switches.clone();
        let reserved: HashSet<u32> = [vni].into_iter().collect();

        let mut new_tunnels = Vec::new();
        for member in members {
            match tunnels
                .create(registry, switch_id, member, Some(vni), &reserved)
                .await
            {
                Ok(tunnel) => new_tunnels.push(tunnel.id),
                Err(err) => {
                    warn!(switch_id, member, error = %err, "tunnel to existing member failed");
                }
            }
        }

        let network = self
            .networks
            .get_mut(&network_id)
            .ok_or(ReciraError::NetworkNotFound(network_id))?;
        network.switches.push(switch_id);
        network.tunnels.extend(new_tunnels);
        let snapshot = network.clone();
        self.save()?;
        Ok(snapshot)
    }
}
