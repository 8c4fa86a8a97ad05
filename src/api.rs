//! HTTP/JSON facade over the managers.
//!
//! Mutating handlers serialize through per-component mutexes. Locks are
//! always acquired in the order fabric, dhcp, hosts; package installs run
//! before the hosts lock is taken so a slow provision never blocks
//! unrelated requests.

use crate::config::ControllerConfig;
use crate::dhcp::DhcpManager;
use crate::executor::{CommandRunner, Credential};
use crate::host::HostRegistry;
use crate::network::NetworkManager;
use crate::provision::HostProvisioner;
use crate::tunnel::TunnelManager;
use crate::{ReciraError, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::warn;

/// Tunnels and networks share one lock: their operations must never
/// interleave with each other.
pub struct OverlayFabric {
    pub tunnels: TunnelManager,
    pub networks: NetworkManager,
}

pub struct AppState {
    pub hosts: Mutex<HostRegistry>,
    pub fabric: Mutex<OverlayFabric>,
    pub dhcp: Mutex<DhcpManager>,
    pub runner: Arc<dyn CommandRunner>,
    pub config: ControllerConfig,
    pub started_at: Instant,
}

impl AppState {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.config.install_timeout_secs)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/api/hosts", get(list_hosts))
        .route("/api/hosts/add", post(add_host))
        .route("/api/hosts/provision", post(provision_host))
        .route("/api/hosts/remove", post(remove_host))
        .route("/api/hosts/reattach", post(reattach_host))
        .route("/api/hosts/health", get(host_health))
        .route("/api/hosts/interfaces", get(host_interfaces))
        .route("/api/switches", get(list_switches))
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels/create", post(create_tunnel))
        .route("/api/tunnels/delete", post(delete_tunnel))
        .route("/api/networks", get(list_networks))
        .route("/api/networks/create", post(create_network))
        .route("/api/networks/delete", post(delete_network))
        .route("/api/networks/add_switch", post(add_network_switch))
        .route("/api/dhcp/enable", post(dhcp_enable))
        .route("/api/dhcp/disable", post(dhcp_disable))
        .route("/api/dhcp/config", get(dhcp_config))
        .route("/api/dhcp/leases", get(dhcp_leases))
        .route("/api/dhcp/reservation", post(dhcp_reservation_add))
        .route("/api/dhcp/reservation/delete", post(dhcp_reservation_delete))
        .route("/api/*path", axum::routing::any(unknown_api))
        .fallback_service(ServeDir::new(state.config.frontend_dir.clone()))
        .layer(cors)
        .with_state(state)
}

fn ok(body: Value) -> Json<Value> {
    Json(body)
}

fn fail(err: ReciraError) -> Json<Value> {
    Json(json!({ "success": false, "error": err.to_string() }))
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

async fn unknown_api(Path(path): Path<String>) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Unknown API endpoint", "path": format!("/api/{}", path) })),
    )
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (networks, tunnels) = {
        let fabric = state.fabric.lock().await;
        (fabric.networks.count(), fabric.tunnels.count())
    };
    let dhcp_enabled = state.dhcp.lock().await.enabled_count();
    let (hosts, switches) = {
        let registry = state.hosts.lock().await;
        (registry.host_count(), registry.switches().len())
    };

    ok(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format_uptime(state.started_at.elapsed()),
        "hosts": hosts,
        "switches": switches,
        "networks": networks,
        "tunnels": tunnels,
        "dhcp_enabled": dhcp_enabled,
    }))
}

async fn list_hosts(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.hosts.lock().await;
    let hosts: Vec<Value> = registry.hosts().iter().map(|h| h.sanitized()).collect();
    ok(json!({ "hosts": hosts }))
}

#[derive(Debug, Deserialize)]
struct AddHostRequest {
    ip: String,
    username: String,
    password: String,
    #[serde(default)]
    vxlan_ip: Option<String>,
}

async fn add_host(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddHostRequest>,
) -> Json<Value> {
    let mut registry = state.hosts.lock().await;
    match registry
        .register_remote(
            &req.ip,
            &req.username,
            Credential::Password(req.password),
            req.vxlan_ip,
        )
        .await
    {
        Ok(host) => ok(json!({ "success": true, "host": host.sanitized() })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    ip: String,
    username: String,
    password: String,
    #[serde(default)]
    vxlan_interface: Option<String>,
    #[serde(default)]
    vxlan_ip: Option<String>,
    #[serde(default = "default_true")]
    configure_mtu: bool,
    #[serde(default = "default_true")]
    optimize: bool,
}

fn default_true() -> bool {
    true
}

async fn provision_host(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionRequest>,
) -> Json<Value> {
    let provisioner = HostProvisioner::new(
        state.runner.clone(),
        &req.ip,
        &req.username,
        Credential::Password(req.password.clone()),
        state.command_timeout(),
        state.install_timeout(),
    );

    // The slow part runs without any lock held.
    let report = provisioner
        .provision(req.configure_mtu, req.optimize, req.vxlan_interface.as_deref())
        .await;
    if !report.success {
        return Json(json!({
            "success": false,
            "error": report.errors.join("; "),
            "provision_details": report,
        }));
    }

    let mut registry = state.hosts.lock().await;
    match registry
        .register_remote(
            &req.ip,
            &req.username,
            Credential::Password(req.password),
            req.vxlan_ip,
        )
        .await
    {
        Ok(host) => ok(json!({
            "success": true,
            "provision_details": report,
            "host": host.sanitized(),
        })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct RemoveHostRequest {
    host_id: u32,
    #[serde(default)]
    keep_data: bool,
}

async fn remove_host(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemoveHostRequest>,
) -> Json<Value> {
    // Hold the fabric lock so removal cannot interleave with tunnel or
    // network provisioning that resolves this host.
    let _fabric = state.fabric.lock().await;
    let mut registry = state.hosts.lock().await;
    let result = if req.keep_data {
        registry.detach(req.host_id)
    } else {
        registry.forget(req.host_id)
    };
    match result {
        Ok(()) => ok(json!({ "success": true })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReattachRequest {
    host_id: u32,
}

async fn reattach_host(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReattachRequest>,
) -> Json<Value> {
    let mut registry = state.hosts.lock().await;
    match registry.reattach(req.host_id).await {
        Ok(status) => ok(json!({ "success": true, "status": status })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    ip: String,
    username: String,
    password: String,
}

async fn host_health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Json<Value> {
    let provisioner = HostProvisioner::new(
        state.runner.clone(),
        &query.ip,
        &query.username,
        Credential::Password(query.password),
        state.command_timeout(),
        state.install_timeout(),
    );
    let health = provisioner.health().await;
    ok(json!({ "health": health }))
}

/// Candidate overlay NICs on a host, used when picking a `vxlan_ip`.
async fn host_interfaces(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Json<Value> {
    let provisioner = HostProvisioner::new(
        state.runner.clone(),
        &query.ip,
        &query.username,
        Credential::Password(query.password),
        state.command_timeout(),
        state.install_timeout(),
    );
    match provisioner.scan_interfaces().await {
        Ok(interfaces) => ok(json!({ "success": true, "interfaces": interfaces })),
        Err(err) => fail(err),
    }
}

async fn list_switches(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.hosts.lock().await;
    ok(json!({ "switches": registry.switches() }))
}

async fn list_tunnels(State(state): State<Arc<AppState>>) -> Json<Value> {
    let fabric = state.fabric.lock().await;
    ok(json!({ "tunnels": fabric.tunnels.tunnels() }))
}

#[derive(Debug, Deserialize)]
struct CreateTunnelRequest {
    src_switch_id: u32,
    dst_switch_id: u32,
    #[serde(default)]
    vni: Option<u32>,
}

async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTunnelRequest>,
) -> Json<Value> {
    let mut fabric = state.fabric.lock().await;
    let mut registry = state.hosts.lock().await;
    let reserved = fabric.networks.vnis_in_use();
    let OverlayFabric { tunnels, .. } = &mut *fabric;
    match tunnels
        .create(
            &mut registry,
            req.src_switch_id,
            req.dst_switch_id,
            req.vni,
            &reserved,
        )
        .await
    {
        Ok(tunnel) => ok(json!({ "success": true, "tunnel": tunnel })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteTunnelRequest {
    tunnel_id: u32,
}

async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteTunnelRequest>,
) -> Json<Value> {
    let mut fabric = state.fabric.lock().await;
    let mut registry = state.hosts.lock().await;
    match fabric.tunnels.delete(&mut registry, req.tunnel_id).await {
        Ok(()) => ok(json!({ "success": true })),
        Err(err) => fail(err),
    }
}

async fn list_networks(State(state): State<Arc<AppState>>) -> Json<Value> {
    let fabric = state.fabric.lock().await;
    let dhcp = state.dhcp.lock().await;
    let registry = state.hosts.lock().await;
    let switches = registry.switches();

    let networks: Vec<Value> = fabric
        .networks
        .networks()
        .iter()
        .map(|network| {
            let mut value = serde_json::to_value(network).unwrap_or_default();
            if let Some(map) = value.as_object_mut() {
                let names: Vec<String> = network
                    .switches
                    .iter()
                    .map(|id| {
                        switches
                            .iter()
                            .find(|s| s.id == *id)
                            .map(|s| s.name.clone())
                            .unwrap_or_else(|| format!("Unknown-{}", id))
                    })
                    .collect();
                map.insert("switch_names".to_string(), json!(names));
                map.insert("tunnel_count".to_string(), json!(network.tunnels.len()));
                map.insert(
                    "dhcp_enabled".to_string(),
                    json!(dhcp.is_enabled(network.id)),
                );
                if let Some(config) = dhcp.get(network.id) {
                    map.insert("dhcp_config".to_string(), json!(config));
                }
            }
            value
        })
        .collect();

    ok(json!({ "networks": networks }))
}

#[derive(Debug, Deserialize)]
struct CreateNetworkRequest {
    name: String,
    switches: Vec<u32>,
    #[serde(default)]
    vni: Option<u32>,
    #[serde(default)]
    subnet: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

async fn create_network(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateNetworkRequest>,
) -> Json<Value> {
    let mut fabric = state.fabric.lock().await;
    let mut registry = state.hosts.lock().await;
    let OverlayFabric { tunnels, networks } = &mut *fabric;
    match networks
        .create(
            &mut registry,
            tunnels,
            &req.name,
            req.switches,
            req.vni,
            req.subnet,
            req.gateway,
        )
        .await
    {
        Ok(network) => ok(json!({ "success": true, "network": network })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteNetworkRequest {
    network_id: u32,
}

async fn delete_network(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteNetworkRequest>,
) -> Json<Value> {
    let mut fabric = state.fabric.lock().await;
    let mut dhcp = state.dhcp.lock().await;
    let mut registry = state.hosts.lock().await;

    if fabric.networks.get(req.network_id).is_none() {
        return fail(ReciraError::NetworkNotFound(req.network_id));
    }

    // DHCP rides on the network's gateway port; tear it down first.
    if dhcp.is_enabled(req.network_id) {
        if let Err(err) = dhcp.disable(&mut registry, req.network_id).await {
            warn!(network_id = req.network_id, error = %err, "DHCP teardown during network delete failed");
        }
    }

    let OverlayFabric { tunnels, networks } = &mut *fabric;
    match networks.delete(&mut registry, tunnels, req.network_id).await {
        Ok(_) => ok(json!({ "success": true })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct AddSwitchRequest {
    network_id: u32,
    switch_id: u32,
}

async fn add_network_switch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddSwitchRequest>,
) -> Json<Value> {
    let mut fabric = state.fabric.lock().await;
    let mut registry = state.hosts.lock().await;
    let OverlayFabric { tunnels, networks } = &mut *fabric;
    match networks
        .add_switch(&mut registry, tunnels, req.network_id, req.switch_id)
        .await
    {
        Ok(network) => ok(json!({ "success": true, "network": network })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct DhcpEnableRequest {
    network_id: u32,
    host_ip: String,
    dhcp_start: String,
    dhcp_end: String,
    #[serde(default)]
    dns_servers: Option<Vec<String>>,
    #[serde(default)]
    lease_time: Option<String>,
}

async fn dhcp_enable(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DhcpEnableRequest>,
) -> Json<Value> {
    let network = {
        let fabric = state.fabric.lock().await;
        match fabric.networks.get(req.network_id) {
            Some(network) => network.clone(),
            None => return fail(ReciraError::NetworkNotFound(req.network_id)),
        }
    };

    let mut dhcp = state.dhcp.lock().await;

    // Resolve the designated host and check it carries a member switch
    // before any command reaches it.
    let target = {
        let registry = state.hosts.lock().await;
        let Some(host) = registry.find_by_ip(&req.host_ip) else {
            return fail(ReciraError::InvalidRequest(format!(
                "host {} is not registered",
                req.host_ip
            )));
        };
        let host_id = host.id;
        let target = host.exec_target();
        if !registry
            .switches()
            .iter()
            .any(|s| s.host_id == host_id && network.switches.contains(&s.id))
        {
            return fail(ReciraError::InvalidRequest(format!(
                "no switch on host {} is part of network {}",
                req.host_ip, network.id
            )));
        }
        target
    };

    // Run the potentially slow dnsmasq install while only the dhcp lock is
    // held; host and fabric operations stay unblocked.
    if let Err(err) = dhcp.ensure_dnsmasq(&target).await {
        return fail(err);
    }

    let mut registry = state.hosts.lock().await;
    match dhcp
        .enable(
            &mut registry,
            &network,
            &req.host_ip,
            &req.dhcp_start,
            &req.dhcp_end,
            req.dns_servers,
            req.lease_time,
        )
        .await
    {
        Ok(config) => ok(json!({ "success": true, "dhcp_config": config })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct DhcpDisableRequest {
    network_id: u32,
}

async fn dhcp_disable(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DhcpDisableRequest>,
) -> Json<Value> {
    let mut dhcp = state.dhcp.lock().await;
    let mut registry = state.hosts.lock().await;
    match dhcp.disable(&mut registry, req.network_id).await {
        Ok(()) => ok(json!({ "success": true })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct NetworkIdQuery {
    network_id: u32,
}

async fn dhcp_config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NetworkIdQuery>,
) -> Json<Value> {
    let dhcp = state.dhcp.lock().await;
    match dhcp.get(query.network_id) {
        Some(config) => ok(json!({ "success": true, "dhcp_config": config })),
        None => fail(ReciraError::DhcpNotEnabled(query.network_id)),
    }
}

async fn dhcp_leases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NetworkIdQuery>,
) -> Json<Value> {
    let dhcp = state.dhcp.lock().await;
    let registry = state.hosts.lock().await;
    match dhcp.leases(&registry, query.network_id).await {
        Ok(leases) => ok(json!({ "success": true, "leases": leases })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReservationRequest {
    network_id: u32,
    mac: String,
    ip: String,
    #[serde(default)]
    hostname: String,
}

async fn dhcp_reservation_add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReservationRequest>,
) -> Json<Value> {
    let network = {
        let fabric = state.fabric.lock().await;
        match fabric.networks.get(req.network_id) {
            Some(network) => network.clone(),
            None => return fail(ReciraError::NetworkNotFound(req.network_id)),
        }
    };
    let mut dhcp = state.dhcp.lock().await;
    let registry = state.hosts.lock().await;
    match dhcp
        .add_reservation(&registry, &network, &req.mac, &req.ip, &req.hostname)
        .await
    {
        Ok(reservation) => ok(json!({ "success": true, "reservation": reservation })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReservationDeleteRequest {
    network_id: u32,
    mac: String,
}

async fn dhcp_reservation_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReservationDeleteRequest>,
) -> Json<Value> {
    let network = {
        let fabric = state.fabric.lock().await;
        match fabric.networks.get(req.network_id) {
            Some(network) => network.clone(),
            None => return fail(ReciraError::NetworkNotFound(req.network_id)),
        }
    };
    let mut dhcp = state.dhcp.lock().await;
    let registry = state.hosts.lock().await;
    match dhcp
        .delete_reservation(&registry, &network, &req.mac)
        .await
    {
        Ok(()) => ok(json!({ "success": true })),
        Err(err) => fail(err),
    }
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&state.config.listen).await?;
    tracing::info!(listen = %state.config.listen, "HTTP API listening");
    let app = router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0h 0m 0s");
        assert_eq!(format_uptime(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
