mod support;

use recira::{DhcpManager, ReciraError};
use support::{Harness, TIMEOUT};

/// Registers two hosts, builds the `prod` network (VNI 1000, subnet
/// 10.1.0.0/24, gateway 10.1.0.1), and returns its id.
async fn prod_network(h: &mut Harness) -> u32 {
    h.register("10.0.0.1", "h1", &["br0"]).await;
    h.register("10.0.0.2", "h2", &["br0"]).await;
    h.networks
        .create(
            &mut h.registry,
            &mut h.tunnels,
            "prod",
            vec![1, 2],
            Some(1000),
            Some("10.1.0.0/24".to_string()),
            Some("10.1.0.1".to_string()),
        )
        .await
        .unwrap()
        .id
}

async fn enable_prod(h: &mut Harness, network_id: u32) {
    let network = h.networks.get(network_id).unwrap().clone();
    h.dhcp
        .enable(
            &mut h.registry,
            &network,
            "10.0.0.1",
            "10.1.0.10",
            "10.1.0.250",
            None,
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn enable_provisions_gateway_port_config_and_service() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;

    let host = "10.0.0.1";
    assert!(h.runner.issued(host, "which dnsmasq"));
    assert!(h.runner.issued(
        host,
        "ovs-vsctl add-port br0 vni1000-gw -- set interface vni1000-gw type=internal"
    ));
    assert!(h.runner.issued(
        host,
        "ip addr add 10.1.0.1/24 dev vni1000-gw 2>/dev/null || true"
    ));
    assert!(h.runner.issued(host, "ip link set vni1000-gw up"));
    assert!(h.runner.issued(host, "systemctl restart dnsmasq"));
    assert!(h.runner.issued(host, "systemctl enable dnsmasq"));

    let inputs = h.runner.inputs();
    assert_eq!(inputs.len(), 1);
    let (addr, command, content) = &inputs[0];
    assert_eq!(addr, host);
    assert!(command.contains("tee /etc/dnsmasq.d/recira-network-1.conf"));
    assert!(content.contains("interface=vni1000-gw\n"));
    assert!(content.contains("dhcp-range=10.1.0.10,10.1.0.250,255.255.255.0,24h\n"));
    assert!(content.contains("dhcp-option=option:router,10.1.0.1\n"));
    assert!(content.contains("dhcp-option=option:dns-server,8.8.8.8,8.8.4.4\n"));

    let config = h.dhcp.get(network_id).unwrap();
    assert_eq!(config.port_name, "vni1000-gw");
    assert_eq!(config.bridge, "br0");
    assert_eq!(config.netmask, "255.255.255.0");
    assert_eq!(config.lease_time, "24h");
}

#[tokio::test]
async fn enable_twice_with_identical_arguments_is_equivalent_to_once() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;

    // Second enable reuses the existing gateway port.
    h.runner
        .respond("10.0.0.1", "ovs-vsctl list-ports br0", "vni1000-gw");
    enable_prod(&mut h, network_id).await;

    let inputs = h.runner.inputs();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0].2, inputs[1].2, "config must be rewritten identically");

    let adds: Vec<String> = h
        .runner
        .commands_for("10.0.0.1")
        .into_iter()
        .filter(|c| c.contains("add-port br0 vni1000-gw"))
        .collect();
    assert_eq!(adds.len(), 1, "gateway port is created exactly once");

    let restarts = h
        .runner
        .commands_for("10.0.0.1")
        .into_iter()
        .filter(|c| c == "systemctl restart dnsmasq")
        .count();
    assert_eq!(restarts, 2, "dnsmasq is restarted by both enables");
}

#[tokio::test]
async fn enable_without_gateway_or_subnet_is_rejected() {
    let mut h = Harness::new();
    h.register("10.0.0.1", "h1", &["br0"]).await;
    h.register("10.0.0.2", "h2", &["br0"]).await;
    let network = h
        .networks
        .create(
            &mut h.registry,
            &mut h.tunnels,
            "bare",
            vec![1, 2],
            Some(1000),
            None,
            None,
        )
        .await
        .unwrap();

    let before = h.runner.commands_for("10.0.0.1").len();
    let err = h
        .dhcp
        .enable(
            &mut h.registry,
            &network,
            "10.0.0.1",
            "10.1.0.10",
            "10.1.0.250",
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReciraError::InvalidRequest(_)));
    assert_eq!(
        h.runner.commands_for("10.0.0.1").len(),
        before,
        "a rejected enable must not touch the host"
    );
}

#[tokio::test]
async fn enable_requires_a_member_switch_on_the_designated_host() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    h.register("10.0.0.3", "h3", &["br0"]).await;

    let network = h.networks.get(network_id).unwrap().clone();
    let before = h.runner.commands_for("10.0.0.3").len();
    let err = h
        .dhcp
        .enable(
            &mut h.registry,
            &network,
            "10.0.0.3",
            "10.1.0.10",
            "10.1.0.250",
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReciraError::InvalidRequest(_)));
    assert_eq!(h.runner.commands_for("10.0.0.3").len(), before);
    assert!(h.dhcp.get(network_id).is_none());
}

#[tokio::test]
async fn reservation_add_replaces_an_existing_mac() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;
    let network = h.networks.get(network_id).unwrap().clone();

    h.dhcp
        .add_reservation(
            &h.registry,
            &network,
            "AA-BB-CC-DD-EE-FF",
            "10.1.0.50",
            "web",
        )
        .await
        .unwrap();
    h.dhcp
        .add_reservation(
            &h.registry,
            &network,
            "aa:bb:cc:dd:ee:ff",
            "10.1.0.51",
            "web",
        )
        .await
        .unwrap();

    let config = h.dhcp.get(network_id).unwrap();
    assert_eq!(config.reservations.len(), 1);
    assert_eq!(config.reservations[0].mac, "aa:bb:cc:dd:ee:ff");
    assert_eq!(config.reservations[0].ip, "10.1.0.51");

    let inputs = h.runner.inputs();
    let rendered = &inputs.last().unwrap().2;
    assert_eq!(
        rendered.matches("dhcp-host=aa:bb:cc:dd:ee:ff").count(),
        1,
        "exactly one dhcp-host line for the MAC"
    );
    assert!(rendered.contains("dhcp-host=aa:bb:cc:dd:ee:ff,10.1.0.51,web\n"));
}

#[tokio::test]
async fn reservation_delete_rerenders_without_the_mac() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;
    let network = h.networks.get(network_id).unwrap().clone();

    h.dhcp
        .add_reservation(&h.registry, &network, "aa:bb:cc:dd:ee:ff", "10.1.0.50", "")
        .await
        .unwrap();
    h.dhcp
        .delete_reservation(&h.registry, &network, "AA:BB:CC:DD:EE:FF")
        .await
        .unwrap();

    assert!(h.dhcp.get(network_id).unwrap().reservations.is_empty());
    let inputs = h.runner.inputs();
    let rendered = &inputs.last().unwrap().2;
    assert!(!rendered.contains("dhcp-host="));

    let err = h
        .dhcp
        .delete_reservation(&h.registry, &network, "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap_err();
    assert!(matches!(err, ReciraError::InvalidRequest(_)));
}

#[tokio::test]
async fn leases_come_from_the_per_network_lease_file() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;

    h.runner.respond(
        "10.0.0.1",
        "cat /var/lib/misc/dnsmasq-recira-1.leases 2>/dev/null || true",
        "1754000000 aa:bb:cc:dd:ee:ff 10.1.0.50 web 01:aa:bb:cc:dd:ee:ff\n0 11:22:33:44:55:66 10.1.0.51 *\n",
    );

    let leases = h.dhcp.leases(&h.registry, network_id).await.unwrap();
    assert_eq!(leases.len(), 2);
    assert_eq!(leases[0].ip, "10.1.0.50");
    assert_eq!(leases[0].hostname, "web");
    assert_eq!(leases[1].hostname, "");
    assert_eq!(leases[1].expires_at, "infinite");
}

#[tokio::test]
async fn leases_for_a_network_without_dhcp_fail_cleanly() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    let err = h.dhcp.leases(&h.registry, network_id).await.unwrap_err();
    assert!(matches!(err, ReciraError::DhcpNotEnabled(_)));
}

#[tokio::test]
async fn disable_removes_config_service_binding_and_gateway_port() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;

    h.dhcp.disable(&mut h.registry, network_id).await.unwrap();

    assert!(h
        .runner
        .issued("10.0.0.1", "rm -f /etc/dnsmasq.d/recira-network-1.conf"));
    assert!(h
        .runner
        .issued("10.0.0.1", "ovs-vsctl del-port br0 vni1000-gw"));
    assert!(h.dhcp.get(network_id).is_none());
}

#[tokio::test]
async fn network_delete_cascade_tears_dhcp_down_first() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;

    // The HTTP layer disables DHCP before deleting the network; mirror
    // that ordering here.
    h.dhcp.disable(&mut h.registry, network_id).await.unwrap();
    h.networks
        .delete(&mut h.registry, &mut h.tunnels, network_id)
        .await
        .unwrap();

    let commands = h.runner.all_commands();
    let conf_removed = commands
        .iter()
        .position(|c| c.ends_with("rm -f /etc/dnsmasq.d/recira-network-1.conf"))
        .expect("config file removal issued");
    let gw_removed = commands
        .iter()
        .position(|c| c.ends_with("ovs-vsctl del-port br0 vni1000-gw"))
        .expect("gateway port removal issued");
    let tunnel_removed = commands
        .iter()
        .position(|c| c.ends_with("ovs-vsctl del-port br0 vxlan1000_2"))
        .expect("tunnel port removal issued");
    assert!(conf_removed < tunnel_removed);
    assert!(gw_removed < tunnel_removed);

    assert_eq!(h.networks.count(), 0);
    assert_eq!(h.tunnels.count(), 0);
    assert!(h.dhcp.get(network_id).is_none());
}

#[tokio::test]
async fn dhcp_state_survives_a_reload() {
    let mut h = Harness::new();
    let network_id = prod_network(&mut h).await;
    enable_prod(&mut h, network_id).await;
    let network = h.networks.get(network_id).unwrap().clone();
    h.dhcp
        .add_reservation(&h.registry, &network, "aa:bb:cc:dd:ee:ff", "10.1.0.50", "web")
        .await
        .unwrap();

    let mut reloaded = DhcpManager::new(
        h.dir.path().join("dhcp.json"),
        h.runner.clone(),
        TIMEOUT,
        TIMEOUT,
    );
    assert_eq!(reloaded.load().unwrap(), 1);
    let config = reloaded.get(network_id).unwrap();
    assert_eq!(config.port_name, "vni1000-gw");
    assert_eq!(config.reservations.len(), 1);
}
