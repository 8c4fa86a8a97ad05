//! Parsers for the textual output of the OVS command-line tools.
//!
//! Everything the controller knows about a datapath comes from `ovs-vsctl`
//! invocations; these helpers turn that text into typed values. They are
//! deliberately free of I/O so they can be tested against captured dumps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A VXLAN port extracted from an `ovs-vsctl show` dump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VxlanPort {
    pub bridge: String,
    pub port_name: String,
    pub vni: u32,
    pub remote_ip: String,
}

/// Extract the `x.y.z` version from `ovs-vsctl --version` output.
pub fn parse_ovs_version(output: &str) -> String {
    for token in output.split_whitespace() {
        let candidate = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        let parts: Vec<&str> = candidate.split('.').collect();
        if parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
            return candidate.to_string();
        }
    }
    "unknown".to_string()
}

/// Convert the 16-hex-digit datapath-id string to its decimal value.
/// Returns 0 when the field is empty or malformed.
pub fn dpid_from_hex(dpid_hex: &str) -> u64 {
    let trimmed = dpid_hex.trim().trim_matches('"');
    if trimmed.is_empty() {
        return 0;
    }
    u64::from_str_radix(trimmed, 16).unwrap_or(0)
}

/// Split a newline-separated name listing (`list-br`, `list-ports`) into
/// trimmed, non-empty entries.
pub fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_matches('"').to_string())
        .collect()
}

/// Walk an `ovs-vsctl show` dump and collect every VXLAN port that carries
/// both a tunnel key and a remote endpoint.
pub fn parse_vxlan_ports(show_output: &str) -> Vec<VxlanPort> {
    let mut ports = Vec::new();

    let mut current_bridge: Option<String> = None;
    let mut current_port: Option<String> = None;
    let mut current_type: Option<String> = None;
    let mut current_options: HashMap<String, String> = HashMap::new();

    let mut flush =
        |bridge: &Option<String>,
         port: &Option<String>,
         port_type: &Option<String>,
         options: &HashMap<String, String>,
         out: &mut Vec<VxlanPort>| {
            if let (Some(bridge), Some(port)) = (bridge, port) {
                if port_type.as_deref() == Some("vxlan") {
                    let vni = options
                        .get("key")
                        .and_then(|k| k.parse::<u32>().ok())
                        .unwrap_or(0);
                    let remote_ip = options.get("remote_ip").cloned().unwrap_or_default();
                    if vni != 0 && !remote_ip.is_empty() {
                        out.push(VxlanPort {
                            bridge: bridge.clone(),
                            port_name: port.clone(),
                            vni,
                            remote_ip,
                        });
                    }
                }
            }
        };

    for raw_line in show_output.lines() {
        let line = raw_line.trim();

        if let Some(rest) = line.strip_prefix("Bridge ") {
            flush(
                &current_bridge,
                &current_port,
                &current_type,
                &current_options,
                &mut ports,
            );
            current_bridge = Some(rest.trim().trim_matches('"').to_string());
            current_port = None;
            current_type = None;
            current_options.clear();
        } else if let Some(rest) = line.strip_prefix("Port ") {
            flush(
                &current_bridge,
                &current_port,
                &current_type,
                &current_options,
                &mut ports,
            );
            current_port = Some(rest.trim().trim_matches('"').to_string());
            current_type = None;
            current_options.clear();
        } else if let Some(rest) = line.strip_prefix("type: ") {
            current_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("options: ") {
            let inner = rest.trim().trim_start_matches('{').trim_end_matches('}');
            for pair in inner.split(", ") {
                if let Some((key, value)) = pair.split_once('=') {
                    current_options
                        .insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
                }
            }
        }
    }
    flush(
        &current_bridge,
        &current_port,
        &current_type,
        &current_options,
        &mut ports,
    );

    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_DUMP: &str = r#"c8a1e2d4-0000-4c3a-9f00-111122223333
    Bridge br0
        Port br0
            Interface br0
                type: internal
        Port "vxlan1000_2"
            Interface "vxlan1000_2"
                type: vxlan
                options: {key="1000", remote_ip="10.0.0.2"}
        Port eth1
            Interface eth1
    Bridge br-data
        Port "vxlan2000_3"
            Interface "vxlan2000_3"
                type: vxlan
                options: {key="2000", remote_ip="10.0.0.3"}
    ovs_version: "2.17.9"
"#;

    #[test]
    fn version_is_extracted() {
        let output = "ovs-vsctl (Open vSwitch) 2.17.9\nDB Schema 8.3.0\n";
        assert_eq!(parse_ovs_version(output), "2.17.9");
    }

    #[test]
    fn version_falls_back_to_unknown() {
        assert_eq!(parse_ovs_version("command not found"), "unknown");
    }

    #[test]
    fn dpid_converts_from_hex() {
        assert_eq!(dpid_from_hex("\"0000aabbcc001122\""), 0x0000aabbcc001122);
        assert_eq!(dpid_from_hex(""), 0);
        assert_eq!(dpid_from_hex("zz"), 0);
    }

    #[test]
    fn name_list_skips_blanks() {
        assert_eq!(
            parse_name_list("br0\n\n  br1  \n"),
            vec!["br0".to_string(), "br1".to_string()]
        );
    }

    #[test]
    fn vxlan_ports_are_collected_per_bridge() {
        let ports = parse_vxlan_ports(SHOW_DUMP);
        assert_eq!(ports.len(), 2);
        assert_eq!(
            ports[0],
            VxlanPort {
                bridge: "br0".to_string(),
                port_name: "vxlan1000_2".to_string(),
                vni: 1000,
                remote_ip: "10.0.0.2".to_string(),
            }
        );
        assert_eq!(ports[1].bridge, "br-data");
        assert_eq!(ports[1].vni, 2000);
    }

    #[test]
    fn ports_without_key_or_remote_ip_are_ignored() {
        let dump = r#"
    Bridge br0
        Port vxlan0
            Interface vxlan0
                type: vxlan
                options: {remote_ip="10.0.0.9"}
        Port vxlan1
            Interface vxlan1
                type: vxlan
                options: {key="77"}
"#;
        assert!(parse_vxlan_ports(dump).is_empty());
    }
}
