use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Controller configuration, loadable from a TOML file. Every field has a
/// default so a missing file means "run with defaults".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bind address for the HTTP API.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory served at `/` for the web UI.
    #[serde(default = "default_frontend_dir")]
    pub frontend_dir: PathBuf,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
    #[serde(default = "default_networks_file")]
    pub networks_file: PathBuf,
    #[serde(default = "default_dhcp_file")]
    pub dhcp_file: PathBuf,
    /// Timeout for short remote commands, in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Timeout for package installations, in seconds.
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    /// SSH connect timeout, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_frontend_dir() -> PathBuf {
    PathBuf::from("frontend")
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/tmp/recira-hosts.json")
}

fn default_networks_file() -> PathBuf {
    PathBuf::from("/tmp/recira-networks.json")
}

fn default_dhcp_file() -> PathBuf {
    PathBuf::from("/tmp/recira-dhcp.json")
}

fn default_command_timeout() -> u64 {
    60
}

fn default_install_timeout() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            listen: default_listen(),
            frontend_dir: default_frontend_dir(),
            hosts_file: default_hosts_file(),
            networks_file: default_networks_file(),
            dhcp_file: default_dhcp_file(),
            command_timeout_secs: default_command_timeout(),
            install_timeout_secs: default_install_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ControllerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: ControllerConfig = toml::from_str("listen = \"127.0.0.1:9090\"").unwrap();
        assert_eq!(config.listen, "127.0.0.1:9090");
        assert_eq!(config.hosts_file, PathBuf::from("/tmp/recira-hosts.json"));
        assert_eq!(config.command_timeout_secs, 60);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ControllerConfig::load_or_default("/nonexistent/recira.toml").unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
    }
}
