use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReciraError {
    #[error("Host {0} is unreachable")]
    HostUnreachable(String),
    #[error("Host {0} not found")]
    HostNotFound(u32),
    #[error("Switch {0} not found")]
    SwitchNotFound(u32),
    #[error("Tunnel {0} not found")]
    TunnelNotFound(u32),
    #[error("Network {0} not found")]
    NetworkNotFound(u32),
    #[error("DHCP is not enabled for network {0}")]
    DhcpNotEnabled(u32),
    #[error("VNI {0} is already in use")]
    VniInUse(u32),
    #[error("Remote command failed: {0}")]
    CommandFailed(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<toml::de::Error> for ReciraError {
    fn from(err: toml::de::Error) -> Self {
        ReciraError::ConfigError(err.to_string())
    }
}
