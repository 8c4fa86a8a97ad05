pub mod api;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod executor;
pub mod host;
pub mod network;
pub mod ovs;
pub mod persist;
pub mod provision;
pub mod tunnel;

pub use error::ReciraError;

pub type Result<T> = std::result::Result<T, ReciraError>;

// Convenience re-exports for the controller's building blocks
pub use config::ControllerConfig;
pub use dhcp::DhcpManager;
pub use executor::{CommandOutput, CommandRunner, Credential, ExecTarget, ShellExecutor};
pub use host::{Bridge, Host, HostRegistry, HostStatus, Switch};
pub use network::{Network, NetworkManager};
pub use tunnel::{Tunnel, TunnelManager};
