//! Tunnel routing for the gateway
//!
//! Maps public hostnames to the active tunnels that serve them and knows how
//! to open a byte stream to each tunnel's target.

pub mod host;
pub mod registry;
pub mod target;

pub use host::{normalize_host, routing_label};
pub use registry::{ActiveTunnel, TunnelRegistry, TunnelWatcher, TxToken};
pub use target::{TargetIo, TargetStream, TcpTarget, TunnelTarget};
