//! Gateway side of the control connection
//!
//! The [`ControlServer`] accepts agent connections, authenticates them with
//! the gateway host key, and turns their forward requests into entries of the
//! shared [`burrow_router::TunnelRegistry`].

pub mod config;
pub mod handshake;
pub mod server;
pub mod session;
pub mod target;

pub use config::ControlServerConfig;
pub use handshake::{accept_handshake, AgentIdentity};
pub use server::ControlServer;
pub use target::ForwardTarget;

use burrow_auth::AuthError;
use burrow_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Agent rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Timed out: {0}")]
    Timeout(&'static str),
}
