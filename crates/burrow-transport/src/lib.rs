//! Transport layer for the control connection
//!
//! A [`MuxConnection`] carries control messages and any number of
//! bidirectional sub-connections over a single byte stream (plain TCP or TLS).

pub mod config;
pub mod connector;
pub mod mux;

pub use config::{TlsClientConfig, TlsServerConfig};
pub use connector::{connect, AsyncIo, BoxedIo, Connected, GatewayAddress, GatewayScheme};
pub use mux::{ConnectionStats, IncomingStream, MuxConnection, MuxStream, Role};

use burrow_proto::{MessageError, MuxError};
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid gateway address: {0}")]
    InvalidAddress(String),

    #[error("Frame error: {0}")]
    Mux(#[from] MuxError),

    #[error("{0}")]
    Message(#[from] MessageError),

    #[error("Timed out: {0}")]
    Timeout(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
