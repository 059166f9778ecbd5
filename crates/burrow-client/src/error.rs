//! Tunnel client errors

use burrow_auth::AuthError;
use burrow_proto::HelloError;
use burrow_transport::TransportError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Gateway rejected the connection: {0}")]
    Rejected(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid hello response: {0}")]
    Hello(#[from] HelloError),

    #[error("{} forward operation(s) failed: {}", .0.len(), format_failures(.0))]
    ForwardsRejected(Vec<ForwardFailure>),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Tunnel client is closed")]
    Closed,

    #[error("Invalid forwards file: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOp {
    Create,
    Destroy,
}

impl fmt::Display for ForwardOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardOp::Create => f.write_str("create"),
            ForwardOp::Destroy => f.write_str("destroy"),
        }
    }
}

/// One forward the gateway refused to create or destroy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFailure {
    pub op: ForwardOp,
    pub forward: String,
    pub reason: String,
}

impl fmt::Display for ForwardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.op, self.forward, self.reason)
    }
}

fn format_failures(failures: &[ForwardFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
