//! Public HTTP entry point of the gateway
//!
//! Routes each request by the first label of its `Host` header to an active
//! tunnel, enforces access on private tunnels, and proxies the request over a
//! sub-connection of the owning agent. WebSocket upgrades are bridged and HTML
//! responses may get `<script>` tags injected on the way out.

pub mod config;
pub mod gate;
pub mod login;
pub mod proxy;
pub mod response;
pub mod server;

pub use config::HttpServerConfig;
pub use gate::{AccessDecision, AccessGate};
pub use server::HttpServer;

use http::StatusCode;
use thiserror::Error;

/// Query parameter asking for a Basic challenge instead of a login redirect
pub const AUTH_HINT_PARAM: &str = "_burrow_auth_hint";

/// Request header carrying per-request injection specs as JSON
pub const INJECT_HEADER: &str = "x-burrow-inject-scripts";

/// Reserved paths on tunnel hosts
pub const AUTH_CALLBACK_PATH: &str = "/.burrow/auth";
pub const LOGOUT_PATH: &str = "/.burrow/logout";

pub const HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Tunnel target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl HttpServerError {
    /// Status a visitor sees for this failure
    pub fn status(&self) -> StatusCode {
        match self {
            HttpServerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HttpServerError::TargetUnavailable(_) | HttpServerError::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
            HttpServerError::Io(_) | HttpServerError::Bind { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
