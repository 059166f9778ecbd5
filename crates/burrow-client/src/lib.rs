//! Agent side of a burrow tunnel
//!
//! A [`TunnelClient`] owns one authenticated control connection to a gateway.
//! Callers describe the services they want exposed as a [`ForwardSet`] and
//! hand it to [`TunnelClient::update_forwards`]; the client works out what to
//! register or tear down, bridges incoming sub-connections to the local
//! services and reports the public URLs as a [`TunnelState`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod forward;
pub mod reconcile;
pub mod tunnel;

pub use config::{ForwardsFile, ServiceConfig, TunnelClientConfig};
pub use error::{ClientError, ForwardFailure, ForwardOp};
pub use forward::{Forward, ForwardSet, ServiceIdentity, SocketSet};
pub use reconcile::{reconcile, Reconciliation};
pub use tunnel::{TunnelClient, TunnelState};
