//! Authentication for burrow agents and tunnel visitors
//!
//! - [`Identity`]: Ed25519 key pairs used by agents and the gateway host, with
//!   the challenge/response transcript signed during the control handshake
//! - [`HostKeyPolicy`]: how an agent decides to trust the gateway host key
//! - [`TokenVerifier`]: JWT access tokens for private tunnels, either
//!   self-issued by the agent key or issued by a trusted identity provider
//! - [`SessionManager`]: browser session cookies minted after a successful login
//! - [`Credentials`]: `Authorization` header parsing

pub mod credentials;
pub mod host_key;
pub mod identity;
pub mod session;
pub mod token;

pub use credentials::{token_from_authorization, Credentials, BASIC_TOKEN_USER};
pub use host_key::{HostKeyCheck, HostKeyPolicy, HostKeyReport};
pub use identity::{
    client_id_for, generate_nonce, thumbprint, verify_transcript, Identity,
    CLIENT_SIGNATURE_LABEL, HOST_SIGNATURE_LABEL, NONCE_LEN,
};
pub use session::{session_from_cookie_header, SessionClaims, SessionManager, SESSION_COOKIE};
pub use token::{
    mint_self_issued, TokenError, TokenVerifier, TrustedIssuer, TunnelClaims, SELF_ISSUER,
};

use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gateway host key {thumbprint} is not trusted")]
    UntrustedHostKey { thumbprint: String },

    #[error("Bad signature from {0}")]
    BadSignature(&'static str),

    #[error(transparent)]
    Token(#[from] TokenError),
}

pub type AuthResult<T> = Result<T, AuthError>;
