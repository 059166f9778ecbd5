//! Access tokens for private tunnels
//!
//! Tokens are EdDSA (or RS256, for external identity providers) JWTs carrying a
//! `pkt` claim: the thumbprint of the tunnel key they grant access to. Two
//! kinds of issuer are accepted:
//!
//! - self-issued tokens (`iss` = [`SELF_ISSUER`]) signed by the tunnel's own
//!   agent key, so whoever holds the agent key can hand out access
//! - tokens from a configured [`TrustedIssuer`]

use base64::Engine;
use chrono::{Duration, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::identity::Identity;

/// Issuer of tokens signed by the tunnel's own key
pub const SELF_ISSUER: &str = "burrow:agent";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Malformed token")]
    Malformed,

    #[error("Token expired")]
    Expired,

    #[error("Untrusted token issuer: {0}")]
    UntrustedIssuer(String),

    #[error("Token is not valid for this tunnel")]
    WrongTunnel,

    #[error("Invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("Key error: {0}")]
    Key(String),
}

/// JWT claims for tunnel access
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelClaims {
    pub iss: String,
    /// Who the token was issued to
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// Thumbprint of the tunnel key this token grants access to
    pub pkt: String,
}

impl TunnelClaims {
    pub fn new(
        issuer: impl Into<String>,
        subject: impl Into<String>,
        thumbprint: impl Into<String>,
        validity: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            iss: issuer.into(),
            sub: subject.into(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            pkt: thumbprint.into(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    /// Sign with an Ed25519 key
    pub fn sign(&self, key: &Identity) -> Result<String, TokenError> {
        let der = key
            .signing_key()
            .to_pkcs8_der()
            .map_err(|e| TokenError::Key(e.to_string()))?;
        let encoding_key = EncodingKey::from_ed_der(der.as_bytes());
        Ok(encode(&Header::new(Algorithm::EdDSA), self, &encoding_key)?)
    }
}

/// Mint a token for the tunnels of `identity`
pub fn mint_self_issued(
    identity: &Identity,
    subject: &str,
    validity: Duration,
) -> Result<String, TokenError> {
    TunnelClaims::new(SELF_ISSUER, subject, identity.thumbprint(), validity).sign(identity)
}

/// An external identity provider whose tokens are accepted
#[derive(Clone)]
pub struct TrustedIssuer {
    pub issuer: String,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for TrustedIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedIssuer")
            .field("issuer", &self.issuer)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl TrustedIssuer {
    /// From a PEM public key, Ed25519 or RSA
    pub fn from_pem(issuer: impl Into<String>, pem: &[u8]) -> Result<Self, TokenError> {
        let (decoding_key, algorithm) = match DecodingKey::from_ed_pem(pem) {
            Ok(key) => (key, Algorithm::EdDSA),
            Err(_) => (
                DecodingKey::from_rsa_pem(pem).map_err(|e| TokenError::Key(e.to_string()))?,
                Algorithm::RS256,
            ),
        };
        Ok(Self {
            issuer: issuer.into(),
            decoding_key,
            algorithm,
        })
    }

    /// From a raw 32-byte Ed25519 public key
    pub fn from_ed25519(issuer: impl Into<String>, public_key: &[u8]) -> Result<Self, TokenError> {
        Ok(Self {
            issuer: issuer.into(),
            decoding_key: ed25519_decoding_key(public_key)?,
            algorithm: Algorithm::EdDSA,
        })
    }
}

/// Verifies access tokens against a tunnel
#[derive(Debug, Clone, Default)]
pub struct TokenVerifier {
    trusted: Vec<TrustedIssuer>,
}

impl TokenVerifier {
    pub fn new(trusted: Vec<TrustedIssuer>) -> Self {
        Self { trusted }
    }

    pub fn with_issuer(mut self, issuer: TrustedIssuer) -> Self {
        self.trusted.push(issuer);
        self
    }

    /// Verify `token` grants access to the tunnel owned by `tunnel_public_key`
    pub fn verify(
        &self,
        token: &str,
        tunnel_public_key: &[u8],
        tunnel_thumbprint: &str,
    ) -> Result<TunnelClaims, TokenError> {
        let issuer = peek_issuer(token)?;

        let claims = if issuer == SELF_ISSUER {
            let key = ed25519_decoding_key(tunnel_public_key)?;
            decode_claims(token, &key, Algorithm::EdDSA, SELF_ISSUER)?
        } else {
            let trusted = self
                .trusted
                .iter()
                .find(|t| t.issuer == issuer)
                .ok_or_else(|| TokenError::UntrustedIssuer(issuer.clone()))?;
            decode_claims(token, &trusted.decoding_key, trusted.algorithm, &trusted.issuer)?
        };

        if claims.pkt != tunnel_thumbprint {
            debug!(
                "Token for {} presented to tunnel {}",
                claims.pkt, tunnel_thumbprint
            );
            return Err(TokenError::WrongTunnel);
        }
        Ok(claims)
    }
}

fn decode_claims(
    token: &str,
    key: &DecodingKey,
    algorithm: Algorithm,
    issuer: &str,
) -> Result<TunnelClaims, TokenError> {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = true;
    validation.validate_aud = false;
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iss"]);

    let data = decode::<TunnelClaims>(token, key, &validation).map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid(e),
    })?;
    Ok(data.claims)
}

fn ed25519_decoding_key(public_key: &[u8]) -> Result<DecodingKey, TokenError> {
    if public_key.len() != 32 {
        return Err(TokenError::Key(format!(
            "expected a 32-byte Ed25519 key, got {} bytes",
            public_key.len()
        )));
    }
    let x = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public_key);
    DecodingKey::from_ed_components(&x).map_err(|e| TokenError::Key(e.to_string()))
}

#[derive(Deserialize)]
struct IssuerOnly {
    iss: Option<String>,
}

/// Read `iss` without verifying, to pick the verification key
fn peek_issuer(token: &str) -> Result<String, TokenError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };

    let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    let claims: IssuerOnly = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;
    claims.iss.ok_or(TokenError::Malformed)
}
