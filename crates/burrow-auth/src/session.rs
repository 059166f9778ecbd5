//! Browser sessions for private tunnels
//!
//! After a visitor presents a valid token the gateway sets an HS256-signed
//! session cookie on the tunnel host. The cookie is bound to the tunnel key
//! thumbprint so it cannot be replayed against another tunnel.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::token::TokenError;

pub const SESSION_COOKIE: &str = "burrow-session";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionClaims {
    pub sub: String,
    pub pkt: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct SessionManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionManager {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a session for `subject` on the tunnel with `thumbprint`
    pub fn issue(&self, subject: &str, thumbprint: &str) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: subject.to_string(),
            pkt: thumbprint.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Claims of a valid, unexpired session for this tunnel
    pub fn verify(&self, value: &str, thumbprint: &str) -> Option<SessionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        match decode::<SessionClaims>(value, &self.decoding_key, &validation) {
            Ok(data) if data.claims.pkt == thumbprint => Some(data.claims),
            Ok(_) => {
                debug!("Session cookie belongs to another tunnel");
                None
            }
            Err(e) => {
                debug!("Rejected session cookie: {}", e);
                None
            }
        }
    }

    /// `Set-Cookie` value for a new session
    pub fn set_cookie(&self, value: &str, secure: bool) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax{}",
            SESSION_COOKIE,
            value,
            self.ttl.num_seconds(),
            if secure { "; Secure" } else { "" }
        )
    }

    /// `Set-Cookie` value that removes the session
    pub fn clear_cookie(secure: bool) -> String {
        format!(
            "{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax{}",
            SESSION_COOKIE,
            if secure { "; Secure" } else { "" }
        )
    }
}

/// Find the session cookie in a `Cookie` header
pub fn session_from_cookie_header(header: &str) -> Option<&str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let sessions = SessionManager::new(b"secret", Duration::hours(1));
        let cookie = sessions.issue("alice", "tp-1").unwrap();

        let claims = sessions.verify(&cookie, "tp-1").unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(sessions.verify(&cookie, "tp-2").is_none());
    }

    #[test]
    fn test_wrong_secret_or_expired() {
        let sessions = SessionManager::new(b"secret", Duration::hours(1));
        let cookie = sessions.issue("alice", "tp").unwrap();
        assert!(SessionManager::new(b"other", Duration::hours(1))
            .verify(&cookie, "tp")
            .is_none());

        let expired = SessionManager::new(b"secret", Duration::seconds(-5));
        let old = expired.issue("alice", "tp").unwrap();
        assert!(sessions.verify(&old, "tp").is_none());
    }

    #[test]
    fn test_cookie_header_parsing() {
        assert_eq!(
            session_from_cookie_header("a=1; burrow-session=abc.def; b=2"),
            Some("abc.def")
        );
        assert_eq!(session_from_cookie_header("burrow-session="), None);
        assert_eq!(session_from_cookie_header("other=1"), None);
    }

    #[test]
    fn test_set_cookie_attributes() {
        let sessions = SessionManager::new(b"secret", Duration::minutes(10));
        let header = sessions.set_cookie("v", true);
        assert!(header.starts_with("burrow-session=v;"));
        assert!(header.contains("Max-Age=600"));
        assert!(header.ends_with("; Secure"));
        assert!(SessionManager::clear_cookie(false).contains("Max-Age=0"));
    }
}
