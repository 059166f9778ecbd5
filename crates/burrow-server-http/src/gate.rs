//! Access control for private tunnels
//!
//! A visitor gets through with a session cookie minted earlier for the same
//! tunnel key, or with an access token in the `Authorization` header
//! (`Bearer <token>` or `Basic x-burrow-token:<token>`). A valid token mints a
//! fresh session cookie so browsers only need to present it once.

use burrow_auth::{
    session_from_cookie_header, token_from_authorization, SessionManager, TokenVerifier,
};
use burrow_proto::Access;
use burrow_router::ActiveTunnel;
use http::header::{AUTHORIZATION, COOKIE};
use http::HeaderMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// Allowed by token; the response should set this cookie
    AllowWithCookie(String),
    /// Answer with a Basic challenge
    Challenge,
    /// Send the browser through the login flow
    Login,
}

#[derive(Debug, Clone)]
pub struct AccessGate {
    verifier: TokenVerifier,
    sessions: SessionManager,
    secure_cookies: bool,
}

impl AccessGate {
    pub fn new(verifier: TokenVerifier, sessions: SessionManager, secure_cookies: bool) -> Self {
        Self {
            verifier,
            sessions,
            secure_cookies,
        }
    }

    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    /// Decide whether a request may reach `tunnel`
    pub fn check(&self, tunnel: &ActiveTunnel, headers: &HeaderMap, basic_hint: bool) -> AccessDecision {
        if tunnel.access == Access::Public {
            return AccessDecision::Allow;
        }

        let session = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_from_cookie_header);
        if let Some(value) = session {
            if self
                .sessions
                .verify(value, &tunnel.public_key_thumbprint)
                .is_some()
            {
                return AccessDecision::Allow;
            }
        }

        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(token_from_authorization);
        if let Some(token) = token {
            if let Some(cookie) = self.login_with_token(tunnel, &token) {
                return AccessDecision::AllowWithCookie(cookie);
            }
        }

        if basic_hint {
            AccessDecision::Challenge
        } else {
            AccessDecision::Login
        }
    }

    /// Verify `token` for `tunnel` and mint a session cookie for it
    pub fn login_with_token(&self, tunnel: &ActiveTunnel, token: &str) -> Option<String> {
        let claims = match self.verifier.verify(
            token,
            &tunnel.public_key,
            &tunnel.public_key_thumbprint,
        ) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(tunnel = %tunnel.hostname, "Rejected access token: {}", e);
                return None;
            }
        };

        match self
            .sessions
            .issue(&claims.sub, &tunnel.public_key_thumbprint)
        {
            Ok(session) => {
                debug!(tunnel = %tunnel.hostname, subject = %claims.sub, "Session issued");
                Some(self.sessions.set_cookie(&session, self.secure_cookies))
            }
            Err(e) => {
                warn!("Failed to issue session: {}", e);
                None
            }
        }
    }

    pub fn logout_cookie(&self) -> String {
        SessionManager::clear_cookie(self.secure_cookies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use burrow_auth::{mint_self_issued, Identity};
    use burrow_inject::RuleSet;
    use burrow_proto::ForwardRequestId;
    use burrow_router::TcpTarget;
    use http::HeaderValue;
    use std::sync::Arc;

    fn tunnel(identity: &Identity, access: Access) -> ActiveTunnel {
        ActiveTunnel {
            hostname: "web-80-abc".to_string(),
            public_key: identity.public_key().to_vec(),
            public_key_thumbprint: identity.thumbprint(),
            access,
            client_id: identity.client_id(),
            forward_request_id: ForwardRequestId::for_service("web", 80, access),
            inject: RuleSet::default(),
            target: Arc::new(TcpTarget::new("127.0.0.1:1")),
        }
    }

    fn gate() -> AccessGate {
        AccessGate::new(
            TokenVerifier::default(),
            SessionManager::new(b"test-secret", chrono::Duration::hours(1)),
            false,
        )
    }

    fn headers(name: http::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_public_tunnel_is_open() {
        let identity = Identity::generate();
        let decision = gate().check(&tunnel(&identity, Access::Public), &HeaderMap::new(), false);
        assert_eq!(decision, AccessDecision::Allow);
    }

    #[test]
    fn test_private_without_credentials() {
        let identity = Identity::generate();
        let tunnel = tunnel(&identity, Access::Private);
        assert_eq!(gate().check(&tunnel, &HeaderMap::new(), false), AccessDecision::Login);
        assert_eq!(gate().check(&tunnel, &HeaderMap::new(), true), AccessDecision::Challenge);
    }

    #[test]
    fn test_bearer_token_sets_cookie() {
        let identity = Identity::generate();
        let tunnel = tunnel(&identity, Access::Private);
        let token = mint_self_issued(&identity, "alice", chrono::Duration::minutes(5)).unwrap();

        let decision = gate().check(
            &tunnel,
            &headers(AUTHORIZATION, &format!("Bearer {}", token)),
            false,
        );
        match decision {
            AccessDecision::AllowWithCookie(cookie) => {
                assert!(cookie.starts_with("burrow-session="));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_basic_token_user() {
        let identity = Identity::generate();
        let tunnel = tunnel(&identity, Access::Private);
        let token = mint_self_issued(&identity, "bob", chrono::Duration::minutes(5)).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("x-burrow-token:{}", token));

        let decision = gate().check(
            &tunnel,
            &headers(AUTHORIZATION, &format!("Basic {}", encoded)),
            true,
        );
        assert!(matches!(decision, AccessDecision::AllowWithCookie(_)));
    }

    #[test]
    fn test_token_for_other_tunnel_is_refused() {
        let owner = Identity::generate();
        let stranger = Identity::generate();
        let tunnel = tunnel(&owner, Access::Private);
        let token = mint_self_issued(&stranger, "eve", chrono::Duration::minutes(5)).unwrap();

        let decision = gate().check(
            &tunnel,
            &headers(AUTHORIZATION, &format!("Bearer {}", token)),
            true,
        );
        assert_eq!(decision, AccessDecision::Challenge);
    }

    #[test]
    fn test_session_cookie_allows() {
        let identity = Identity::generate();
        let tunnel = tunnel(&identity, Access::Private);
        let gate = gate();
        let session = SessionManager::new(b"test-secret", chrono::Duration::hours(1))
            .issue("alice", &identity.thumbprint())
            .unwrap();

        let decision = gate.check(
            &tunnel,
            &headers(COOKIE, &format!("theme=dark; burrow-session={}", session)),
            false,
        );
        assert_eq!(decision, AccessDecision::Allow);
    }
}
