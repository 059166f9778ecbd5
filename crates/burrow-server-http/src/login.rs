//! Browser login flow for private tunnels
//!
//! 1. A visitor without credentials is sent to `/login` on the base host with
//!    the tunnel host (`env`) and the path they wanted (`returnPath`).
//! 2. `/login` forwards them to the identity provider, passing a callback on
//!    the tunnel host as `redirectTo`.
//! 3. The provider sends them back to `/.burrow/auth?token=...`, which turns
//!    the token into a session cookie and redirects to `returnPath`.

use burrow_router::{routing_label, ActiveTunnel, TunnelRegistry};
use http::StatusCode;
use std::collections::HashMap;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::config::HttpServerConfig;
use crate::gate::AccessGate;
use crate::response::{self, ProxyBody};
use crate::AUTH_CALLBACK_PATH;

pub fn query_params(query: Option<&str>) -> HashMap<String, String> {
    form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

/// Only same-origin absolute paths are followed
pub fn is_safe_return_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.contains('\\')
}

/// Location of the base-host login page for a visitor of `host`
pub fn login_location(config: &HttpServerConfig, host: &str, return_path: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("env", host)
        .append_pair("returnPath", return_path)
        .finish();
    format!(
        "{}://{}/login?{}",
        config.public_scheme, config.base_host, query
    )
}

/// `GET /login?env=<tunnel host>&returnPath=<path>` on the base host
pub fn handle_login(
    config: &HttpServerConfig,
    registry: &TunnelRegistry,
    query: Option<&str>,
) -> http::Response<ProxyBody> {
    let params = query_params(query);
    let Some(env) = params.get("env").filter(|e| !e.is_empty()) else {
        return response::json_error(StatusCode::BAD_REQUEST, "missing_env", None);
    };
    let return_path = params.get("returnPath").map(String::as_str).unwrap_or("/");
    if !is_safe_return_path(return_path) {
        return response::json_error(StatusCode::BAD_REQUEST, "invalid_return_path", None);
    }

    let env = burrow_router::normalize_host(env);
    let label = routing_label(&env).unwrap_or_default();
    // The callback receives the provider's token, so it must stay on our domain
    let tunnel_host = format!("{}.{}", label, config.base_host);
    if env != tunnel_host {
        debug!(env = %env, "Rejecting login for a host outside {}", config.base_host);
        return response::json_error(StatusCode::BAD_REQUEST, "invalid_env", None);
    }
    if registry.get(&label).is_none() {
        return response::json_error(StatusCode::NOT_FOUND, "tunnel_not_found", Some(&label));
    }

    let Some(login_url) = &config.login_url else {
        return response::text(
            StatusCode::SERVICE_UNAVAILABLE,
            "No login provider is configured; use an access token instead",
        );
    };

    let callback_query = form_urlencoded::Serializer::new(String::new())
        .append_pair("returnPath", return_path)
        .finish();
    let callback = format!(
        "{}://{}{}?{}",
        config.public_scheme, tunnel_host, AUTH_CALLBACK_PATH, callback_query
    );
    let redirect_query = form_urlencoded::Serializer::new(String::new())
        .append_pair("redirectTo", &callback)
        .finish();
    let separator = if login_url.contains('?') { '&' } else { '?' };
    let location = format!("{}{}{}", login_url, separator, redirect_query);

    debug!(tunnel = %label, "Redirecting to login provider");
    response::redirect(StatusCode::FOUND, &location, None)
}

/// `GET /.burrow/auth?token=<jwt>&returnPath=<path>` on a tunnel host
pub fn handle_callback(
    gate: &AccessGate,
    tunnel: &ActiveTunnel,
    query: Option<&str>,
) -> http::Response<ProxyBody> {
    let params = query_params(query);
    let return_path = params
        .get("returnPath")
        .map(String::as_str)
        .filter(|p| is_safe_return_path(p))
        .unwrap_or("/");

    let Some(token) = params.get("token").filter(|t| !t.is_empty()) else {
        return response::json_error(StatusCode::BAD_REQUEST, "missing_token", None);
    };

    match gate.login_with_token(tunnel, token) {
        Some(cookie) => {
            info!(tunnel = %tunnel.hostname, "Visitor logged in");
            response::redirect(StatusCode::FOUND, return_path, Some(&cookie))
        }
        None => response::json_error(StatusCode::UNAUTHORIZED, "invalid_token", None),
    }
}

/// `GET /.burrow/logout` on a tunnel host
pub fn handle_logout(gate: &AccessGate) -> http::Response<ProxyBody> {
    let mut response = response::text(StatusCode::OK, "Logged out");
    if let Ok(value) = http::HeaderValue::from_str(&gate.logout_cookie()) {
        response.headers_mut().insert(http::header::SET_COOKIE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_auth::Identity;
    use burrow_inject::RuleSet;
    use burrow_proto::{Access, ForwardRequestId};
    use burrow_router::TcpTarget;
    use std::sync::Arc;

    fn registry_with_tunnel() -> TunnelRegistry {
        let identity = Identity::generate();
        let registry = TunnelRegistry::new();
        registry.set(
            "web-80-abc",
            ActiveTunnel {
                hostname: "web-80-abc".to_string(),
                public_key: identity.public_key().to_vec(),
                public_key_thumbprint: identity.thumbprint(),
                access: Access::Private,
                client_id: identity.client_id(),
                forward_request_id: ForwardRequestId::for_service("web", 80, Access::Private),
                inject: RuleSet::default(),
                target: Arc::new(TcpTarget::new("127.0.0.1:1")),
            },
        );
        registry
    }

    fn idp_config() -> HttpServerConfig {
        HttpServerConfig::default()
            .with_base_host("gw.test")
            .with_public_scheme("https")
            .with_login_url("https://idp.test/login")
    }

    #[test]
    fn test_return_path_validation() {
        assert!(is_safe_return_path("/"));
        assert!(is_safe_return_path("/app?x=1"));
        assert!(!is_safe_return_path("https://evil.test/"));
        assert!(!is_safe_return_path("//evil.test/"));
        assert!(!is_safe_return_path("/\\evil.test"));
        assert!(!is_safe_return_path(""));
    }

    #[test]
    fn test_login_location() {
        let config = HttpServerConfig::default()
            .with_base_host("gw.test")
            .with_public_scheme("https");
        let location = login_location(&config, "web-80-abc.gw.test", "/a b?x=1");
        assert_eq!(
            location,
            "https://gw.test/login?env=web-80-abc.gw.test&returnPath=%2Fa+b%3Fx%3D1"
        );

        let url = url::Url::parse(&location).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["returnPath"], "/a b?x=1");
    }

    #[test]
    fn test_login_redirects_to_tunnel_callback() {
        let registry = registry_with_tunnel();
        let response = handle_login(
            &idp_config(),
            &registry,
            Some("env=WEB-80-abc.gw.test&returnPath=/app"),
        );
        assert_eq!(response.status(), StatusCode::FOUND);

        let location = response.headers()[http::header::LOCATION].to_str().unwrap();
        let url = url::Url::parse(location).unwrap();
        assert_eq!(url.host_str(), Some("idp.test"));
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(
            params["redirectTo"],
            "https://web-80-abc.gw.test/.burrow/auth?returnPath=%2Fapp"
        );
    }

    #[test]
    fn test_login_rejects_env_outside_base_host() {
        let registry = registry_with_tunnel();
        for env in [
            "web-80-abc.evil.test",
            "web-80-abc.gw.test.evil.test",
            "web-80-abc",
            "web-80-abc.x.gw.test",
        ] {
            let query = format!("env={}&returnPath=/", env);
            let response = handle_login(&idp_config(), &registry, Some(&query));
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "env {}", env);
            assert!(response.headers().get(http::header::LOCATION).is_none());
        }
    }

    #[test]
    fn test_login_rejects_unknown_tunnel() {
        let config = HttpServerConfig::default().with_login_url("https://idp.test/login");
        let registry = TunnelRegistry::new();
        let response = handle_login(&config, &registry, Some("env=nope.localhost&returnPath=/"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_login_rejects_open_redirect() {
        let config = HttpServerConfig::default().with_login_url("https://idp.test/login");
        let registry = TunnelRegistry::new();
        let response = handle_login(
            &config,
            &registry,
            Some("env=a.localhost&returnPath=https%3A%2F%2Fevil.test"),
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
