//! Public HTTP listener

use burrow_auth::{SessionManager, TokenVerifier};
use burrow_inject::{select_all, RuleSet};
use burrow_proto::ScriptInjection;
use burrow_router::{normalize_host, routing_label, TunnelRegistry};
use http::header::{HOST, SET_COOKIE};
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rand::RngCore;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::HttpServerConfig;
use crate::gate::{AccessDecision, AccessGate};
use crate::login::{self, query_params};
use crate::proxy;
use crate::response::{self, ProxyBody};
use crate::{
    HttpServerError, AUTH_CALLBACK_PATH, AUTH_HINT_PARAM, HEALTH_PATH, INJECT_HEADER, LOGOUT_PATH,
};

const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// Routes visitor requests to tunnels
#[derive(Clone)]
pub struct HttpServer {
    config: Arc<HttpServerConfig>,
    registry: Arc<TunnelRegistry>,
    gate: Arc<AccessGate>,
    global_inject: Arc<RuleSet>,
}

impl HttpServer {
    /// Accepts only self-issued tokens, with sessions signed by a random secret
    pub fn new(config: HttpServerConfig, registry: Arc<TunnelRegistry>) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let sessions =
            SessionManager::new(&secret, chrono::Duration::hours(DEFAULT_SESSION_TTL_HOURS));

        let gate = AccessGate::new(TokenVerifier::default(), sessions, config.secure_cookies());
        let global_inject = RuleSet::compile_lenient(config.global_inject.clone());
        Self {
            config: Arc::new(config),
            registry,
            gate: Arc::new(gate),
            global_inject: Arc::new(global_inject),
        }
    }

    /// Replace the access gate, e.g. to trust an external identity provider
    pub fn with_access(mut self, verifier: TokenVerifier, sessions: SessionManager) -> Self {
        self.gate = Arc::new(AccessGate::new(
            verifier,
            sessions,
            self.config.secure_cookies(),
        ));
        self
    }

    pub fn config(&self) -> &HttpServerConfig {
        &self.config
    }

    /// Bind `config.bind_addr` and serve until the listener fails
    pub async fn start(self) -> Result<(), HttpServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| HttpServerError::Bind {
                address: self.config.bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        info!(
            "HTTP server listening on {} (base host {})",
            listener.local_addr()?,
            self.config.base_host
        );

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(socket, peer).await;
            });
        }
    }

    async fn handle_connection(self, socket: TcpStream, peer: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let io = TokioIo::new(socket);

        let service = hyper::service::service_fn(move |req| {
            let server = self.clone();
            async move { Ok::<_, Infallible>(server.handle(req, peer).await) }
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
        {
            debug!("HTTP connection from {} ended: {}", peer, e);
        }
    }

    /// Answer one visitor request
    pub async fn handle(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        if req.uri().path() == HEALTH_PATH {
            return response::text(StatusCode::OK, "OK");
        }

        let raw_host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));
        let Some(raw_host) = raw_host else {
            return response::json_error(StatusCode::BAD_REQUEST, "missing_host", None);
        };
        let host = normalize_host(&raw_host);

        if host == self.config.base_host {
            return match req.uri().path() {
                "/login" => login::handle_login(&self.config, &self.registry, req.uri().query()),
                _ => response::json_error(StatusCode::NOT_FOUND, "not_found", None),
            };
        }

        let label = routing_label(&host).unwrap_or_default();
        let Some((tunnel, watcher)) = self.registry.get(&label) else {
            debug!("No tunnel for host {}", host);
            return response::json_error(StatusCode::NOT_FOUND, "tunnel_not_found", Some(&label));
        };

        match req.uri().path() {
            AUTH_CALLBACK_PATH => {
                return login::handle_callback(&self.gate, &tunnel, req.uri().query())
            }
            LOGOUT_PATH => return login::handle_logout(&self.gate),
            _ => {}
        }

        let basic_hint = query_params(req.uri().query())
            .get(AUTH_HINT_PARAM)
            .is_some_and(|v| v.eq_ignore_ascii_case("basic"));
        let (path_and_query, _) = proxy::strip_query_param(req.uri(), AUTH_HINT_PARAM);

        let session_cookie = match self.gate.check(&tunnel, req.headers(), basic_hint) {
            AccessDecision::Allow => None,
            AccessDecision::AllowWithCookie(cookie) => Some(cookie),
            AccessDecision::Challenge => return response::basic_challenge(),
            AccessDecision::Login => {
                let location = login::login_location(&self.config, &host, &path_and_query);
                return response::redirect(StatusCode::TEMPORARY_REDIRECT, &location, None);
            }
        };

        let request_inject = take_request_inject(&mut req);
        let path = req.uri().path().to_string();
        let scripts = select_all(
            &[&*self.global_inject, &tunnel.inject, &request_inject],
            &path,
            tunnel.forward_request_id.port(),
        );

        let headers = req.headers_mut();
        proxy::strip_session_cookie(headers);
        proxy::strip_token_authorization(headers);
        proxy::add_forwarded_headers(headers, peer, &self.config.public_scheme, &raw_host);
        proxy::to_origin_form(&mut req, &path_and_query, &raw_host);

        debug!(
            tunnel = %tunnel.hostname,
            "{} {} via {}",
            req.method(),
            path_and_query,
            tunnel.target.describe()
        );

        let mut res = match proxy::forward(
            req,
            tunnel.clone(),
            watcher,
            scripts,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(res) => res,
            Err(e) => {
                warn!(tunnel = %tunnel.hostname, "Proxy error: {}", e);
                return response::json_error(e.status(), "tunnel_unavailable", Some(&label));
            }
        };

        if let Some(cookie) = session_cookie {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                res.headers_mut().append(SET_COOKIE, value);
            }
        }
        res
    }
}

/// Remove the per-request injection header and compile what it carries
fn take_request_inject<B>(req: &mut Request<B>) -> RuleSet {
    let Some(value) = req.headers_mut().remove(INJECT_HEADER) else {
        return RuleSet::default();
    };
    let specs = value
        .to_str()
        .ok()
        .map(ScriptInjection::parse_list)
        .transpose();
    match specs {
        Ok(specs) => RuleSet::compile_lenient(specs.unwrap_or_default()),
        Err(e) => {
            warn!("Ignoring malformed {} header: {}", INJECT_HEADER, e);
            RuleSet::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_request_inject() {
        let mut req = Request::builder()
            .header(INJECT_HEADER, r#"[{"src":"/a.js"},{"src":"/b.js","pathRegex":"^/docs"}]"#)
            .body(())
            .unwrap();
        let rules = take_request_inject(&mut req);
        assert_eq!(rules.len(), 2);
        assert!(!req.headers().contains_key(INJECT_HEADER));
        assert_eq!(rules.select("/", None).len(), 1);
    }

    #[test]
    fn test_malformed_request_inject_is_ignored() {
        let mut req = Request::builder()
            .header(INJECT_HEADER, "not json")
            .body(())
            .unwrap();
        assert!(take_request_inject(&mut req).is_empty());
        assert!(!req.headers().contains_key(INJECT_HEADER));
    }
}
