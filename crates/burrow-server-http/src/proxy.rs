//! Forwarding visitor requests to a tunnel target

use burrow_auth::{session_from_cookie_header, token_from_authorization, SESSION_COOKIE};
use burrow_inject::maybe_inject;
use burrow_proto::ScriptInjection;
use burrow_router::{ActiveTunnel, TunnelWatcher};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, COOKIE, HOST, UPGRADE};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::response::{self, ProxyBody};
use crate::HttpServerError;

/// Headers that only concern a single hop
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && headers.contains_key(UPGRADE)
}

/// Drop hop-by-hop headers, keeping `Connection`/`Upgrade` for upgrades
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    // Headers named in `Connection` are hop-by-hop too
    let listed: Vec<HeaderName> = if keep_upgrade {
        Vec::new()
    } else {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect()
    };
    for name in listed {
        headers.remove(name);
    }

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .filter(|name| !(keep_upgrade && matches!(name.as_str(), "connection" | "upgrade")))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

/// Remove one query parameter, returning the new path and query
pub fn strip_query_param(uri: &Uri, param: &str) -> (String, bool) {
    let path = uri.path();
    let Some(query) = uri.query() else {
        return (path.to_string(), false);
    };

    let mut found = false;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or("");
            let matches = form_urlencoded::parse(name.as_bytes())
                .next()
                .map_or(name == param, |(decoded, _)| decoded == param);
            found |= matches;
            !matches
        })
        .collect();

    if kept.is_empty() {
        (path.to_string(), found)
    } else {
        (format!("{}?{}", path, kept.join("&")), found)
    }
}

/// Keep the gateway session cookie away from the tunneled service
pub fn strip_session_cookie(headers: &mut HeaderMap) {
    let values: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    if !values.iter().any(|v| session_from_cookie_header(v).is_some()) {
        return;
    }

    let prefix = format!("{}=", SESSION_COOKIE);
    let remaining: Vec<&str> = values
        .iter()
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|pair| !pair.is_empty() && !pair.starts_with(&prefix))
        .collect();

    headers.remove(COOKIE);
    if !remaining.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&remaining.join("; ")) {
            headers.insert(COOKIE, value);
        }
    }
}

/// Remove an `Authorization` header that carried a gateway access token
pub fn strip_token_authorization(headers: &mut HeaderMap) {
    let carries_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(token_from_authorization)
        .is_some();
    if carries_token {
        headers.remove(AUTHORIZATION);
    }
}

/// Add `X-Forwarded-*` headers describing the visitor
pub fn add_forwarded_headers(headers: &mut HeaderMap, peer: SocketAddr, scheme: &str, host: &str) {
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.append(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Ok(value) = HeaderValue::from_str(scheme) {
        headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
}

/// Send `req` to the tunnel's target and return its response
///
/// `req` must already be in origin form with its headers prepared. Successful
/// upgrades are bridged in the background until either side closes or the
/// tunnel is deleted.
pub async fn forward(
    mut req: Request<Incoming>,
    tunnel: Arc<ActiveTunnel>,
    watcher: TunnelWatcher,
    scripts: Vec<ScriptInjection>,
    connect_timeout: Duration,
) -> Result<Response<ProxyBody>, HttpServerError> {
    let upgrade = is_upgrade_request(req.headers());
    let visitor_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));
    strip_hop_by_hop(req.headers_mut(), upgrade);

    let stream = match timeout(connect_timeout, tunnel.target.connect()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(HttpServerError::TargetUnavailable(format!(
                "{}: {}",
                tunnel.target.describe(),
                e
            )))
        }
        Err(_) => {
            return Err(HttpServerError::Timeout(format!(
                "connecting to {}",
                tunnel.target.describe()
            )))
        }
    };

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    let hostname = tunnel.hostname.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(tunnel = %hostname, "Target connection error: {}", e);
        }
    });

    let mut res = sender.send_request(req).await?;

    if res.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(visitor_upgrade) = visitor_upgrade {
            let target_upgrade = hyper::upgrade::on(&mut res);
            let hostname = tunnel.hostname.clone();
            tokio::spawn(async move {
                bridge_upgrade(visitor_upgrade, target_upgrade, watcher, &hostname).await;
            });
            return Ok(res.map(|_| response::empty()));
        }
    }

    strip_hop_by_hop(res.headers_mut(), false);
    Ok(maybe_inject(res, &scripts))
}

async fn bridge_upgrade(
    visitor: hyper::upgrade::OnUpgrade,
    target: hyper::upgrade::OnUpgrade,
    watcher: TunnelWatcher,
    hostname: &str,
) {
    let (visitor, target) = match tokio::try_join!(visitor, target) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(tunnel = %hostname, "Upgrade failed: {}", e);
            return;
        }
    };
    let mut visitor = TokioIo::new(visitor);
    let mut target = TokioIo::new(target);

    debug!(tunnel = %hostname, "Upgraded connection bridged");
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut visitor, &mut target) => match result {
            Ok((up, down)) => debug!(
                tunnel = %hostname,
                "Upgraded connection closed ({} bytes up, {} bytes down)",
                up,
                down
            ),
            Err(e) => debug!(tunnel = %hostname, "Upgraded connection error: {}", e),
        },
        _ = watcher.deleted() => {
            debug!(tunnel = %hostname, "Tunnel removed, closing upgraded connection");
        }
    }
}

/// Origin-form URI and a `Host` header for the target
pub fn to_origin_form(req: &mut Request<Incoming>, path_and_query: &str, host: &str) {
    if let Ok(uri) = path_and_query.parse::<Uri>() {
        *req.uri_mut() = uri;
    }
    if !req.headers().contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(host) {
            req.headers_mut().insert(HOST, value);
        }
    }
    // The target always speaks HTTP/1.1
    *req.version_mut() = http::Version::HTTP_11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers, false);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_upgrade_keeps_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        assert!(is_upgrade_request(&headers));

        strip_hop_by_hop(&mut headers, true);
        assert!(headers.contains_key(CONNECTION));
        assert!(headers.contains_key(UPGRADE));
        assert!(!headers.contains_key("keep-alive"));
    }

    #[test]
    fn test_strip_query_param() {
        let uri: Uri = "/app?a=1&_burrow_auth_hint=basic&b=2".parse().unwrap();
        assert_eq!(
            strip_query_param(&uri, "_burrow_auth_hint"),
            ("/app?a=1&b=2".to_string(), true)
        );

        let uri: Uri = "/app?_burrow_auth_hint=basic".parse().unwrap();
        assert_eq!(
            strip_query_param(&uri, "_burrow_auth_hint"),
            ("/app".to_string(), true)
        );

        let uri: Uri = "/app?a=1".parse().unwrap();
        assert_eq!(
            strip_query_param(&uri, "_burrow_auth_hint"),
            ("/app?a=1".to_string(), false)
        );
    }

    #[test]
    fn test_strip_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("a=1; burrow-session=xyz; b=2"));
        strip_session_cookie(&mut headers);
        assert_eq!(headers[COOKIE], "a=1; b=2");

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("burrow-session=xyz"));
        strip_session_cookie(&mut headers);
        assert!(!headers.contains_key(COOKIE));
    }

    #[test]
    fn test_strip_token_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        strip_token_authorization(&mut headers);
        assert!(!headers.contains_key(AUTHORIZATION));

        // Basic credentials for the service itself pass through
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        strip_token_authorization(&mut headers);
        assert!(headers.contains_key(AUTHORIZATION));
    }
}
