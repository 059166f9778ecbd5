//! Hostname handling for incoming requests

/// Lowercase host without port or trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // IPv6 literal: keep the brackets, drop any port after them
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.rsplit_once(':').map_or(host, |(name, _)| name)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// First DNS label of the `Host` header, which selects the tunnel
pub fn routing_label(host: &str) -> Option<String> {
    let host = normalize_host(host);
    let label = host.split('.').next()?;
    (!label.is_empty()).then(|| label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Web-80-ABC.gw.test:8080"), "web-80-abc.gw.test");
        assert_eq!(normalize_host("gw.test."), "gw.test");
        assert_eq!(normalize_host("[::1]:80"), "[::1]");
    }

    #[test]
    fn test_routing_label() {
        assert_eq!(
            routing_label("web-80-abc.gw.test:443").as_deref(),
            Some("web-80-abc")
        );
        assert_eq!(routing_label("localhost").as_deref(), Some("localhost"));
        assert_eq!(routing_label(""), None);
    }
}
