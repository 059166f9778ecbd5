//! Control server configuration

use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    /// Public hostname tunnels are published under, e.g. `gw.example.com`
    pub base_host: String,
    /// Scheme of the published URLs
    pub public_scheme: String,
    /// Agent key thumbprints allowed to connect. `None` accepts any key.
    pub authorized_thumbprints: Option<HashSet<String>>,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self {
            base_host: "localhost".to_string(),
            public_scheme: "http".to_string(),
            authorized_thumbprints: None,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

impl ControlServerConfig {
    pub fn with_base_host(mut self, host: impl Into<String>) -> Self {
        self.base_host = host.into();
        self
    }

    pub fn with_public_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.public_scheme = scheme.into();
        self
    }

    pub fn with_authorized_thumbprints<I, S>(mut self, thumbprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorized_thumbprints = Some(thumbprints.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn is_authorized(&self, thumbprint: &str) -> bool {
        self.authorized_thumbprints
            .as_ref()
            .map_or(true, |allowed| allowed.contains(thumbprint))
    }

    /// `scheme://host`
    pub fn root_url(&self) -> String {
        format!("{}://{}", self.public_scheme, self.base_host)
    }

    /// Public URL of a tunnel label
    pub fn tunnel_url(&self, label: &str) -> String {
        format!("{}://{}.{}", self.public_scheme, label, self.base_host)
    }
}
