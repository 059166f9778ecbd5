//! HTTP server configuration

use burrow_proto::ScriptInjection;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// Bare gateway hostname; serves `/login`
    pub base_host: String,
    /// Scheme visitors use to reach the gateway
    pub public_scheme: String,
    /// Identity provider login page. Receives `redirectTo`.
    pub login_url: Option<String>,
    /// Injection specs applied to every tunnel
    pub global_inject: Vec<ScriptInjection>,
    pub connect_timeout: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            base_host: "localhost".to_string(),
            public_scheme: "http".to_string(),
            login_url: None,
            global_inject: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpServerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_base_host(mut self, host: impl Into<String>) -> Self {
        self.base_host = host.into().to_ascii_lowercase();
        self
    }

    pub fn with_public_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.public_scheme = scheme.into();
        self
    }

    pub fn with_login_url(mut self, url: impl Into<String>) -> Self {
        self.login_url = Some(url.into());
        self
    }

    pub fn with_global_inject(mut self, inject: Vec<ScriptInjection>) -> Self {
        self.global_inject = inject;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Session cookies get `Secure` when visitors use HTTPS
    pub fn secure_cookies(&self) -> bool {
        self.public_scheme.eq_ignore_ascii_case("https")
    }
}
