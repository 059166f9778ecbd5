//! Client configuration

use burrow_auth::HostKeyPolicy;
use burrow_proto::{Access, ScriptInjection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ClientError;
use crate::forward::{Forward, ForwardSet, ServiceIdentity};

/// Tunnel client configuration
#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    pub host_key_policy: HostKeyPolicy,
    /// Limit for the whole challenge/response exchange
    pub handshake_timeout: Duration,
    /// Limit for one forward create/destroy acknowledgement
    pub request_timeout: Duration,
    pub hello_timeout: Duration,
}

impl Default for TunnelClientConfig {
    fn default() -> Self {
        Self {
            host_key_policy: HostKeyPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(30),
        }
    }
}

impl TunnelClientConfig {
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// One service entry of the forwards file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub access: Access,
    #[serde(default)]
    pub inject: Vec<ScriptInjection>,
}

/// Static list of services to expose
///
/// ```yaml
/// services:
///   - name: web
///     host: 10.0.0.5
///     ports: [80, 443]
///     access: private
///     inject:
///       - src: https://cdn.example.com/toolbar.js
///         pathRegex: "^/app"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardsFile {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl ForwardsFile {
    pub fn parse(yaml: &str) -> Result<Self, ClientError> {
        let file: ForwardsFile =
            serde_yaml::from_str(yaml).map_err(|e| ClientError::Config(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&yaml)
    }

    fn validate(&self) -> Result<(), ClientError> {
        for service in &self.services {
            if service.name.is_empty()
                || !service
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(ClientError::Config(format!(
                    "service name {:?} must be non-empty and contain only letters, digits and '-'",
                    service.name
                )));
            }
            if service.ports.is_empty() {
                return Err(ClientError::Config(format!(
                    "service {} has no ports",
                    service.name
                )));
            }
        }
        Ok(())
    }

    /// Desired forward set, one forward per service port
    pub fn forwards(&self) -> ForwardSet {
        self.services
            .iter()
            .flat_map(|service| {
                service.ports.iter().map(move |port| {
                    Forward::new(
                        ServiceIdentity::new(&service.name, &service.host, *port),
                        service.access,
                    )
                    .with_inject(service.inject.clone())
                })
            })
            .collect()
    }
}
