//! Forward identifiers and access levels

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata suffix marking a forward as private
pub const ACCESS_PRIVATE_SUFFIX: &str = "#access=private";

/// Access level advertised for a forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Public,
    Private,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Public => f.write_str("public"),
            Access::Private => f.write_str("private"),
        }
    }
}

/// Opaque forward identifier used on the wire.
///
/// The key (used for equality and lookups) never contains the access suffix;
/// [`ForwardRequestId::wire`] re-attaches it when registering the forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardRequestId {
    key: String,
    access: Access,
}

impl ForwardRequestId {
    pub fn new(key: impl Into<String>, access: Access) -> Self {
        let key = key.into();
        let key = key.strip_prefix('/').unwrap_or(&key).to_string();
        Self {
            key: strip_access_suffix(&key).to_string(),
            access,
        }
    }

    /// Identifier for a service port, e.g. `web-80`
    pub fn for_service(name: &str, port: u16, access: Access) -> Self {
        Self::new(format!("{}-{}", name, port), access)
    }

    /// Parse `/<id>` or `<id>`, with or without the access suffix
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let access = if trimmed.ends_with(ACCESS_PRIVATE_SUFFIX) {
            Access::Private
        } else {
            Access::Public
        };
        Self::new(trimmed, access)
    }

    /// Comparison key: the identifier without any metadata suffix
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Service port, when the key follows the `<name>-<port>` convention
    pub fn port(&self) -> Option<u16> {
        self.key.rsplit_once('-').and_then(|(_, port)| port.parse().ok())
    }

    /// Identifier as sent on the wire, including the access suffix
    pub fn wire(&self) -> String {
        match self.access {
            Access::Public => self.key.clone(),
            Access::Private => format!("{}{}", self.key, ACCESS_PRIVATE_SUFFIX),
        }
    }

    /// Listener path requested from the gateway
    pub fn path(&self) -> String {
        format!("/{}", self.wire())
    }
}

impl fmt::Display for ForwardRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire())
    }
}

/// Remove a trailing `#access=...` suffix and a leading `/`
pub fn strip_access_suffix(raw: &str) -> &str {
    let raw = raw.strip_prefix('/').unwrap_or(raw);
    match raw.find("#access=") {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_suffix_roundtrip() {
        let id = ForwardRequestId::for_service("web", 80, Access::Private);
        assert_eq!(id.key(), "web-80");
        assert_eq!(id.wire(), "web-80#access=private");
        assert_eq!(id.path(), "/web-80#access=private");

        let parsed = ForwardRequestId::parse(&id.path());
        assert_eq!(parsed, id);
        assert_eq!(parsed.access(), Access::Private);
    }

    #[test]
    fn test_public_has_no_suffix() {
        let id = ForwardRequestId::parse("/api-3000");
        assert_eq!(id.access(), Access::Public);
        assert_eq!(id.wire(), "api-3000");
    }

    #[test]
    fn test_port_from_key() {
        assert_eq!(ForwardRequestId::parse("my-app-8080").port(), Some(8080));
        assert_eq!(ForwardRequestId::parse("custom").port(), None);
    }

    #[test]
    fn test_ids_sort_by_key_then_access() {
        let mut ids = vec![
            ForwardRequestId::for_service("web", 80, Access::Private),
            ForwardRequestId::for_service("api", 3000, Access::Public),
            ForwardRequestId::for_service("web", 80, Access::Public),
        ];
        ids.sort();
        assert_eq!(ids[0].key(), "api-3000");
        assert_eq!(ids[1].access(), Access::Public);
        assert_eq!(ids[2].access(), Access::Private);
    }

    #[test]
    fn test_strip_access_suffix() {
        assert_eq!(strip_access_suffix("/db-5432#access=private"), "db-5432");
        assert_eq!(strip_access_suffix("db-5432"), "db-5432");
    }
}
