//! `hello` command response
//!
//! The gateway answers `hello` with a JSON object describing the client id and
//! the public URL of every forward. Older gateways describe URLs as
//! `{hostname, port, protocol}` objects and send `baseUrl` instead of `rootUrl`;
//! both shapes are accepted and normalized to URL strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum HelloError {
    #[error("Malformed hello response: {0}")]
    Malformed(String),

    #[error("Invalid tunnel URL for {id}: {reason}")]
    InvalidUrl { id: String, reason: String },
}

/// Normalized `hello` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub client_id: String,
    /// Forward request id (without access suffix) -> public URL
    pub tunnels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
}

/// A tunnel URL as found on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TunnelUrl {
    Url(String),
    Legacy(LegacyBaseUrl),
}

/// Deprecated structured URL shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyBaseUrl {
    pub hostname: String,
    #[serde(default)]
    pub port: Option<LegacyPort>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyPort {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHello {
    client_id: String,
    #[serde(default)]
    tunnels: BTreeMap<String, TunnelUrl>,
    #[serde(default)]
    root_url: Option<String>,
    #[serde(default)]
    base_url: Option<LegacyBaseUrl>,
}

impl LegacyBaseUrl {
    /// Render as `protocol://hostname[:port]`, omitting default ports
    pub fn to_url(&self) -> Result<String, String> {
        let scheme = self.protocol.trim_end_matches(':');
        if scheme.is_empty() {
            return Err("missing protocol".to_string());
        }
        let port = match &self.port {
            None => None,
            Some(LegacyPort::Number(p)) => Some(*p),
            Some(LegacyPort::Text(s)) if s.is_empty() => None,
            Some(LegacyPort::Text(s)) => Some(
                s.parse::<u16>()
                    .map_err(|_| format!("invalid port {:?}", s))?,
            ),
        };
        let port = port.filter(|p| !matches!((scheme, *p), ("http", 80) | ("https", 443)));

        let rendered = match port {
            Some(p) => format!("{}://{}:{}", scheme, self.hostname, p),
            None => format!("{}://{}", scheme, self.hostname),
        };
        url::Url::parse(&rendered).map_err(|e| e.to_string())?;
        Ok(rendered)
    }
}

impl HelloResponse {
    /// Parse and validate a complete response
    pub fn parse(data: &[u8]) -> Result<Self, HelloError> {
        let raw: RawHello =
            serde_json::from_slice(data).map_err(|e| HelloError::Malformed(e.to_string()))?;
        Self::normalize(raw)
    }

    /// Look for a complete response anywhere in `buf`.
    ///
    /// Exec output may be delivered in pieces and interleaved with diagnostic
    /// text, so every `{` is tried as the start of the object. Returns `None`
    /// until a candidate deserializes.
    pub fn find_in(buf: &[u8]) -> Option<Result<Self, HelloError>> {
        buf.iter()
            .enumerate()
            .filter(|(_, b)| **b == b'{')
            .find_map(|(start, _)| {
                serde_json::Deserializer::from_slice(&buf[start..])
                    .into_iter::<RawHello>()
                    .next()
                    .and_then(Result::ok)
            })
            .map(Self::normalize)
    }

    fn normalize(raw: RawHello) -> Result<Self, HelloError> {
        if raw.client_id.is_empty() {
            return Err(HelloError::Malformed("empty clientId".to_string()));
        }

        let root_url = match (raw.root_url, raw.base_url) {
            (Some(root), _) => Some(root),
            (None, Some(base)) => {
                warn!("Gateway sent deprecated baseUrl in hello response; normalizing to rootUrl");
                Some(base.to_url().map_err(|reason| HelloError::InvalidUrl {
                    id: "baseUrl".to_string(),
                    reason,
                })?)
            }
            (None, None) => None,
        };

        let mut tunnels = BTreeMap::new();
        for (id, url) in raw.tunnels {
            let url = match url {
                TunnelUrl::Url(u) => u,
                TunnelUrl::Legacy(legacy) => {
                    warn!(tunnel = %id, "Gateway sent deprecated structured tunnel URL");
                    legacy.to_url().map_err(|reason| HelloError::InvalidUrl {
                        id: id.clone(),
                        reason,
                    })?
                }
            };
            tunnels.insert(id, url);
        }

        Ok(Self {
            client_id: raw.client_id,
            tunnels,
            root_url,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_current_shape() {
        let hello = HelloResponse::parse(
            br#"{"clientId":"abc","rootUrl":"https://abc.gw.test","tunnels":{"web-80":"https://web-80-abc.gw.test"}}"#,
        )
        .unwrap();
        assert_eq!(hello.client_id, "abc");
        assert_eq!(hello.root_url.as_deref(), Some("https://abc.gw.test"));
        assert_eq!(hello.tunnels["web-80"], "https://web-80-abc.gw.test");
    }

    #[test]
    fn test_parse_legacy_shape() {
        let hello = HelloResponse::parse(
            br#"{"clientId":"abc",
                 "baseUrl":{"hostname":"gw.test","port":"","protocol":"https:"},
                 "tunnels":{"web-80":{"hostname":"web-80-abc.gw.test","port":8443,"protocol":"https"}}}"#,
        )
        .unwrap();
        assert_eq!(hello.root_url.as_deref(), Some("https://gw.test"));
        assert_eq!(hello.tunnels["web-80"], "https://web-80-abc.gw.test:8443");
    }

    #[test]
    fn test_missing_client_id_is_malformed() {
        let err = HelloResponse::parse(br#"{"tunnels":{}}"#).unwrap_err();
        assert!(matches!(err, HelloError::Malformed(_)));
    }

    #[test]
    fn test_find_in_split_and_noisy_output() {
        let full = br#"{"clientId":"c1","tunnels":{"api-3000":"http://api-3000-c1.gw.test"}}"#;
        let mut buf = b"warning: something on stderr\n".to_vec();

        let (head, tail) = full.split_at(20);
        buf.extend_from_slice(head);
        assert!(HelloResponse::find_in(&buf).is_none());

        buf.extend_from_slice(tail);
        buf.extend_from_slice(b"\ntrailing noise");
        let hello = HelloResponse::find_in(&buf).unwrap().unwrap();
        assert_eq!(hello.client_id, "c1");
        assert_eq!(hello.tunnels.len(), 1);
    }

    #[test]
    fn test_find_in_skips_unrelated_json() {
        let buf = br#"{"level":"info"} {"clientId":"c2","tunnels":{}}"#;
        let hello = HelloResponse::find_in(buf).unwrap().unwrap();
        assert_eq!(hello.client_id, "c2");
    }

    #[test]
    fn test_serialized_shape_roundtrips() {
        let mut tunnels = BTreeMap::new();
        tunnels.insert("web-80".to_string(), "https://web-80-x.gw.test".to_string());
        let hello = HelloResponse {
            client_id: "x".to_string(),
            tunnels,
            root_url: Some("https://x.gw.test".to_string()),
        };
        assert_eq!(HelloResponse::parse(hello.to_json().as_bytes()).unwrap(), hello);
    }
}
