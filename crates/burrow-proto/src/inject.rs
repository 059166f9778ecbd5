//! Script injection rules

use serde::{Deserialize, Serialize};

/// A `<script>` element to insert into proxied HTML responses.
///
/// Attached to a single forward or configured globally on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptInjection {
    pub src: String,
    /// Only inject when the request path matches this regular expression
    #[serde(default)]
    pub path_regex: Option<String>,
    #[serde(default)]
    pub defer: Option<bool>,
    #[serde(default, rename = "async")]
    pub is_async: Option<bool>,
    /// Only inject for forwards of this service port
    #[serde(default)]
    pub port: Option<u16>,
}

impl ScriptInjection {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            path_regex: None,
            defer: None,
            is_async: None,
            port: None,
        }
    }

    pub fn with_path_regex(mut self, regex: impl Into<String>) -> Self {
        self.path_regex = Some(regex.into());
        self
    }

    pub fn with_defer(mut self, defer: bool) -> Self {
        self.defer = Some(defer);
        self
    }

    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = Some(is_async);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Parse a JSON list, as carried in the `x-burrow-inject-scripts` header
    pub fn parse_list(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_str(json)
    }
}
