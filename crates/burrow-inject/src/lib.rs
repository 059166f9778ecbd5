//! Streaming `<script>` injection for proxied HTML responses
//!
//! [`HtmlInjector`] scans a body chunk by chunk for the opening `<head>` (or
//! `<body>`) tag and inserts the configured scripts right after it. Encoded
//! bodies are decoded first and re-encoded with the same encoding by
//! [`Transcoder`]. [`inject_body`] wires both into an HTTP response body.

pub mod body;
pub mod codec;
pub mod injector;
pub mod rules;

pub use body::{inject_body, maybe_inject, should_inject, BoxError, InjectStream};
pub use codec::{ContentEncoding, Transcoder};
pub use injector::{render_scripts, HtmlInjector};
pub use rules::{select_all, InjectionRule, RuleSet};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("Invalid pathRegex {pattern:?}: {source}")]
    InvalidPathRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to decode {encoding} body: {source}")]
    Decode {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {encoding} body: {source}")]
    Encode {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// One injection pass over a response body: decode, inject, re-encode
pub struct InjectTransform {
    transcoder: Transcoder,
    injector: HtmlInjector,
}

impl InjectTransform {
    /// `None` when the encoding cannot be rewritten
    pub fn new(encoding: Option<&str>, scripts: &[burrow_proto::ScriptInjection]) -> Option<Self> {
        let encoding = ContentEncoding::from_header(encoding)?;
        Some(Self {
            transcoder: Transcoder::new(encoding),
            injector: HtmlInjector::new(scripts),
        })
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<bytes::Bytes, InjectError> {
        let decoded = self.transcoder.decode(chunk)?;
        let injected = self.injector.push(&decoded);
        self.transcoder.encode(&injected)
    }

    pub fn finish(&mut self) -> Result<bytes::Bytes, InjectError> {
        let decoded = self.transcoder.finish_decode()?;
        let mut injected = self.injector.push(&decoded).to_vec();
        injected.extend_from_slice(&self.injector.finish());
        let mut out = self.transcoder.encode(&injected)?.to_vec();
        out.extend_from_slice(&self.transcoder.finish_encode()?);
        Ok(out.into())
    }
}
