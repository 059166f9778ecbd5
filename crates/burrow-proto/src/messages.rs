//! Control messages exchanged on stream 0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inject::ScriptInjection;

/// Correlates a request with its response on the control channel
pub type RequestId = u64;

/// Control channel message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    // Handshake
    /// Agent introduces itself with its public key and a fresh nonce
    Hello {
        version: u32,
        #[serde(with = "serde_bytes")]
        public_key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
    },
    /// Gateway proves possession of its host key and challenges the agent
    Challenge {
        #[serde(with = "serde_bytes")]
        host_key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
        #[serde(with = "serde_bytes")]
        signature: Vec<u8>,
    },
    /// Agent answers the challenge
    Authenticate {
        #[serde(with = "serde_bytes")]
        signature: Vec<u8>,
    },
    Authenticated {
        client_id: String,
    },
    Rejected {
        reason: String,
    },

    // Requests (agent -> gateway)
    /// Ask the gateway to listen on `/<forwardRequestId>` for this connection
    ForwardRequest {
        request_id: RequestId,
        path: String,
        inject: Vec<ScriptInjection>,
    },
    /// Tear down a listener created by `ForwardRequest`
    ForwardCancel {
        request_id: RequestId,
        path: String,
    },
    Exec {
        request_id: RequestId,
        command: String,
    },

    // Responses (gateway -> agent)
    RequestSuccess {
        request_id: RequestId,
    },
    RequestFailure {
        request_id: RequestId,
        reason: String,
    },
    ExecOutput {
        request_id: RequestId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    ExecExit {
        request_id: RequestId,
        code: i32,
    },

    // Keepalive
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Disconnect {
        reason: String,
    },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(MessageError::from)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(data).map_err(MessageError::from)
    }

    /// Request id of a response message, if it is one
    pub fn response_id(&self) -> Option<RequestId> {
        match self {
            ControlMessage::RequestSuccess { request_id }
            | ControlMessage::RequestFailure { request_id, .. }
            | ControlMessage::ExecOutput { request_id, .. }
            | ControlMessage::ExecExit { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Challenge { .. } => "challenge",
            ControlMessage::Authenticate { .. } => "authenticate",
            ControlMessage::Authenticated { .. } => "authenticated",
            ControlMessage::Rejected { .. } => "rejected",
            ControlMessage::ForwardRequest { .. } => "forward_request",
            ControlMessage::ForwardCancel { .. } => "forward_cancel",
            ControlMessage::Exec { .. } => "exec",
            ControlMessage::RequestSuccess { .. } => "request_success",
            ControlMessage::RequestFailure { .. } => "request_failure",
            ControlMessage::ExecOutput { .. } => "exec_output",
            ControlMessage::ExecExit { .. } => "exec_exit",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::Disconnect { .. } => "disconnect",
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed control message: {0}")]
    Malformed(#[from] bincode::Error),
}

// Serialize byte vectors as a single bytes value rather than a sequence
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
