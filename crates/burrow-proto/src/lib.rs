//! Burrow wire protocol
//!
//! Frame layout and codec for the multiplexed control connection, the control
//! messages exchanged on stream 0, forward identifiers, the `hello` handshake
//! response and script injection rules shared by agent and gateway.

pub mod forward;
pub mod hello;
pub mod inject;
pub mod messages;
pub mod mux;

pub use forward::{strip_access_suffix, Access, ForwardRequestId, ACCESS_PRIVATE_SUFFIX};
pub use hello::{HelloError, HelloResponse, LegacyBaseUrl, TunnelUrl};
pub use inject::ScriptInjection;
pub use messages::{ControlMessage, MessageError, RequestId};
pub use mux::{Frame, FrameCodec, FrameType, MuxError, StreamId};

/// Protocol version sent in the agent hello
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Send credit each side starts with on every stream, in bytes.
/// Further credit arrives in `WindowUpdate` frames as the receiver drains data.
pub const INITIAL_STREAM_WINDOW: u32 = 256 * 1024;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: u32 = 0;

/// Command executed on the control channel to learn the public tunnel URLs
pub const HELLO_COMMAND: &str = "hello";
