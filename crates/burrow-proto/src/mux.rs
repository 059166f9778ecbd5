//! Multiplexing frames for the control connection

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{ControlMessage, MessageError};

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Control message on stream 0
    Control = 0,
    /// Opens a sub-connection; payload is the UTF-8 forward path
    Open = 1,
    Data = 2,
    /// Sender will not write any more data on this stream
    Close = 3,
    /// Abort the stream; payload is a UTF-8 reason
    Reset = 4,
    /// Grants the peer more send credit; payload is a big-endian u32 byte count
    WindowUpdate = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Close),
            4 => Ok(FrameType::Reset),
            5 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: 0,
            payload,
        }
    }

    pub fn control(message: &ControlMessage) -> Result<Self, MessageError> {
        Ok(Self::new(
            crate::CONTROL_STREAM_ID,
            FrameType::Control,
            Bytes::from(message.encode()?),
        ))
    }

    pub fn open(stream_id: StreamId, path: &str) -> Self {
        Self::new(
            stream_id,
            FrameType::Open,
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn reset(stream_id: StreamId, reason: &str) -> Self {
        Self::new(
            stream_id,
            FrameType::Reset,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    /// Credit carried by a `WindowUpdate` frame
    pub fn window_increment(&self) -> Result<u32, MuxError> {
        let bytes: [u8; 4] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| MuxError::InvalidWindowUpdate(self.stream_id))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Payload interpreted as UTF-8 (paths and reset reasons)
    pub fn payload_str(&self) -> Result<&str, MuxError> {
        std::str::from_utf8(&self.payload).map_err(|_| MuxError::InvalidUtf8(self.stream_id))
    }

    /// Decode the payload of a control frame
    pub fn control_message(&self) -> Result<ControlMessage, MessageError> {
        ControlMessage::decode(&self.payload)
    }

    /// Encode frame into the given buffer
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from the front of `buf`, leaving any remainder in place.
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..Self::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = header.get_u8();
        let length = header.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        let total = Self::HEADER_SIZE + length as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let payload = buf.split_to(length as usize).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Frame payload on stream {0} is not valid UTF-8")]
    InvalidUtf8(StreamId),

    #[error("Malformed window update on stream {0}")]
    InvalidWindowUpdate(StreamId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec used with `FramedRead`/`FramedWrite`
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        Frame::decode_from(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        frame.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::data(7, Bytes::from_static(b"hello world"));
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), Frame::HEADER_SIZE + 11);

        let decoded = Frame::decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_needs_more_bytes() {
        let frame = Frame::open(2, "/web-80");
        let mut full = BytesMut::new();
        frame.encode_into(&mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(Frame::decode_from(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 3);

        partial.extend_from_slice(&full[full.len() - 3..]);
        let decoded = Frame::decode_from(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.payload_str().unwrap(), "/web-80");
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        Frame::close(3).encode_into(&mut buf).unwrap();
        Frame::reset(5, "unknown forward")
            .encode_into(&mut buf)
            .unwrap();

        let mut codec = FrameCodec;
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Close);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Reset);
        assert_eq!(second.payload_str().unwrap(), "unknown forward");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_window_update_increment() {
        let mut buf = BytesMut::new();
        Frame::window_update(9, 65_536).encode_into(&mut buf).unwrap();
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.window_increment().unwrap(), 65_536);

        let short = Frame::new(9, FrameType::WindowUpdate, Bytes::from_static(b"ab"));
        assert!(matches!(
            short.window_increment(),
            Err(MuxError::InvalidWindowUpdate(9))
        ));
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(42);
        buf.put_u8(0);
        buf.put_u32(0);
        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(MuxError::InvalidFrameType(42))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u8(0);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);
        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(MuxError::FrameTooLarge(_))
        ));
    }
}
