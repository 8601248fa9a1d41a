//! Framed codec for the bridge transport.
//!
//! Every frame is a fixed 12-byte little-endian header followed by a JSON payload:
//!
//! ```text
//! +--------------+------------+--------------------+---------------+
//! | type (u32)   | id (u32)   | payload_len (u32)  | payload bytes |
//! +--------------+------------+--------------------+---------------+
//! ```
//!
//! Works over any AsyncRead/AsyncWrite (vsock, stdio, duplex pipes). Partial
//! reads accumulate in the `BytesMut` owned by `FramedRead`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Category, Message, MessageType, NOTIFICATION_ID, ProtocolError};

pub const HEADER_SIZE: usize = 12;

/// Upper bound on a single payload unless overridden.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 100_000;

/// One undecoded unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            id,
            payload: payload.into(),
        }
    }
}

/// Errors that leave the stream in an unknown position. Always connection-fatal.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

fn validate_id(message_type: MessageType, id: u32) -> Result<(), FrameError> {
    match message_type.category() {
        Category::Notification if id != NOTIFICATION_ID => Err(FrameError::MalformedHeader(
            format!("notification {message_type} carries non-zero id {id}"),
        )),
        Category::Request | Category::Response if id == NOTIFICATION_ID => Err(
            FrameError::MalformedHeader(format!("{message_type} carries reserved id 0")),
        ),
        _ => Ok(()),
    }
}

/// Codec that splits the byte stream into [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let mut header: &[u8] = &src[..HEADER_SIZE];
        let raw_type = header.get_u32_le();
        let id = header.get_u32_le();
        let len = header.get_u32_le() as usize;

        // Header checks run before the payload arrives so a hostile length
        // never makes us buffer it.
        if len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        let message_type = MessageType::from_raw(raw_type).ok_or_else(|| {
            FrameError::MalformedHeader(format!("unknown category in type {raw_type:#010x}"))
        })?;
        validate_id(message_type, id)?;

        let total = HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        tracing::trace!(%message_type, id, payload_bytes = len, "Decoded frame");
        Ok(Some(Frame {
            message_type,
            id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        validate_id(frame.message_type, frame.id)?;

        tracing::trace!(message_type = %frame.message_type, id = frame.id, payload_bytes = len, "Encoding frame");
        if len > LARGE_FRAME_BYTES {
            tracing::info!(
                payload_bytes = len,
                payload_kb = len / 1024,
                "Large frame being encoded"
            );
        }

        dst.reserve(HEADER_SIZE + len);
        dst.put_u32_le(frame.message_type.raw());
        dst.put_u32_le(frame.id);
        dst.put_u32_le(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        Self::Frame(FrameError::Io(err))
    }
}

/// Typed codec over [`FrameCodec`], for peers that speak whole messages.
///
/// The agent itself decodes frames and parses payloads separately so a bad
/// payload can be answered instead of killing the connection.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    frames: FrameCodec,
}

impl MessageCodec {
    pub fn new(frames: FrameCodec) -> Self {
        Self { frames }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(Message::from_frame(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.to_frame()?;
        self.frames.encode(frame, dst)?;
        Ok(())
    }
}
