//! Wire framing for BEP connections.
//!
//! Every connection starts with the hello exchange: a 4-byte magic, a 2-byte
//! big-endian length, and a protobuf [`Hello`]. All subsequent messages use
//! the frame envelope:
//!
//! ```text
//! u16 header_len | Header | u32 payload_len | payload
//! ```
//!
//! The [`Header`] names the payload's message type and whether the payload is
//! LZ4-compressed. [`FrameDecoder`] is an incremental push parser so the peer
//! actor can feed it whatever the transport returns.

use prost::Message as _;

use crate::bep::{BepMessage, Header, Hello, MessageCompression, MessageType};
use crate::SyncError;

/// Magic constant preceding the Hello message in both directions.
pub const MAGIC: u32 = 0x2EA7_D90B;

/// Largest tolerated frame header.
pub const MAX_HEADER_LEN: usize = 4 * 1024;

/// Largest tolerated payload: one maximum-size block plus message overhead.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024 + 1024;

/// Payloads below this size are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 128;

/// Encode the magic-prefixed hello frame.
pub fn encode_hello(hello: &Hello) -> Vec<u8> {
    let body = hello.encode_to_vec();
    let mut out = Vec::with_capacity(6 + body.len());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Encode a post-hello message frame, compressing when asked and worthwhile.
pub fn encode_frame(message: &BepMessage, compress: bool) -> Vec<u8> {
    let mut payload = message.to_bytes();
    let mut compression = MessageCompression::None;
    if compress && payload.len() >= COMPRESSION_THRESHOLD {
        let packed = lz4_flex::block::compress_prepend_size(&payload);
        if packed.len() < payload.len() {
            payload = packed;
            compression = MessageCompression::Lz4;
        }
    }
    let header = Header {
        r#type: message.message_type() as i32,
        compression: compression as i32,
    };
    let header_bytes = header.encode_to_vec();
    let mut out = Vec::with_capacity(6 + header_bytes.len() + payload.len());
    out.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Incremental frame parser fed by the transport read loop.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to extract the magic-prefixed Hello. `Ok(None)` means more bytes
    /// are needed.
    pub fn next_hello(&mut self) -> Result<Option<Hello>, SyncError> {
        if self.buf.len() < 6 {
            return Ok(None);
        }
        let magic = u32::from_be_bytes(self.buf[..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(SyncError::Auth(format!(
                "hello magic mismatch: {magic:#010x}"
            )));
        }
        let len = u16::from_be_bytes(self.buf[4..6].try_into().unwrap()) as usize;
        if self.buf.len() < 6 + len {
            return Ok(None);
        }
        let hello = Hello::decode(&self.buf[6..6 + len])?;
        self.buf.drain(..6 + len);
        Ok(Some(hello))
    }

    /// Try to extract one complete post-hello frame. `Ok(None)` means more
    /// bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<BepMessage>, SyncError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let header_len = u16::from_be_bytes(self.buf[..2].try_into().unwrap()) as usize;
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(SyncError::Protocol(format!(
                "frame header length {header_len} out of bounds"
            )));
        }
        if self.buf.len() < 2 + header_len + 4 {
            return Ok(None);
        }
        let header = Header::decode(&self.buf[2..2 + header_len])?;
        let at = 2 + header_len;
        let payload_len = u32::from_be_bytes(self.buf[at..at + 4].try_into().unwrap()) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(SyncError::Protocol(format!(
                "frame payload length {payload_len} out of bounds"
            )));
        }
        if self.buf.len() < at + 4 + payload_len {
            return Ok(None);
        }
        let payload = &self.buf[at + 4..at + 4 + payload_len];
        let msg_type = MessageType::try_from(header.r#type)
            .map_err(|_| SyncError::Protocol(format!("unknown message type {}", header.r#type)))?;
        let message = match MessageCompression::try_from(header.compression) {
            Ok(MessageCompression::None) => BepMessage::from_bytes(msg_type, payload)?,
            Ok(MessageCompression::Lz4) => {
                let unpacked = lz4_flex::block::decompress_size_prepended(payload)
                    .map_err(|e| SyncError::Decode(format!("lz4: {e}")))?;
                BepMessage::from_bytes(msg_type, &unpacked)?
            }
            Err(_) => {
                return Err(SyncError::Protocol(format!(
                    "unknown compression {}",
                    header.compression
                )))
            }
        };
        self.buf.drain(..at + 4 + payload_len);
        Ok(Some(message))
    }
}
