//! gRPC message framing.
//!
//! gRPC messages are length-prefixed with the following format:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Size of the gRPC message header (1 byte flag + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

/// Hard ceiling on a single framed message. Matches the engines'
/// default 32 MiB channel caps; per-channel limits tighten this.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Encode a message into gRPC wire format.
///
/// Returns the encoded message with the length prefix.
pub fn encode_message(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());

    // Compressed flag (compression is not negotiated on the loopback)
    buf.put_u8(0);

    // Message length (big-endian)
    buf.put_u32(data.len() as u32);

    // Message data
    buf.put_slice(data);

    buf.freeze()
}

/// Decode a single message from gRPC wire format.
///
/// Returns `Ok(Some(message))` if a complete message was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
pub fn decode_message(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    // Peek at header without consuming
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    if length > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes", length),
        ));
    }

    let total_size = HEADER_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    // Consume header
    buf.advance(HEADER_SIZE);

    let message = buf.split_to(length).freeze();

    Ok(Some(message))
}

/// Decode exactly one framed message from a complete buffer.
///
/// The loopback delivers whole frames, so a short or trailing-garbage
/// buffer is a protocol error rather than a resumption point.
pub fn decode_whole_message(payload: &[u8]) -> io::Result<Bytes> {
    let mut buf = BytesMut::from(payload);
    match decode_message(&mut buf)? {
        Some(message) if buf.is_empty() => Ok(message),
        Some(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "trailing bytes after frame")),
        None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame")),
    }
}

/// Stateful decoder for gRPC messages.
///
/// Useful for incrementally decoding messages from a stream.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    /// Buffer for incomplete messages.
    buffer: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(4096) }
    }

    /// Feed data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next message.
    pub fn decode(&mut self) -> io::Result<Option<Bytes>> {
        decode_message(&mut self.buffer)
    }

    /// Get the amount of buffered data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
