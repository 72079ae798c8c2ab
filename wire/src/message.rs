//! Message trait and minimal protobuf wire-format helpers.
//!
//! Protobuf codegen is deliberately out of scope; implementations of
//! [`Message`] hand-encode with the [`proto`] helpers, which cover just
//! enough of the protobuf wire format for the payloads this runtime
//! carries. `type_name()` is the descriptor identity the method
//! registries validate against.

/// A protobuf-shaped message the wire can carry.
pub trait Message: Default + Send + Sync + 'static {
    /// Fully qualified protobuf message name, e.g. `example.FooRequest`.
    fn type_name() -> &'static str;

    /// Append the encoded message to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Decode a message from `bytes`.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;

    /// Encode into a fresh buffer.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated message")]
    Truncated,
    #[error("invalid varint")]
    InvalidVarint,
    #[error("unsupported wire type {0}")]
    WireType(u8),
    #[error("invalid utf-8 in string field")]
    Utf8,
}

/// Hand-rolled protobuf wire format: the varint and length-delimited
/// pieces the payloads here are built from, nothing more.
pub mod proto {
    use super::DecodeError;

    /// Wire type of varint-encoded scalars.
    pub const WIRE_TYPE_VARINT: u8 = 0;
    /// Wire type of length-delimited payloads (strings, bytes, nested
    /// messages).
    pub const WIRE_TYPE_LEN: u8 = 2;

    /// Append a base-128 varint: seven payload bits per byte, high bit
    /// marking continuation.
    pub fn encode_varint(value: u64, buf: &mut Vec<u8>) {
        let mut rest = value;
        while rest >= 0x80 {
            buf.push(rest as u8 | 0x80);
            rest >>= 7;
        }
        buf.push(rest as u8);
    }

    /// Read a base-128 varint, advancing the buffer past it.
    pub fn decode_varint(buf: &mut &[u8]) -> Result<u64, DecodeError> {
        let mut out: u64 = 0;
        for (index, &byte) in buf.iter().enumerate() {
            // A u64 varint never spans more than ten bytes.
            if index == 10 {
                return Err(DecodeError::InvalidVarint);
            }
            out |= u64::from(byte & 0x7F) << (7 * index);
            if byte < 0x80 {
                *buf = &buf[index + 1..];
                return Ok(out);
            }
        }
        Err(DecodeError::Truncated)
    }

    /// Append a field key: the field number joined with its wire type.
    pub fn encode_tag(field_number: u32, wire_type: u8, buf: &mut Vec<u8>) {
        let key = (u64::from(field_number) << 3) | u64::from(wire_type & 0x07);
        encode_varint(key, buf);
    }

    /// Read a field key, yielding (field number, wire type).
    pub fn decode_tag(buf: &mut &[u8]) -> Result<(u32, u8), DecodeError> {
        let key = decode_varint(buf)?;
        Ok(((key >> 3) as u32, (key & 0x07) as u8))
    }

    /// Encode a length-delimited bytes field.
    pub fn encode_bytes_field(field_number: u32, value: &[u8], buf: &mut Vec<u8>) {
        encode_tag(field_number, WIRE_TYPE_LEN, buf);
        encode_varint(value.len() as u64, buf);
        buf.extend_from_slice(value);
    }

    /// Encode a string field (same as bytes in protobuf).
    pub fn encode_string_field(field_number: u32, value: &str, buf: &mut Vec<u8>) {
        encode_bytes_field(field_number, value.as_bytes(), buf);
    }

    /// Encode a uint64 varint field.
    pub fn encode_uint64_field(field_number: u32, value: u64, buf: &mut Vec<u8>) {
        encode_tag(field_number, WIRE_TYPE_VARINT, buf);
        encode_varint(value, buf);
    }

    /// Decode a length-delimited payload, advancing the buffer past it.
    pub fn decode_len_field<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
        let len = decode_varint(buf)? as usize;
        if buf.len() < len {
            return Err(DecodeError::Truncated);
        }
        let (value, rest) = buf.split_at(len);
        *buf = rest;
        Ok(value)
    }

    /// Decode a length-delimited UTF-8 string.
    pub fn decode_string_field(buf: &mut &[u8]) -> Result<String, DecodeError> {
        let bytes = decode_len_field(buf)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
    }

    /// Skip one field of the given wire type.
    pub fn skip_field(wire_type: u8, buf: &mut &[u8]) -> Result<(), DecodeError> {
        match wire_type {
            WIRE_TYPE_VARINT => {
                decode_varint(buf)?;
            }
            WIRE_TYPE_LEN => {
                decode_len_field(buf)?;
            }
            other => return Err(DecodeError::WireType(other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::proto::*;
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let mut slice = buf.as_slice();
            assert_eq!(decode_varint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn varint_truncated() {
        let mut slice: &[u8] = &[0x80];
        assert_eq!(decode_varint(&mut slice), Err(DecodeError::Truncated));
    }

    #[test]
    fn varint_rejects_overlong_encoding() {
        // Eleven continuation bytes cannot be a u64 varint.
        let bytes = [0x80u8; 11];
        let mut slice = &bytes[..];
        assert_eq!(decode_varint(&mut slice), Err(DecodeError::InvalidVarint));
    }

    #[test]
    fn string_field_roundtrip() {
        let mut buf = Vec::new();
        encode_string_field(1, "abc", &mut buf);
        let mut slice = buf.as_slice();
        let (field, wire_type) = decode_tag(&mut slice).unwrap();
        assert_eq!((field, wire_type), (1, WIRE_TYPE_LEN));
        assert_eq!(decode_string_field(&mut slice).unwrap(), "abc");
    }

    #[test]
    fn skip_unknown_fields() {
        let mut buf = Vec::new();
        encode_uint64_field(7, 42, &mut buf);
        encode_string_field(8, "skipped", &mut buf);
        encode_string_field(1, "kept", &mut buf);

        let mut slice = buf.as_slice();
        let mut kept = None;
        while !slice.is_empty() {
            let (field, wire_type) = decode_tag(&mut slice).unwrap();
            if field == 1 {
                kept = Some(decode_string_field(&mut slice).unwrap());
            } else {
                skip_field(wire_type, &mut slice).unwrap();
            }
        }
        assert_eq!(kept.as_deref(), Some("kept"));
    }
}
