// ABOUTME: Wire-level primitives shared by both directions of the rpc stream
// ABOUTME: Varint integers, length-prefixed fields and the Encodable/Decodable traits

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Maximum allowed frame size to prevent memory exhaustion on a bad peer.
///
/// Covers the tag byte plus the payload. Both endpoints accept a different
/// bound via their `with_max_frame` constructors.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Codec errors with enough context to tell a truncated field from a
/// malformed one.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("varint exceeds 10 bytes")]
    VarintOverflow,

    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: usize, max: usize },

    #[error("truncated field '{0}'")]
    Truncated(&'static str),

    #[error("field '{0}' exceeds u32 range")]
    IntRange(&'static str),

    #[error("invalid boolean {value:#04x} in field '{field}'")]
    InvalidBool { field: &'static str, value: u8 },

    #[error("invalid batch op type: {0:#04x}")]
    InvalidOpType(u8),

    #[error("invalid UTF-8 in field '{field}'")]
    Utf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// Trait for messages that can be written to the wire.
pub trait Encodable {
    /// Encode the tag byte and payload into `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Produce a complete frame: uvarint length followed by tag + payload.
    fn to_frame(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.encode(&mut body);

        let mut frame = BytesMut::with_capacity(body.len() + 5);
        put_uvarint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        frame.freeze()
    }
}

/// Trait for messages that can be read off the wire.
pub trait Decodable: Sized {
    /// Decode a payload for `tag`. Returns `Ok(None)` for a tag outside this
    /// direction's namespace, so the caller can drop the frame and keep the
    /// stream alive. Trailing payload bytes are ignored.
    fn decode(tag: u8, src: &mut Cursor<&[u8]>) -> Result<Option<Self>, CodecError>;
}

/// Boundaries of one frame inside an accumulation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBounds {
    /// Bytes taken by the length prefix.
    pub header_len: usize,
    /// Bytes taken by tag + payload.
    pub body_len: usize,
}

/// Checks whether a whole frame is buffered in `src`, without consuming it.
///
/// Returns `Incomplete` while more data is needed and `FrameTooLarge` when
/// the declared length exceeds `max`, which must fail the transport.
pub fn check_frame(src: &mut Cursor<&[u8]>, max: usize) -> Result<FrameBounds, CodecError> {
    let start = src.position();
    let length = get_uvarint(src)? as usize;
    let header_len = (src.position() - start) as usize;

    if length > max {
        return Err(CodecError::FrameTooLarge { length, max });
    }
    if src.remaining() < length {
        return Err(CodecError::Incomplete);
    }

    Ok(FrameBounds {
        header_len,
        body_len: length,
    })
}

/// Write an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint.
pub fn get_uvarint(src: &mut Cursor<&[u8]>) -> Result<u64, CodecError> {
    let mut value: u64 = 0;
    for shift in 0..10 {
        if !src.has_remaining() {
            return Err(CodecError::Incomplete);
        }
        let byte = src.get_u8();
        value |= u64::from(byte & 0x7f) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow)
}

/// Write a signed integer as a zigzag varint.
pub fn put_ivarint(buf: &mut BytesMut, value: i64) {
    put_uvarint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

/// Read a zigzag varint.
pub fn get_ivarint(src: &mut Cursor<&[u8]>) -> Result<i64, CodecError> {
    let raw = get_uvarint(src)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

/// Write a u32 field as a varint.
pub fn put_u32_field(buf: &mut BytesMut, value: u32) {
    put_uvarint(buf, u64::from(value));
}

/// Read a u32 field, rejecting wider values.
pub fn get_u32_field(src: &mut Cursor<&[u8]>, field: &'static str) -> Result<u32, CodecError> {
    u32::try_from(get_uvarint(src)?).map_err(|_| CodecError::IntRange(field))
}

/// Write a boolean as a single byte.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

/// Read a single-byte boolean; anything but 0 or 1 is malformed.
pub fn get_bool(src: &mut Cursor<&[u8]>, field: &'static str) -> Result<bool, CodecError> {
    if !src.has_remaining() {
        return Err(CodecError::Truncated(field));
    }
    match src.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(CodecError::InvalidBool { field, value }),
    }
}

/// Write a length-prefixed byte field.
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_uvarint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Read a length-prefixed byte field.
pub fn get_bytes(src: &mut Cursor<&[u8]>, field: &'static str) -> Result<Bytes, CodecError> {
    let len = get_uvarint(src)? as usize;
    if src.remaining() < len {
        return Err(CodecError::Truncated(field));
    }
    Ok(src.copy_to_bytes(len))
}

/// Write an optional byte field: presence byte, then the field if present.
/// Absent is distinct from present-but-empty.
pub fn put_opt_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_bytes(buf, value);
        }
        None => buf.put_u8(0),
    }
}

/// Read an optional byte field.
pub fn get_opt_bytes(
    src: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<Option<Bytes>, CodecError> {
    if get_bool(src, field)? {
        Ok(Some(get_bytes(src, field)?))
    } else {
        Ok(None)
    }
}

/// Write a UTF-8 string as a byte field.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Read a UTF-8 string field.
pub fn get_string(src: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, CodecError> {
    let bytes = get_bytes(src, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|source| CodecError::Utf8 { field, source })
}

/// Write an optional string field.
pub fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) {
    put_opt_bytes(buf, value.map(str::as_bytes));
}

/// Read an optional string field.
pub fn get_opt_string(
    src: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<Option<String>, CodecError> {
    if get_bool(src, field)? {
        Ok(Some(get_string(src, field)?))
    } else {
        Ok(None)
    }
}
