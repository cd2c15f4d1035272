// ABOUTME: Structured messages exchanged between the guest and host endpoints
// ABOUTME: One tag byte per message kind, fields encoded in declaration order

use crate::codec::{
    CodecError, Decodable, Encodable, get_bool, get_bytes, get_ivarint, get_opt_bytes,
    get_opt_string, get_string, get_u32_field, get_uvarint, put_bool, put_bytes, put_ivarint,
    put_opt_bytes, put_opt_string, put_string, put_u32_field, put_uvarint,
};
use crate::store::{BatchOp, IteratorOptions, RangeOptions};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;

/// Request tags, guest to host. The numeric values are wire constants.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputTag {
    Get = 1,
    Put = 2,
    Del = 3,
    Batch = 4,
    Iterator = 5,
    IteratorClose = 6,
    IteratorAck = 7,
    IteratorSeek = 8,
    Clear = 9,
    GetMany = 10,
}

/// Reply tags, host to guest. The numeric values are wire constants.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputTag {
    Callback = 1,
    IteratorData = 2,
    IteratorEnd = 3,
    IteratorError = 4,
    GetManyCallback = 5,
}

/// A request frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Get {
        id: u32,
        key: Bytes,
    },
    Put {
        id: u32,
        key: Bytes,
        value: Bytes,
    },
    Del {
        id: u32,
        key: Bytes,
    },
    Batch {
        id: u32,
        ops: Vec<BatchOp>,
    },
    Iterator {
        id: u32,
        options: IteratorOptions,
        bookmark: Option<Bytes>,
        seek: Option<Bytes>,
        seq: u32,
    },
    IteratorClose {
        id: u32,
    },
    IteratorAck {
        id: u32,
        seq: u32,
        consumed: u32,
    },
    IteratorSeek {
        id: u32,
        seq: u32,
        target: Bytes,
    },
    Clear {
        id: u32,
        options: RangeOptions,
    },
    GetMany {
        id: u32,
        keys: Vec<Bytes>,
    },
}

/// A reply frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Callback {
        id: u32,
        error: Option<String>,
        value: Option<Bytes>,
    },
    IteratorData {
        id: u32,
        seq: u32,
        data: Vec<Bytes>,
    },
    IteratorEnd {
        id: u32,
        seq: u32,
    },
    IteratorError {
        id: u32,
        seq: u32,
        error: String,
    },
    GetManyCallback {
        id: u32,
        error: Option<String>,
        values: Vec<Option<Bytes>>,
    },
}

impl Input {
    pub fn tag(&self) -> InputTag {
        match self {
            Input::Get { .. } => InputTag::Get,
            Input::Put { .. } => InputTag::Put,
            Input::Del { .. } => InputTag::Del,
            Input::Batch { .. } => InputTag::Batch,
            Input::Iterator { .. } => InputTag::Iterator,
            Input::IteratorClose { .. } => InputTag::IteratorClose,
            Input::IteratorAck { .. } => InputTag::IteratorAck,
            Input::IteratorSeek { .. } => InputTag::IteratorSeek,
            Input::Clear { .. } => InputTag::Clear,
            Input::GetMany { .. } => InputTag::GetMany,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Input::Get { id, .. }
            | Input::Put { id, .. }
            | Input::Del { id, .. }
            | Input::Batch { id, .. }
            | Input::Iterator { id, .. }
            | Input::IteratorClose { id }
            | Input::IteratorAck { id, .. }
            | Input::IteratorSeek { id, .. }
            | Input::Clear { id, .. }
            | Input::GetMany { id, .. } => *id,
        }
    }
}

impl Output {
    pub fn tag(&self) -> OutputTag {
        match self {
            Output::Callback { .. } => OutputTag::Callback,
            Output::IteratorData { .. } => OutputTag::IteratorData,
            Output::IteratorEnd { .. } => OutputTag::IteratorEnd,
            Output::IteratorError { .. } => OutputTag::IteratorError,
            Output::GetManyCallback { .. } => OutputTag::GetManyCallback,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Output::Callback { id, .. }
            | Output::IteratorData { id, .. }
            | Output::IteratorEnd { id, .. }
            | Output::IteratorError { id, .. }
            | Output::GetManyCallback { id, .. } => *id,
        }
    }
}

fn put_range(buf: &mut BytesMut, range: &RangeOptions) {
    put_opt_bytes(buf, range.gt.as_deref());
    put_opt_bytes(buf, range.gte.as_deref());
    put_opt_bytes(buf, range.lt.as_deref());
    put_opt_bytes(buf, range.lte.as_deref());
    put_bool(buf, range.reverse);
    put_ivarint(buf, range.limit);
}

fn get_range(src: &mut Cursor<&[u8]>) -> Result<RangeOptions, CodecError> {
    Ok(RangeOptions {
        gt: get_opt_bytes(src, "gt")?,
        gte: get_opt_bytes(src, "gte")?,
        lt: get_opt_bytes(src, "lt")?,
        lte: get_opt_bytes(src, "lte")?,
        reverse: get_bool(src, "reverse")?,
        limit: get_ivarint(src)?,
    })
}

fn put_iterator_options(buf: &mut BytesMut, options: &IteratorOptions) {
    put_range(buf, &options.range);
    put_bool(buf, options.keys);
    put_bool(buf, options.values);
}

fn get_iterator_options(src: &mut Cursor<&[u8]>) -> Result<IteratorOptions, CodecError> {
    Ok(IteratorOptions {
        range: get_range(src)?,
        keys: get_bool(src, "keys")?,
        values: get_bool(src, "values")?,
    })
}

fn put_batch_op(buf: &mut BytesMut, op: &BatchOp) {
    match op {
        BatchOp::Put { key, value } => {
            buf.put_u8(0);
            put_bytes(buf, key);
            put_opt_bytes(buf, Some(value));
        }
        BatchOp::Del { key } => {
            buf.put_u8(1);
            put_bytes(buf, key);
            put_opt_bytes(buf, None);
        }
    }
}

fn get_batch_op(src: &mut Cursor<&[u8]>) -> Result<BatchOp, CodecError> {
    if !src.has_remaining() {
        return Err(CodecError::Truncated("op"));
    }
    let kind = src.get_u8();
    let key = get_bytes(src, "key")?;
    let value = get_opt_bytes(src, "value")?;
    match kind {
        0 => Ok(BatchOp::Put {
            key,
            value: value.ok_or(CodecError::Truncated("value"))?,
        }),
        1 => Ok(BatchOp::Del { key }),
        other => Err(CodecError::InvalidOpType(other)),
    }
}

fn get_repeated_bytes(
    src: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<Vec<Bytes>, CodecError> {
    let count = get_uvarint(src)? as usize;
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(get_bytes(src, field)?);
    }
    Ok(items)
}

impl Encodable for Input {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match self {
            Input::Get { id, key } => {
                put_u32_field(buf, *id);
                put_bytes(buf, key);
            }
            Input::Put { id, key, value } => {
                put_u32_field(buf, *id);
                put_bytes(buf, key);
                put_bytes(buf, value);
            }
            Input::Del { id, key } => {
                put_u32_field(buf, *id);
                put_bytes(buf, key);
            }
            Input::Batch { id, ops } => {
                put_u32_field(buf, *id);
                put_uvarint(buf, ops.len() as u64);
                for op in ops {
                    put_batch_op(buf, op);
                }
            }
            Input::Iterator {
                id,
                options,
                bookmark,
                seek,
                seq,
            } => {
                put_u32_field(buf, *id);
                put_iterator_options(buf, options);
                put_opt_bytes(buf, bookmark.as_deref());
                put_opt_bytes(buf, seek.as_deref());
                put_u32_field(buf, *seq);
            }
            Input::IteratorClose { id } => {
                put_u32_field(buf, *id);
            }
            Input::IteratorAck { id, seq, consumed } => {
                put_u32_field(buf, *id);
                put_u32_field(buf, *seq);
                put_u32_field(buf, *consumed);
            }
            Input::IteratorSeek { id, seq, target } => {
                put_u32_field(buf, *id);
                put_u32_field(buf, *seq);
                put_bytes(buf, target);
            }
            Input::Clear { id, options } => {
                put_u32_field(buf, *id);
                put_range(buf, options);
            }
            Input::GetMany { id, keys } => {
                put_u32_field(buf, *id);
                put_uvarint(buf, keys.len() as u64);
                for key in keys {
                    put_bytes(buf, key);
                }
            }
        }
    }
}

impl Decodable for Input {
    fn decode(tag: u8, src: &mut Cursor<&[u8]>) -> Result<Option<Self>, CodecError> {
        let Ok(tag) = InputTag::try_from(tag) else {
            return Ok(None);
        };

        let id = get_u32_field(src, "id")?;
        let message = match tag {
            InputTag::Get => Input::Get {
                id,
                key: get_bytes(src, "key")?,
            },
            InputTag::Put => Input::Put {
                id,
                key: get_bytes(src, "key")?,
                value: get_bytes(src, "value")?,
            },
            InputTag::Del => Input::Del {
                id,
                key: get_bytes(src, "key")?,
            },
            InputTag::Batch => {
                let count = get_uvarint(src)? as usize;
                let mut ops = Vec::new();
                for _ in 0..count {
                    ops.push(get_batch_op(src)?);
                }
                Input::Batch { id, ops }
            }
            InputTag::Iterator => Input::Iterator {
                id,
                options: get_iterator_options(src)?,
                bookmark: get_opt_bytes(src, "bookmark")?,
                seek: get_opt_bytes(src, "seek")?,
                seq: get_u32_field(src, "seq")?,
            },
            InputTag::IteratorClose => Input::IteratorClose { id },
            InputTag::IteratorAck => Input::IteratorAck {
                id,
                seq: get_u32_field(src, "seq")?,
                consumed: get_u32_field(src, "consumed")?,
            },
            InputTag::IteratorSeek => Input::IteratorSeek {
                id,
                seq: get_u32_field(src, "seq")?,
                target: get_bytes(src, "target")?,
            },
            InputTag::Clear => Input::Clear {
                id,
                options: get_range(src)?,
            },
            InputTag::GetMany => Input::GetMany {
                id,
                keys: get_repeated_bytes(src, "keys")?,
            },
        };

        Ok(Some(message))
    }
}

impl Encodable for Output {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match self {
            Output::Callback { id, error, value } => {
                put_u32_field(buf, *id);
                put_opt_string(buf, error.as_deref());
                put_opt_bytes(buf, value.as_deref());
            }
            Output::IteratorData { id, seq, data } => {
                put_u32_field(buf, *id);
                put_u32_field(buf, *seq);
                put_uvarint(buf, data.len() as u64);
                for item in data {
                    put_bytes(buf, item);
                }
            }
            Output::IteratorEnd { id, seq } => {
                put_u32_field(buf, *id);
                put_u32_field(buf, *seq);
            }
            Output::IteratorError { id, seq, error } => {
                put_u32_field(buf, *id);
                put_u32_field(buf, *seq);
                put_string(buf, error);
            }
            Output::GetManyCallback { id, error, values } => {
                put_u32_field(buf, *id);
                put_opt_string(buf, error.as_deref());
                put_uvarint(buf, values.len() as u64);
                for value in values {
                    put_opt_bytes(buf, value.as_deref());
                }
            }
        }
    }
}

impl Decodable for Output {
    fn decode(tag: u8, src: &mut Cursor<&[u8]>) -> Result<Option<Self>, CodecError> {
        let Ok(tag) = OutputTag::try_from(tag) else {
            return Ok(None);
        };

        let id = get_u32_field(src, "id")?;
        let message = match tag {
            OutputTag::Callback => Output::Callback {
                id,
                error: get_opt_string(src, "error")?,
                value: get_opt_bytes(src, "value")?,
            },
            OutputTag::IteratorData => Output::IteratorData {
                id,
                seq: get_u32_field(src, "seq")?,
                data: get_repeated_bytes(src, "data")?,
            },
            OutputTag::IteratorEnd => Output::IteratorEnd {
                id,
                seq: get_u32_field(src, "seq")?,
            },
            OutputTag::IteratorError => Output::IteratorError {
                id,
                seq: get_u32_field(src, "seq")?,
                error: get_string(src, "error")?,
            },
            OutputTag::GetManyCallback => {
                let error = get_opt_string(src, "error")?;
                let count = get_uvarint(src)? as usize;
                let mut values = Vec::new();
                for _ in 0..count {
                    values.push(get_opt_bytes(src, "value")?);
                }
                Output::GetManyCallback { id, error, values }
            }
        };

        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MAX_FRAME_SIZE, check_frame};

    fn roundtrip<M: Encodable + Decodable>(message: &M) -> M {
        let frame = message.to_frame();
        let mut src = Cursor::new(frame.as_ref());
        let bounds = check_frame(&mut src, MAX_FRAME_SIZE).unwrap();
        assert_eq!(bounds.header_len + bounds.body_len, frame.len());

        let body = &frame[bounds.header_len..];
        let mut src = Cursor::new(&body[1..]);
        M::decode(body[0], &mut src)
            .unwrap()
            .expect("known tag must decode")
    }

    #[test]
    fn input_roundtrips() {
        let messages = vec![
            Input::Get {
                id: 1,
                key: Bytes::from_static(b"a"),
            },
            Input::Put {
                id: 2,
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b""),
            },
            Input::Del {
                id: 3,
                key: Bytes::from_static(b"gone"),
            },
            Input::Batch {
                id: 4,
                ops: vec![
                    BatchOp::put(Bytes::from_static(b"x"), Bytes::from_static(b"X")),
                    BatchOp::del(Bytes::from_static(b"y")),
                ],
            },
            Input::Iterator {
                id: 5,
                options: IteratorOptions {
                    range: RangeOptions {
                        gte: Some(Bytes::from_static(b"a")),
                        lt: Some(Bytes::from_static(b"z")),
                        limit: 10,
                        ..RangeOptions::default()
                    },
                    keys: true,
                    values: false,
                },
                bookmark: Some(Bytes::from_static(b"c")),
                seek: None,
                seq: 2,
            },
            Input::IteratorClose { id: 6 },
            Input::IteratorAck {
                id: 7,
                seq: 1,
                consumed: 42,
            },
            Input::IteratorSeek {
                id: 8,
                seq: 3,
                target: Bytes::from_static(b"f"),
            },
            Input::Clear {
                id: 9,
                options: RangeOptions {
                    reverse: true,
                    limit: 0,
                    ..RangeOptions::default()
                },
            },
            Input::GetMany {
                id: 10,
                keys: vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")],
            },
        ];

        for message in messages {
            assert_eq!(roundtrip(&message), message);
        }
    }

    #[test]
    fn output_roundtrips() {
        let messages = vec![
            Output::Callback {
                id: 1,
                error: None,
                value: Some(Bytes::from_static(b"v")),
            },
            Output::Callback {
                id: 2,
                error: Some("LEVEL_IO_ERROR".to_string()),
                value: None,
            },
            Output::IteratorData {
                id: 3,
                seq: 0,
                data: vec![Bytes::from_static(b"k"), Bytes::from_static(b"v")],
            },
            Output::IteratorEnd { id: 4, seq: 1 },
            Output::IteratorError {
                id: 5,
                seq: 2,
                error: "LEVEL_IO_ERROR".to_string(),
            },
            Output::GetManyCallback {
                id: 6,
                error: None,
                values: vec![None, Some(Bytes::from_static(b"Y"))],
            },
        ];

        for message in messages {
            assert_eq!(roundtrip(&message), message);
        }
    }

    #[test]
    fn empty_value_survives_roundtrip_as_present() {
        let message = Output::Callback {
            id: 1,
            error: None,
            value: Some(Bytes::new()),
        };
        match roundtrip(&message) {
            Output::Callback { value, .. } => {
                assert_eq!(value, Some(Bytes::new()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_skipped() {
        let mut src = Cursor::new(&[][..]);
        assert!(Input::decode(0xfe, &mut src).unwrap().is_none());

        let mut src = Cursor::new(&[][..]);
        assert!(Output::decode(0xfe, &mut src).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        // A get frame missing its key field.
        let mut body = BytesMut::new();
        put_u32_field(&mut body, 7);
        let mut src = Cursor::new(body.as_ref());
        assert!(Input::decode(InputTag::Get as u8, &mut src).is_err());
    }

    #[test]
    fn batch_op_type_is_validated() {
        let mut body = BytesMut::new();
        put_u32_field(&mut body, 1);
        put_uvarint(&mut body, 1);
        body.put_u8(9); // bad op type
        put_bytes(&mut body, b"k");
        put_opt_bytes(&mut body, None);

        let mut src = Cursor::new(body.as_ref());
        assert!(matches!(
            Input::decode(InputTag::Batch as u8, &mut src),
            Err(CodecError::InvalidOpType(9))
        ));
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let message = Input::IteratorClose { id: 12 };
        let mut body = BytesMut::new();
        message.encode(&mut body);
        body.put_slice(b"future-extension");

        let mut src = Cursor::new(&body.as_ref()[1..]);
        let decoded = Input::decode(body[0], &mut src).unwrap().unwrap();
        assert_eq!(decoded, message);
    }
}
