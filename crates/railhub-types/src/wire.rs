//! Packed value encoding spoken by the hub programs.
//!
//! Every value is introduced by a header byte `(type << 5) | size`. A
//! lone value is preceded by the single-object marker `0x00`; a tuple is
//! a plain run of header/value pairs. Integers are little-endian and
//! signed, one, two or four bytes wide.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ParseError, ParseResult};

/// Marker preceding a single (non-tuple) value.
pub const SINGLE_OBJECT: u8 = 0x00;

const TYPE_TRUE: u8 = 1;
const TYPE_FALSE: u8 = 2;
const TYPE_INT: u8 = 3;
const TYPE_FLOAT: u8 = 4;
const TYPE_STR: u8 = 5;
const TYPE_BYTES: u8 = 6;

const SIZE_MASK: u8 = 0x1f;

/// Header for a one-byte integer (`0x61`).
pub const HEADER_INT8: u8 = (TYPE_INT << 5) | 1;
/// Header for a two-byte integer (`0x62`).
pub const HEADER_INT16: u8 = (TYPE_INT << 5) | 2;

/// A decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// Encode a single one-byte integer, as used for train commands.
pub fn encode_int8(value: i8) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(SINGLE_OBJECT);
    buf.put_u8(HEADER_INT8);
    buf.put_i8(value);
    buf.freeze()
}

/// Encode a single two-byte integer, as used for switch commands.
pub fn encode_int16(value: i16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(SINGLE_OBJECT);
    buf.put_u8(HEADER_INT16);
    buf.put_i16_le(value);
    buf.freeze()
}

/// Encode values as a tuple. Integers use the narrowest width that fits.
///
/// Strings and byte strings longer than 31 bytes are truncated, since the
/// header only has five bits for the size.
pub fn encode_tuple(values: &[Value]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        put_value(&mut buf, value);
    }
    buf.freeze()
}

fn put_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Bool(true) => buf.put_u8(TYPE_TRUE << 5),
        Value::Bool(false) => buf.put_u8(TYPE_FALSE << 5),
        Value::Int(v) => {
            if let Ok(v) = i8::try_from(*v) {
                buf.put_u8(HEADER_INT8);
                buf.put_i8(v);
            } else if let Ok(v) = i16::try_from(*v) {
                buf.put_u8(HEADER_INT16);
                buf.put_i16_le(v);
            } else {
                buf.put_u8((TYPE_INT << 5) | 4);
                buf.put_i32_le(*v);
            }
        }
        Value::Float(v) => {
            buf.put_u8((TYPE_FLOAT << 5) | 4);
            buf.put_f32_le(*v);
        }
        Value::Str(s) => put_blob(buf, TYPE_STR, s.as_bytes()),
        Value::Bytes(b) => put_blob(buf, TYPE_BYTES, b),
    }
}

fn put_blob(buf: &mut BytesMut, type_code: u8, data: &[u8]) {
    let len = data.len().min(SIZE_MASK as usize);
    // len <= 31, fits the size field
    buf.put_u8((type_code << 5) | len as u8);
    buf.put_slice(&data[..len]);
}

/// Decode a payload into its values.
///
/// A single-object payload yields exactly one value; anything trailing it
/// is rejected.
pub fn decode(payload: &[u8]) -> ParseResult<Vec<Value>> {
    if payload.is_empty() {
        return Err(ParseError::invalid_data("empty payload"));
    }

    if payload[0] == SINGLE_OBJECT {
        let (value, next) = read_value(payload, 1)?;
        if next != payload.len() {
            return Err(ParseError::invalid_data(format!(
                "{} trailing bytes after single value",
                payload.len() - next
            )));
        }
        return Ok(vec![value]);
    }

    let mut values = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (value, next) = read_value(payload, offset)?;
        values.push(value);
        offset = next;
    }
    Ok(values)
}

fn take(payload: &[u8], offset: usize, needed: usize) -> ParseResult<&[u8]> {
    payload
        .get(offset..offset + needed)
        .ok_or(ParseError::Truncated {
            offset,
            needed,
            available: payload.len().saturating_sub(offset),
        })
}

fn read_value(payload: &[u8], offset: usize) -> ParseResult<(Value, usize)> {
    let header = take(payload, offset, 1)?[0];
    let type_code = header >> 5;
    let size = header & SIZE_MASK;
    let body_start = offset + 1;
    let body = take(payload, body_start, size as usize)?;
    let next = body_start + size as usize;

    let value = match type_code {
        TYPE_TRUE | TYPE_FALSE => {
            if size != 0 {
                return Err(ParseError::InvalidSize { kind: "bool", size });
            }
            Value::Bool(type_code == TYPE_TRUE)
        }
        TYPE_INT => match *body {
            [b] => Value::Int(i32::from(b as i8)),
            [lo, hi] => Value::Int(i32::from(i16::from_le_bytes([lo, hi]))),
            [a, b, c, d] => Value::Int(i32::from_le_bytes([a, b, c, d])),
            _ => return Err(ParseError::InvalidSize { kind: "int", size }),
        },
        TYPE_FLOAT => match *body {
            [a, b, c, d] => Value::Float(f32::from_le_bytes([a, b, c, d])),
            _ => return Err(ParseError::InvalidSize { kind: "float", size }),
        },
        TYPE_STR => {
            let s = std::str::from_utf8(body)
                .map_err(|e| ParseError::invalid_data(format!("string is not UTF-8: {e}")))?;
            Value::Str(s.to_string())
        }
        TYPE_BYTES => Value::Bytes(body.to_vec()),
        _ => return Err(ParseError::UnknownType { header, type_code }),
    };

    Ok((value, next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_int8_command_layout() {
        assert_eq!(&encode_int8(40)[..], &[0x00, 0x61, 40]);
        assert_eq!(&encode_int8(-100)[..], &[0x00, 0x61, 0x9c]);
        assert_eq!(&encode_int8(101)[..], &[0x00, 0x61, 101]);
    }

    #[test]
    fn test_int16_command_layout() {
        // switch B diverging: 2 * 1000 + 1
        assert_eq!(&encode_int16(2001)[..], &[0x00, 0x62, 0xd1, 0x07]);
    }

    #[test]
    fn test_decode_single_value() {
        let values = decode(&[0x00, 0x62, 0xd1, 0x07]).unwrap();
        assert_eq!(values, vec![Value::Int(2001)]);
    }

    #[test]
    fn test_decode_status_tuple() {
        let payload = encode_tuple(&[
            Value::Int(1),
            Value::Int(11),
            Value::Int(0b0100),
            Value::Int(0b1100),
        ]);
        assert_eq!(payload[0], HEADER_INT8);
        let values = decode(&payload).unwrap();
        assert_eq!(values.len(), 4);
        assert_eq!(values[2].as_int(), Some(0b0100));
    }

    #[test]
    fn test_decode_string_in_tuple() {
        let payload = encode_tuple(&[Value::Int(21), Value::from("TRAIN HUB 1")]);
        let values = decode(&payload).unwrap();
        assert_eq!(values[1].as_str(), Some("TRAIN HUB 1"));
    }

    #[test]
    fn test_decode_rejects_truncated_int() {
        let err = decode(&[0x62, 0x01]).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { needed: 2, .. }));
    }

    #[test]
    fn test_decode_rejects_trailing_after_single() {
        assert!(decode(&[0x00, 0x61, 0x01, 0x61]).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = decode(&[0xe1, 0x00]).unwrap_err();
        assert!(matches!(err, ParseError::UnknownType { type_code: 7, .. }));
    }

    #[test]
    fn test_decode_empty_payload() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_long_string_is_truncated() {
        let long = "x".repeat(40);
        let values = decode(&encode_tuple(&[Value::Str(long)])).unwrap();
        assert_eq!(values[0].as_str().map(str::len), Some(31));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode(&bytes);
        }

        #[test]
        fn int_tuples_decode_to_same_ints(ints in proptest::collection::vec(any::<i32>(), 1..8)) {
            let values: Vec<Value> = ints.iter().copied().map(Value::Int).collect();
            let decoded = decode(&encode_tuple(&values)).unwrap();
            prop_assert_eq!(decoded, values);
        }
    }
}
