//! MySQL binary JSON decoding
//!
//! JSON columns are written to the binlog in MySQL's binary document format
//! (type tag, key/value offset tables, inline small scalars). Offsets inside
//! an object or array are relative to the start of that container.
//!
//! | tag  | type              |
//! |------|-------------------|
//! | 0x00 | small object      |
//! | 0x01 | large object      |
//! | 0x02 | small array       |
//! | 0x03 | large array       |
//! | 0x04 | literal           |
//! | 0x05 | int16             |
//! | 0x06 | uint16            |
//! | 0x07 | int32             |
//! | 0x08 | uint32            |
//! | 0x09 | int64             |
//! | 0x0a | uint64            |
//! | 0x0b | double            |
//! | 0x0c | utf8 string       |
//! | 0x0f | opaque            |

use crate::common::{CdcError, Result};
use serde_json::{Map, Value};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

/// Decode a JSON column payload.
///
/// Falls back to parsing UTF-8 text (some servers log JSON as text) and
/// finally to a plain string.
pub fn decode_json(data: &[u8]) -> Value {
    if data.is_empty() {
        return Value::Null;
    }
    match parse_typed(data[0], &data[1..]) {
        Ok(v) => v,
        Err(_) => serde_json::from_slice(data)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(data).into_owned())),
    }
}

/// Encode a scalar or string as a standalone binary JSON document.
///
/// Containers are written as text, which [`decode_json`] accepts as well.
pub fn encode_json(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => vec![LITERAL, 0x00],
        Value::Bool(true) => vec![LITERAL, 0x01],
        Value::Bool(false) => vec![LITERAL, 0x02],
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let mut out = vec![INT64];
                out.extend_from_slice(&i.to_le_bytes());
                out
            } else if let Some(u) = n.as_u64() {
                let mut out = vec![UINT64];
                out.extend_from_slice(&u.to_le_bytes());
                out
            } else {
                let mut out = vec![DOUBLE];
                out.extend_from_slice(&n.as_f64().unwrap_or_default().to_le_bytes());
                out
            }
        }
        Value::String(s) => {
            let mut out = vec![STRING];
            write_variable_length(&mut out, s.len());
            out.extend_from_slice(s.as_bytes());
            out
        }
        other => other.to_string().into_bytes(),
    }
}

fn truncated(what: &str) -> CdcError {
    CdcError::decode(format!("truncated JSON {}", what))
}

fn slice_at<'a>(data: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    data.get(offset..offset + len).ok_or_else(|| truncated(what))
}

fn le_uint(data: &[u8], offset: usize, len: usize, what: &str) -> Result<u64> {
    Ok(slice_at(data, offset, len, what)?
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn parse_typed(tag: u8, data: &[u8]) -> Result<Value> {
    match tag {
        SMALL_OBJECT => parse_container(data, false, true),
        LARGE_OBJECT => parse_container(data, true, true),
        SMALL_ARRAY => parse_container(data, false, false),
        LARGE_ARRAY => parse_container(data, true, false),
        LITERAL => Ok(literal(data.first().copied().unwrap_or(0).into())),
        INT16 => Ok(Value::from(le_uint(data, 0, 2, "int16")? as u16 as i16)),
        UINT16 => Ok(Value::from(le_uint(data, 0, 2, "uint16")? as u16)),
        INT32 => Ok(Value::from(le_uint(data, 0, 4, "int32")? as u32 as i32)),
        UINT32 => Ok(Value::from(le_uint(data, 0, 4, "uint32")? as u32)),
        INT64 => Ok(Value::from(le_uint(data, 0, 8, "int64")? as i64)),
        UINT64 => Ok(Value::from(le_uint(data, 0, 8, "uint64")?)),
        DOUBLE => Ok(Value::from(f64::from_bits(le_uint(data, 0, 8, "double")?))),
        STRING => {
            let (len, prefix) = read_variable_length(data)?;
            let bytes = slice_at(data, prefix, len, "string")?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        OPAQUE => {
            // field type byte, then a length-prefixed blob
            let rest = data.get(1..).ok_or_else(|| truncated("opaque"))?;
            let (len, prefix) = read_variable_length(rest)?;
            let bytes = slice_at(rest, prefix, len, "opaque")?;
            Ok(match std::str::from_utf8(bytes) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => {
                    use base64::Engine;
                    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
                }
            })
        }
        other => Err(CdcError::decode(format!(
            "unknown JSON binary type 0x{:02x}",
            other
        ))),
    }
}

fn literal(code: u64) -> Value {
    match code {
        0x01 => Value::Bool(true),
        0x02 => Value::Bool(false),
        _ => Value::Null,
    }
}

fn parse_container(data: &[u8], large: bool, is_object: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = le_uint(data, 0, offset_size, "container header")? as usize;
    let header = offset_size * 2;
    let key_entry = offset_size + 2;
    let value_entry = offset_size + 1;
    let values_start = if is_object {
        header + count * key_entry
    } else {
        header
    };

    let mut keys = Vec::with_capacity(if is_object { count } else { 0 });
    if is_object {
        for i in 0..count {
            let entry = header + i * key_entry;
            let key_offset = le_uint(data, entry, offset_size, "key entry")? as usize;
            let key_len = le_uint(data, entry + offset_size, 2, "key entry")? as usize;
            let key = slice_at(data, key_offset, key_len, "key")?;
            keys.push(String::from_utf8_lossy(key).into_owned());
        }
    }

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let entry = values_start + i * value_entry;
        let tag = *data.get(entry).ok_or_else(|| truncated("value entry"))?;
        values.push(resolve_value(data, tag, entry + 1, large)?);
    }

    if is_object {
        Ok(Value::Object(keys.into_iter().zip(values).collect::<Map<_, _>>()))
    } else {
        Ok(Value::Array(values))
    }
}

/// Small scalars live inline in the value entry; everything else is an
/// offset into the container.
fn resolve_value(data: &[u8], tag: u8, at: usize, large: bool) -> Result<Value> {
    match tag {
        LITERAL => return Ok(literal(le_uint(data, at, 2, "inline literal")?)),
        INT16 => return Ok(Value::from(le_uint(data, at, 2, "inline int16")? as u16 as i16)),
        UINT16 => return Ok(Value::from(le_uint(data, at, 2, "inline uint16")? as u16)),
        INT32 if large => {
            return Ok(Value::from(le_uint(data, at, 4, "inline int32")? as u32 as i32))
        }
        UINT32 if large => return Ok(Value::from(le_uint(data, at, 4, "inline uint32")? as u32)),
        _ => {}
    }
    let offset_size = if large { 4 } else { 2 };
    let offset = le_uint(data, at, offset_size, "value offset")? as usize;
    let body = data
        .get(offset..)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| truncated("value offset"))?;
    parse_typed(tag, body)
}

/// 1-5 byte length, 7 bits per byte, high bit = continuation.
fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0usize;
    for i in 0..5 {
        let b = *data.get(i).ok_or_else(|| truncated("length"))? as usize;
        length |= (b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(CdcError::decode("JSON length exceeds 5 bytes"))
}

fn write_variable_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let byte = (len & 0x7F) as u8;
        len >>= 7;
        if len == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
