use std::collections::BTreeMap;

use bytes::Bytes;
use num_bigint::BigInt;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a bencode value from a byte slice, strictly.
///
/// The input must contain exactly one complete bencode value with no trailing
/// data, in canonical form: integers without leading zeros, `-0`, or a `+`
/// sign; string lengths without leading zeros; dictionary keys in strictly
/// ascending byte order (which also forbids duplicates).
///
/// # Errors
///
/// Returns an error if:
/// - The input is empty or truncated ([`BencodeError::UnexpectedEof`])
/// - The input contains invalid bencode syntax
/// - The input is not in canonical form (e.g. [`BencodeError::UnsortedKeys`])
/// - The nesting depth exceeds 64 levels ([`BencodeError::NestingTooDeep`])
/// - There is data after the value ([`BencodeError::TrailingData`])
///
/// # Examples
///
/// ```
/// use rdht::bencode::decode;
///
/// // Decode different types
/// let int = decode(b"i42e").unwrap();
/// assert_eq!(int.as_integer(), Some(42));
///
/// let string = decode(b"5:hello").unwrap();
/// assert_eq!(string.as_str(), Some("hello"));
///
/// let list = decode(b"li1ei2ei3ee").unwrap();
/// assert_eq!(list.as_list().unwrap().len(), 3);
///
/// let dict = decode(b"d3:agei30e4:name5:Alicee").unwrap();
/// assert_eq!(dict.get(b"name").and_then(|v| v.as_str()), Some("Alice"));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    decode_with(data, true)
}

/// Decodes a bencode value, tolerating non-canonical input.
///
/// Accepts what [`decode`] accepts, plus dictionaries with out-of-order or
/// duplicate keys (the last occurrence wins), integers with leading zeros or
/// a `+` sign, and string lengths with leading zeros. Structural errors
/// (truncation, trailing data, bad syntax) remain fatal.
pub fn decode_lenient(data: &[u8]) -> Result<Value, BencodeError> {
    decode_with(data, false)
}

fn decode_with(data: &[u8], strict: bool) -> Result<Value, BencodeError> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos, 0, strict)?;

    if pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

fn decode_value(
    data: &[u8],
    pos: &mut usize,
    depth: usize,
    strict: bool,
) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::NestingTooDeep);
    }

    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    match data[*pos] {
        b'i' => decode_integer(data, pos, strict),
        b'l' => decode_list(data, pos, depth, strict),
        b'd' => decode_dict(data, pos, depth, strict),
        b'0'..=b'9' => decode_bytes(data, pos, strict),
        c => Err(BencodeError::UnexpectedChar(c as char)),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize, strict: bool) -> Result<Value, BencodeError> {
    *pos += 1;

    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }

    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let int_str = std::str::from_utf8(&data[start..*pos])
        .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;

    if int_str.is_empty() {
        return Err(BencodeError::InvalidInteger("empty".into()));
    }

    if strict {
        if int_str.starts_with('+') {
            return Err(BencodeError::InvalidInteger("plus sign".into()));
        }
        if int_str.starts_with("-0") || (int_str.starts_with('0') && int_str.len() > 1) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }
    }

    let value: BigInt = int_str
        .parse()
        .map_err(|_| BencodeError::InvalidInteger(int_str.into()))?;

    *pos += 1;
    Ok(Value::Integer(value))
}

fn decode_bytes(data: &[u8], pos: &mut usize, strict: bool) -> Result<Value, BencodeError> {
    let start = *pos;
    while *pos < data.len() && data[*pos] != b':' {
        *pos += 1;
    }

    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let len_str =
        std::str::from_utf8(&data[start..*pos]).map_err(|_| BencodeError::InvalidStringLength)?;

    if strict && len_str.len() > 1 && len_str.starts_with('0') {
        return Err(BencodeError::InvalidStringLength);
    }

    let len: usize = len_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    *pos += 1;

    if *pos + len > data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let bytes = Bytes::copy_from_slice(&data[*pos..*pos + len]);
    *pos += len;

    Ok(Value::Bytes(bytes))
}

fn decode_list(
    data: &[u8],
    pos: &mut usize,
    depth: usize,
    strict: bool,
) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut list = Vec::new();

    while *pos < data.len() && data[*pos] != b'e' {
        list.push(decode_value(data, pos, depth + 1, strict)?);
    }

    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    *pos += 1;
    Ok(Value::List(list))
}

fn decode_dict(
    data: &[u8],
    pos: &mut usize,
    depth: usize,
    strict: bool,
) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut dict = BTreeMap::new();
    let mut prev_key: Option<Bytes> = None;

    while *pos < data.len() && data[*pos] != b'e' {
        // the recursive parse advances pos, so remember where the key began
        let key_pos = *pos;
        let key = match decode_value(data, pos, depth + 1, strict)? {
            Value::Bytes(b) => b,
            _ => return Err(BencodeError::UnexpectedChar(data[key_pos] as char)),
        };

        if strict {
            if let Some(prev) = &prev_key {
                if key <= *prev {
                    return Err(BencodeError::UnsortedKeys);
                }
            }
        }

        let value = decode_value(data, pos, depth + 1, strict)?;
        dict.insert(key.clone(), value);
        prev_key = Some(key);
    }

    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    *pos += 1;
    Ok(Value::Dict(dict))
}
