//! The self-describing tag-prefixed serialization used by data stream
//! payload headers and messages.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use super::Error;

const BOOLEAN_TRUE: u8 = 0x01;
const BOOLEAN_FALSE: u8 = 0x02;

const INTEGER_NEGATIVE_ONE: u8 = 0x07;
const INTEGER_START: u8 = 0x08;
const INTEGER_END: u8 = 0x2E;
const INTEGER_THIRTY_NINE: u8 = 0x2F;

const SIGNED_INT16_LE: u8 = 0x31;
const SIGNED_INT32_LE: u8 = 0x32;
const SIGNED_INT64_LE: u8 = 0x33;

const FLOAT32_LE: u8 = 0x35;
const FLOAT64_LE: u8 = 0x36;

const UTF8_START: u8 = 0x40;
const UTF8_END: u8 = 0x6F;

const DATA_START: u8 = 0x70;
const DATA_END: u8 = 0x90;

const DATA_SMALL: u8 = 0x91;
const DATA_MEDIUM: u8 = 0x92;
const DATA_LARGE: u8 = 0x93;
const DATA_EXTRA_LARGE: u8 = 0x94;

const ARRAY_START: u8 = 0xD0;
const ARRAY_END: u8 = 0xDF;

const DICTIONARY_START: u8 = 0xE0;
const DICTIONARY_END: u8 = 0xEE;

/// A decoded data format value. Integers collapse to `Int` regardless of the
/// wire width; the encoder picks the smallest representation that fits.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Dict(HashMap<String, Value>),
}

impl Value {
    pub fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn as_dict(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Dict(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for non-dictionaries and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|m| m.get(key))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, Error> {
        let b = *self.buf.get(self.pos).ok_or(Error::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or(Error::Truncated)?;
        if end > self.buf.len() {
            return Err(Error::Truncated);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

pub fn decode(buf: &[u8]) -> Result<Value, Error> {
    let mut r = Reader { buf, pos: 0 };
    decode_value(&mut r)
}

fn decode_value(r: &mut Reader) -> Result<Value, Error> {
    let tag = r.byte()?;

    match tag {
        BOOLEAN_TRUE => Ok(Value::Bool(true)),
        BOOLEAN_FALSE => Ok(Value::Bool(false)),
        INTEGER_NEGATIVE_ONE => Ok(Value::Int(-1)),
        INTEGER_START..=INTEGER_END => Ok(Value::Int(i64::from(tag - INTEGER_START))),
        INTEGER_THIRTY_NINE => Ok(Value::Int(39)),
        SIGNED_INT16_LE => {
            let b = r.take(2)?;
            Ok(Value::Int(i64::from(i16::from_le_bytes([b[0], b[1]]))))
        }
        SIGNED_INT32_LE => {
            let b = r.take(4)?;
            Ok(Value::Int(i64::from(i32::from_le_bytes([
                b[0], b[1], b[2], b[3],
            ]))))
        }
        SIGNED_INT64_LE => {
            let b = r.take(8)?;
            Ok(Value::Int(i64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])))
        }
        FLOAT32_LE => {
            let b = r.take(4)?;
            Ok(Value::Float32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
        }
        FLOAT64_LE => {
            let b = r.take(8)?;
            Ok(Value::Float64(f64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])))
        }
        UTF8_START..=UTF8_END => {
            let len = usize::from(tag - UTF8_START);
            let raw = r.take(len)?;
            let s = std::str::from_utf8(raw).map_err(|_| Error::Truncated)?;
            Ok(Value::Str(s.to_string()))
        }
        DATA_START..=DATA_END => {
            let len = usize::from(tag - DATA_START);
            Ok(Value::Bytes(r.take(len)?.to_vec()))
        }
        DATA_SMALL => {
            let len = usize::from(r.byte()?);
            Ok(Value::Bytes(r.take(len)?.to_vec()))
        }
        DATA_MEDIUM => {
            let b = r.take(2)?;
            let len = usize::from(u16::from_le_bytes([b[0], b[1]]));
            Ok(Value::Bytes(r.take(len)?.to_vec()))
        }
        DATA_LARGE => {
            let b = r.take(4)?;
            let len = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
            Ok(Value::Bytes(r.take(len)?.to_vec()))
        }
        DATA_EXTRA_LARGE => {
            let b = r.take(8)?;
            let len = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            let len = usize::try_from(len).map_err(|_| Error::Truncated)?;
            Ok(Value::Bytes(r.take(len)?.to_vec()))
        }
        ARRAY_START..=ARRAY_END => {
            let len = usize::from(tag - ARRAY_START);
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(decode_value(r)?);
            }
            Ok(Value::Array(out))
        }
        DICTIONARY_START..=DICTIONARY_END => {
            let len = usize::from(tag - DICTIONARY_START);
            let mut out = HashMap::with_capacity(len);
            for _ in 0..len {
                let key = match decode_value(r)? {
                    Value::Str(s) => s,
                    _ => return Err(Error::BadDictionaryKey),
                };
                let value = decode_value(r)?;
                out.insert(key, value);
            }
            Ok(Value::Dict(out))
        }
        other => Err(Error::UnknownTag(other)),
    }
}

pub fn encode(value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    encode_value(value, &mut out)?;
    Ok(out)
}

fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), Error> {
    match value {
        Value::Bool(true) => out.push(BOOLEAN_TRUE),
        Value::Bool(false) => out.push(BOOLEAN_FALSE),
        Value::Int(n) => encode_int(*n, out)?,
        Value::Float32(f) => {
            out.push(FLOAT32_LE);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Float64(f) => {
            out.push(FLOAT64_LE);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            let len = s.len();
            if len > usize::from(UTF8_END - UTF8_START) {
                return Err(Error::Unencodable("string longer than 47 bytes"));
            }
            out.push(UTF8_START + len as u8);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => encode_bytes(b, out),
        Value::Array(items) => {
            if items.len() > usize::from(ARRAY_END - ARRAY_START) {
                return Err(Error::Unencodable("array longer than 15 entries"));
            }
            out.push(ARRAY_START + items.len() as u8);
            for item in items {
                encode_value(item, out)?;
            }
        }
        Value::Dict(entries) => {
            if entries.len() > usize::from(DICTIONARY_END - DICTIONARY_START) {
                return Err(Error::Unencodable("dictionary longer than 14 entries"));
            }
            out.push(DICTIONARY_START + entries.len() as u8);
            for (key, value) in entries {
                encode_value(&Value::Str(key.clone()), out)?;
                encode_value(value, out)?;
            }
        }
    }
    Ok(())
}

fn encode_int(n: i64, out: &mut Vec<u8>) -> Result<(), Error> {
    if n == -1 {
        out.push(INTEGER_NEGATIVE_ONE);
    } else if n == 39 {
        out.push(INTEGER_THIRTY_NINE);
    } else if (0..=38).contains(&n) {
        out.push(INTEGER_START + n as u8);
    } else if let Ok(v) = i16::try_from(n) {
        out.push(SIGNED_INT16_LE);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i32::try_from(n) {
        out.push(SIGNED_INT32_LE);
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.push(SIGNED_INT64_LE);
        out.extend_from_slice(&n.to_le_bytes());
    }
    Ok(())
}

fn encode_bytes(b: &[u8], out: &mut Vec<u8>) {
    let len = b.len();
    if len <= usize::from(DATA_END - DATA_START) {
        out.push(DATA_START + len as u8);
    } else if let Ok(v) = u8::try_from(len) {
        out.push(DATA_SMALL);
        out.push(v);
    } else if let Ok(v) = u16::try_from(len) {
        out.push(DATA_MEDIUM);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = u32::try_from(len) {
        out.push(DATA_LARGE);
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.push(DATA_EXTRA_LARGE);
        out.extend_from_slice(&(len as u64).to_le_bytes());
    }
    out.extend_from_slice(b);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) {
        let encoded = encode(&v).unwrap();
        assert_eq!(decode(&encoded).unwrap(), v, "encoding was {:02x?}", encoded);
    }

    #[test]
    fn inline_integer_boundaries() {
        assert_eq!(encode(&Value::Int(-1)).unwrap(), vec![0x07]);
        assert_eq!(encode(&Value::Int(0)).unwrap(), vec![0x08]);
        assert_eq!(encode(&Value::Int(38)).unwrap(), vec![0x2E]);
        assert_eq!(encode(&Value::Int(39)).unwrap(), vec![0x2F]);
        assert_eq!(encode(&Value::Int(40)).unwrap(), vec![0x31, 40, 0]);
    }

    #[test]
    fn tagged_integer_widths() {
        assert_eq!(encode(&Value::Int(-2)).unwrap()[0], 0x31);
        assert_eq!(encode(&Value::Int(40_000)).unwrap()[0], 0x32);
        assert_eq!(encode(&Value::Int(1 << 40)).unwrap()[0], 0x33);
        round_trip(Value::Int(-2));
        round_trip(Value::Int(40_000));
        round_trip(Value::Int(-(1 << 40)));
    }

    #[test]
    fn byte_string_length_tags() {
        assert_eq!(encode(&Value::Bytes(vec![0; 32])).unwrap()[0], 0x90);
        assert_eq!(encode(&Value::Bytes(vec![0; 33])).unwrap()[0], 0x91);
        assert_eq!(encode(&Value::Bytes(vec![0; 255])).unwrap()[0], 0x91);
        assert_eq!(encode(&Value::Bytes(vec![0; 256])).unwrap()[0], 0x92);
        round_trip(Value::Bytes(vec![0xAB; 256]));
        round_trip(Value::Bytes(Vec::new()));
    }

    #[test]
    fn strings_and_limits() {
        round_trip(Value::Str("hello".into()));
        round_trip(Value::Str("".into()));
        round_trip(Value::Str("x".repeat(47)));
        assert!(encode(&Value::Str("x".repeat(48))).is_err());
    }

    #[test]
    fn floats() {
        round_trip(Value::Float32(1.5));
        round_trip(Value::Float64(-0.25));
        assert_eq!(encode(&Value::Float32(0.0)).unwrap()[0], 0x35);
        assert_eq!(encode(&Value::Float64(0.0)).unwrap()[0], 0x36);
    }

    #[test]
    fn arrays_and_dictionaries() {
        round_trip(Value::Array(vec![
            Value::Bool(true),
            Value::Int(7),
            Value::Str("a".into()),
        ]));
        round_trip(Value::dict(vec![
            ("protocol", Value::from("control")),
            ("response", Value::from("hello")),
            ("id", Value::Int(7)),
            ("status", Value::Int(0)),
        ]));
    }

    #[test]
    fn nested_structures() {
        round_trip(Value::dict(vec![
            ("streamId", Value::Int(1)),
            ("status", Value::Int(0)),
            (
                "packets",
                Value::Array(vec![Value::dict(vec![
                    ("data", Value::Bytes(vec![1, 2, 3])),
                    (
                        "metadata",
                        Value::dict(vec![
                            ("dataType", Value::from("mediaInitialization")),
                            ("dataSequenceNumber", Value::Int(1)),
                            ("isLastDataChunk", Value::Bool(true)),
                        ]),
                    ),
                ])]),
            ),
        ]));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(matches!(decode(&[0x30]), Err(Error::UnknownTag(0x30))));
        assert!(matches!(decode(&[0xFF]), Err(Error::UnknownTag(0xFF))));
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(matches!(decode(&[]), Err(Error::Truncated)));
        assert!(matches!(decode(&[0x31, 0x01]), Err(Error::Truncated)));
        assert!(matches!(decode(&[0x45, b'a']), Err(Error::Truncated)));
        // Dictionary announcing one entry but carrying none.
        assert!(decode(&[0xE1]).is_err());
    }
}
