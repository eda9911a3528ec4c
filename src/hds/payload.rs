//! Decrypted frame payloads: a length-prefixed header dictionary followed by
//! a protocol-defined message.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use super::dataformat::{self, Value};
use super::Error;

/// The two encoded halves of a payload, before interpretation.
pub struct PayloadRaw {
    pub header: Vec<u8>,
    pub message: Vec<u8>,
}

impl PayloadRaw {
    pub fn parse(decrypted: &[u8]) -> Result<Self, Error> {
        let header_len = usize::from(*decrypted.first().ok_or(Error::Truncated)?);
        if decrypted.len() < 1 + header_len {
            return Err(Error::Truncated);
        }

        Ok(Self {
            header: decrypted[1..1 + header_len].to_vec(),
            message: decrypted[1 + header_len..].to_vec(),
        })
    }

    pub fn assemble(&self) -> Result<Vec<u8>, Error> {
        if self.header.len() > usize::from(u8::MAX) {
            return Err(Error::HeaderTooLong(self.header.len()));
        }

        let mut out = Vec::with_capacity(1 + self.header.len() + self.message.len());
        out.push(self.header.len() as u8);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.message);
        Ok(out)
    }
}

/// A decoded payload. The header is always a dictionary carrying at least
/// `protocol` and one of `request`, `response` or `event`.
pub struct Payload {
    pub header: HashMap<String, Value>,
    pub message: Value,
}

impl Payload {
    pub fn new(header: Vec<(&str, Value)>, message: Value) -> Self {
        Self {
            header: header
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            message,
        }
    }

    pub fn parse(decrypted: &[u8]) -> Result<Self, Error> {
        let raw = PayloadRaw::parse(decrypted)?;

        let header = match dataformat::decode(&raw.header)? {
            Value::Dict(m) => m,
            _ => return Err(Error::HeaderNotDictionary),
        };
        let message = dataformat::decode(&raw.message)?;

        Ok(Self { header, message })
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let raw = PayloadRaw {
            header: dataformat::encode(&Value::Dict(self.header.clone()))?,
            message: dataformat::encode(&self.message)?,
        };
        raw.assemble()
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header.get(key).and_then(Value::as_str)
    }

    pub fn header_int(&self, key: &str) -> Option<i64> {
        self.header.get(key).and_then(Value::as_int)
    }

    pub fn protocol(&self) -> Option<&str> {
        self.header_str("protocol")
    }

    pub fn request(&self) -> Option<&str> {
        self.header_str("request")
    }

    pub fn response(&self) -> Option<&str> {
        self.header_str("response")
    }

    pub fn event(&self) -> Option<&str> {
        self.header_str("event")
    }
}
