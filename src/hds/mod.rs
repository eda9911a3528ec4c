//! HomeKit Data Stream: framing, crypto session and the self-describing
//! payload format carried over the recording TCP connection.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error as ThisError;

pub mod dataformat;
pub mod frame;
pub mod payload;
pub mod session;

pub use dataformat::Value;
pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_PAYLOAD};
pub use payload::Payload;
pub use session::HdsSession;

pub const STATUS_SUCCESS: i64 = 0;
pub const STATUS_OUT_OF_MEMORY: i64 = 1;
pub const STATUS_TIMEOUT: i64 = 2;
pub const STATUS_HEADER_ERROR: i64 = 3;
pub const STATUS_PAYLOAD_ERROR: i64 = 4;
pub const STATUS_MISSING_PROTOCOL: i64 = 5;
pub const STATUS_PROTOCOL_SPECIFIC_ERROR: i64 = 6;

pub const PROTOCOL_CONTROL: &str = "control";
pub const PROTOCOL_DATA_SEND: &str = "dataSend";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("unknown data format tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("truncated data format value")]
    Truncated,
    #[error("{0} is not representable in the data format")]
    Unencodable(&'static str),
    #[error("frame payload length {0} exceeds the frame limit")]
    OversizeFrame(usize),
    #[error("dictionary key is not a string")]
    BadDictionaryKey,
    #[error("payload header is not a dictionary")]
    HeaderNotDictionary,
    #[error("payload header of {0} bytes does not fit the length prefix")]
    HeaderTooLong(usize),
    #[error("message authentication failed")]
    Crypto,
    #[error("session nonce counter exhausted")]
    NonceExhausted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
