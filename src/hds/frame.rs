//! Length-prefixed data stream frames.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io::{Read, Write};

use super::session::HdsSession;
use super::Error;

/// Upper bound on a single frame payload; anything larger is a protocol
/// error rather than an allocation request. Must sit below the 24-bit length
/// ceiling or the check could never fire.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

const FRAME_TYPE_DATA: u8 = 0x01;

/// A frame as read off the wire: 4-byte header, encrypted payload and the
/// 16-byte Poly1305 tag. The header doubles as the AEAD associated data.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: [u8; 4],
    pub payload: Vec<u8>,
    pub auth_tag: [u8; 16],
}

pub fn read_frame(r: &mut impl Read) -> Result<Frame, Error> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;

    // Bytes 1..3 are a big-endian 24-bit payload length.
    let payload_len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(Error::OversizeFrame(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)?;

    let mut auth_tag = [0u8; 16];
    r.read_exact(&mut auth_tag)?;

    Ok(Frame {
        header,
        payload,
        auth_tag,
    })
}

impl Frame {
    /// Decrypts the payload with the session's receive key and counter.
    pub fn open(&self, session: &mut HdsSession) -> Result<Vec<u8>, Error> {
        session.decrypt(&self.payload, &self.auth_tag, &self.header)
    }
}

/// Header for a data frame carrying `len` payload bytes. The length lands in
/// bytes 1..3, then byte 0 is overwritten with the frame type.
fn data_frame_header(len: usize) -> Result<[u8; 4], Error> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(Error::OversizeFrame(len));
    }
    let mut header = (len as u32).to_be_bytes();
    header[0] = FRAME_TYPE_DATA;
    Ok(header)
}

/// Encrypts `plaintext` under the session's send key and writes the framed
/// result.
pub fn write_frame(
    w: &mut impl Write,
    session: &mut HdsSession,
    plaintext: &[u8],
) -> Result<(), Error> {
    let header = data_frame_header(plaintext.len())?;
    let (ciphertext, auth_tag) = session.encrypt(plaintext, &header)?;

    w.write_all(&header)?;
    w.write_all(&ciphertext)?;
    w.write_all(&auth_tag)?;
    w.flush()?;
    Ok(())
}
