//! MP4 chunk model and the box read loop shared by the mother stream and the
//! recording sessions.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io::{self, Read};

use bytes::{BufMut, BytesMut};

pub const FTYP: &str = "ftyp";
pub const MOOV: &str = "moov";

/// Box types we keep. Anything else is discarded by length so a stray box
/// cannot desynchronize the stream.
const KNOWN_CHUNK_TYPES: [&str; 24] = [
    "ftyp", "mdat", "moov", "pnot", "udta", "uuid", "moof", "free", "skip", "jP2 ", "wide",
    "load", "ctab", "imap", "matt", "kmat", "clip", "crgn", "sync", "chap", "tmcd", "scpt",
    "ssrc", "PICT",
];

/// One MP4 box as it appeared on the wire. `size` is the full box size
/// including the 8-byte header and the sub-type, so a chunk reassembles
/// byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub size: u32,
    pub main_type: String,
    pub sub_type: String,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.size as usize);
        buf.put_u32(self.size);
        buf.extend_from_slice(self.main_type.as_bytes());
        if !self.sub_type.is_empty() {
            buf.extend_from_slice(self.sub_type.as_bytes());
        }
        buf.extend_from_slice(&self.data);
        buf.to_vec()
    }
}

/// Incremental box reader over a byte stream (the transcoder's stdout).
pub struct ChunkReader<R: Read> {
    inner: R,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next whitelisted chunk. Returns `None` on a clean end of
    /// stream; a stream that ends mid-box is an error.
    pub fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        loop {
            let mut header = [0u8; 8];
            if !read_exact_or_eof(&mut self.inner, &mut header)? {
                return Ok(None);
            }

            let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let main_type = match std::str::from_utf8(&header[4..]) {
                Ok(t) => t.to_string(),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("non-ASCII box type {:02x?}", &header[4..]),
                    ));
                }
            };

            // The file-type box carries its major brand right after the header.
            let mut sub_type = String::new();
            if main_type == FTYP {
                let mut brand = [0u8; 4];
                self.inner.read_exact(&mut brand)?;
                sub_type = String::from_utf8_lossy(&brand).into_owned();
            }

            let body_len = (size as usize)
                .checked_sub(8 + sub_type.len())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("box {} has impossible size {}", main_type, size),
                    )
                })?;

            if !KNOWN_CHUNK_TYPES.contains(&main_type.as_str()) {
                debug!("unknown chunk type {:?}, discarding {} bytes", main_type, body_len);
                io::copy(
                    &mut (&mut self.inner).take(body_len as u64),
                    &mut io::sink(),
                )?;
                continue;
            }

            let mut data = vec![0u8; body_len];
            self.inner.read_exact(&mut data)?;

            return Ok(Some(Chunk {
                size,
                main_type,
                sub_type,
                data,
            }));
        }
    }
}

/// Like `read_exact`, but a clean EOF before the first byte returns false.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended mid-box",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Raw box fixture shared by the pipeline tests.
#[cfg(test)]
pub fn box_bytes(main_type: &str, sub_type: &str, body: &[u8]) -> Vec<u8> {
    let size = (8 + sub_type.len() + body.len()) as u32;
    let mut out = Vec::new();
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(main_type.as_bytes());
    out.extend_from_slice(sub_type.as_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_assembles_to_input_bytes() {
        let raw = box_bytes("moof", "", &[0xAA; 72]);
        let mut reader = ChunkReader::new(&raw[..]);
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.size, 80);
        assert_eq!(chunk.main_type, "moof");
        assert_eq!(chunk.sub_type, "");
        assert_eq!(chunk.size as usize, 8 + chunk.data.len());
        assert_eq!(chunk.assemble(), raw);
    }

    #[test]
    fn ftyp_reads_major_brand_sub_type() {
        let raw = box_bytes(FTYP, "isom", &[0u8; 8]);
        let mut reader = ChunkReader::new(&raw[..]);
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.main_type, "ftyp");
        assert_eq!(chunk.sub_type, "isom");
        assert_eq!(chunk.size as usize, 8 + 4 + chunk.data.len());
        assert_eq!(chunk.assemble(), raw);
    }

    #[test]
    fn unknown_box_types_are_discarded() {
        let mut raw = box_bytes("zzzz", "", &[1, 2, 3, 4]);
        raw.extend_from_slice(&box_bytes("mdat", "", &[9; 16]));
        let mut reader = ChunkReader::new(&raw[..]);
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.main_type, "mdat");
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn truncated_box_is_an_error() {
        let raw = box_bytes("mdat", "", &[7; 32]);
        let mut reader = ChunkReader::new(&raw[..raw.len() - 1]);
        assert!(reader.next_chunk().is_err());
    }

    #[test]
    fn clean_eof_returns_none() {
        let mut reader = ChunkReader::new(&[][..]);
        assert!(reader.next_chunk().unwrap().is_none());
    }
}
