//! OTA wire protocol - message types, framing and chunking
//!
//! Every frame is a one byte message type followed by a type specific payload:
//!
//! | Frame | Layout |
//! |-------|--------|
//! | INIT  | `0x01` total_size(4) index(1) sj cj emj_len(4) |
//! | CHUNK | `0x02` payload (at most chunk size bytes) |
//! | END   | `0x03` |
//!
//! Integers are big-endian. `sj` and `cj` carry no length prefix, the receiver
//! knows their size from the signature scheme.

pub mod ble;

use std::io;
use std::num::NonZeroUsize;
use std::ops::Range;

// Message types
pub const MSG_INIT: u8 = 0x01;
pub const MSG_CHUNK: u8 = 0x02;
pub const MSG_END: u8 = 0x03;

/// Default CHUNK payload size, stays under common BLE ATT MTUs
pub const DEFAULT_CHUNK_SIZE: usize = 180;

/// Largest CHUNK payload: tag + payload must fit a 512 byte attribute value
pub const MAX_CHUNK_SIZE: usize = 511;

/// Fixed part of the INIT payload: total_size(4) + index(1) + emj_len(4)
const INIT_FIXED_LEN: usize = 4 + 1 + 4;

/// INIT message - announces the firmware size and the signature bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub total_size: u32,
    pub index: u8,
    pub sj: Vec<u8>,
    pub cj: Vec<u8>,
    /// Byte length of the eMj field that follows as CHUNK frames
    pub emj_len: u32,
}

impl Init {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INIT_FIXED_LEN + self.sj.len() + self.cj.len());
        put_init(&mut buf, self.total_size, self.index, &self.sj, &self.cj, self.emj_len);
        buf
    }

    /// Decode an INIT payload (without the type byte).
    ///
    /// `sj_len` and `cj_len` come from the signature scheme, the frame does not
    /// describe them.
    pub fn from_bytes(data: &[u8], sj_len: usize, cj_len: usize) -> io::Result<Self> {
        let expected = INIT_FIXED_LEN + sj_len + cj_len;
        if data.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("INIT payload is {} bytes, expected {expected}", data.len()),
            ));
        }

        let total_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let index = data[4];
        let sj_end = 5 + sj_len;
        let cj_end = sj_end + cj_len;
        let sj = data[5..sj_end].to_vec();
        let cj = data[sj_end..cj_end].to_vec();
        let emj_len = u32::from_be_bytes([
            data[cj_end],
            data[cj_end + 1],
            data[cj_end + 2],
            data[cj_end + 3],
        ]);

        Ok(Self { total_size, index, sj, cj, emj_len })
    }
}

fn put_init(buf: &mut Vec<u8>, total_size: u32, index: u8, sj: &[u8], cj: &[u8], emj_len: u32) {
    buf.extend_from_slice(&total_size.to_be_bytes());
    buf.push(index);
    buf.extend_from_slice(sj);
    buf.extend_from_slice(cj);
    buf.extend_from_slice(&emj_len.to_be_bytes());
}

/// Build a complete INIT frame
pub fn encode_init(total_size: u32, index: u8, sj: &[u8], cj: &[u8], emj_len: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + INIT_FIXED_LEN + sj.len() + cj.len());
    buf.push(MSG_INIT);
    put_init(&mut buf, total_size, index, sj, cj, emj_len);
    buf
}

/// Build a CHUNK frame carrying `payload`
pub fn encode_chunk(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(MSG_CHUNK);
    buf.extend_from_slice(payload);
    buf
}

/// Build the END frame
pub fn encode_end() -> Vec<u8> {
    vec![MSG_END]
}

/// Frame: a message type followed by its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn init(init: &Init) -> Self {
        Self::new(MSG_INIT, init.to_bytes())
    }

    pub fn end() -> Self {
        Self::new(MSG_END, Vec::new())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload.len());
        buf.push(self.msg_type);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let (&msg_type, payload) = data
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty frame"))?;

        match msg_type {
            MSG_INIT | MSG_CHUNK => {}
            MSG_END if payload.is_empty() => {}
            MSG_END => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "END carries a payload"));
            }
            t => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message type 0x{t:02x}"),
                ));
            }
        }

        Ok(Self::new(msg_type, payload.to_vec()))
    }
}

/// Number of chunks needed to carry `len` bytes
pub fn chunk_count(len: usize, chunk_size: NonZeroUsize) -> usize {
    len.div_ceil(chunk_size.get())
}

/// Iterator over consecutive chunk boundaries of a buffer.
///
/// Ranges start at offset 0, every range but the last is exactly
/// `chunk_size` long. An empty buffer yields nothing.
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    len: usize,
    chunk_size: NonZeroUsize,
    offset: usize,
}

impl ChunkRanges {
    pub fn new(len: usize, chunk_size: NonZeroUsize) -> Self {
        Self { len, chunk_size, offset: 0 }
    }
}

impl Iterator for ChunkRanges {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.offset >= self.len {
            return None;
        }
        let start = self.offset;
        let end = start.saturating_add(self.chunk_size.get()).min(self.len);
        self.offset = end;
        Some(start..end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = chunk_count(self.len - self.offset, self.chunk_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkRanges {}
