//! Ordered frame production for one upload
//!
//! Frames are built lazily, one per `next()`, so the session never holds more
//! than the frame it is writing.

use std::fmt;
use std::iter::Enumerate;
use std::num::NonZeroUsize;

use ota_proto::{ChunkRanges, encode_chunk, encode_end, encode_init};

use crate::error::UploadError;
use crate::firmware::{FirmwareImage, length_field};
use crate::signature::SignatureBundle;

/// Step of the upload protocol, used to report where a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovery,
    Connect,
    Init,
    SignatureChunk(usize),
    FirmwareChunk(usize),
    End,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Discovery => write!(f, "discovery"),
            Phase::Connect => write!(f, "connect"),
            Phase::Init => write!(f, "INIT"),
            Phase::SignatureChunk(i) => write!(f, "signature chunk {i}"),
            Phase::FirmwareChunk(i) => write!(f, "firmware chunk {i}"),
            Phase::End => write!(f, "END"),
        }
    }
}

/// Iterator over every frame of an upload: INIT, eMj chunks, firmware chunks, END
#[derive(Debug, Clone)]
pub struct FramePlan<'a> {
    init: Option<Vec<u8>>,
    emj: &'a [u8],
    signature: Enumerate<ChunkRanges>,
    firmware_bytes: &'a [u8],
    firmware: Enumerate<ChunkRanges>,
    end_pending: bool,
    signature_chunks: usize,
    firmware_chunks: usize,
    total_bytes: usize,
}

impl<'a> FramePlan<'a> {
    pub fn new(
        image: &'a FirmwareImage,
        bundle: &'a SignatureBundle,
        chunk_size: NonZeroUsize,
    ) -> Result<Self, UploadError> {
        let total_size = image.total_size()?;
        let emj_len = length_field("eMj", bundle.emj.len())?;

        let init = encode_init(total_size, bundle.index, &bundle.sj, &bundle.cj, emj_len);
        let signature = ChunkRanges::new(bundle.emj.len(), chunk_size);
        let firmware = ChunkRanges::new(image.len(), chunk_size);
        let signature_chunks = signature.len();
        let firmware_chunks = firmware.len();
        let total_bytes = init.len()
            + bundle.emj.len()
            + signature_chunks
            + image.len()
            + firmware_chunks
            + 1;

        Ok(Self {
            init: Some(init),
            emj: &bundle.emj,
            signature: signature.enumerate(),
            firmware_bytes: image.as_bytes(),
            firmware: firmware.enumerate(),
            end_pending: true,
            signature_chunks,
            firmware_chunks,
            total_bytes,
        })
    }

    pub fn signature_chunks(&self) -> usize {
        self.signature_chunks
    }

    pub fn firmware_chunks(&self) -> usize {
        self.firmware_chunks
    }

    /// Bytes handed to the transport over the whole plan, tags included
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl Iterator for FramePlan<'_> {
    type Item = (Phase, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(init) = self.init.take() {
            return Some((Phase::Init, init));
        }
        if let Some((i, range)) = self.signature.next() {
            return Some((Phase::SignatureChunk(i), encode_chunk(&self.emj[range])));
        }
        if let Some((i, range)) = self.firmware.next() {
            return Some((Phase::FirmwareChunk(i), encode_chunk(&self.firmware_bytes[range])));
        }
        if self.end_pending {
            self.end_pending = false;
            return Some((Phase::End, encode_end()));
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::from(self.init.is_some())
            + self.signature.len()
            + self.firmware.len()
            + usize::from(self.end_pending);
        (n, Some(n))
    }
}

impl ExactSizeIterator for FramePlan<'_> {}
