//! Stream transport — message framing over one peer socket, with optional
//! deflate in either direction.
//!
//! The reader side accumulates raw socket bytes (inflating them first once
//! inbound compression is active) and yields complete frames. The writer
//! side deflates outbound frames with a sync flush after each message so
//! the peer sees timely data. Once enabled, compression on a direction
//! stays on until the socket closes.

use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use gnuleaf_core::descriptor::{self, Descriptor};

/// Outbound queue bound. A session that backs up past this is congested
/// and gets closed with BYE 500.
pub const MAX_OUTBOUND_QUEUE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("descriptor framing error: {0}")]
    Decode(#[from] descriptor::DecodeError),

    #[error("inflate error: {0}")]
    Inflate(#[from] flate2::DecompressError),

    #[error("deflate error: {0}")]
    Deflate(#[from] flate2::CompressError),
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Buffers inbound bytes and yields complete frames.
pub struct FrameReader {
    buf: BytesMut,
    inflater: Option<Decompress>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            inflater: None,
        }
    }

    /// Switch the inbound direction to deflate. Takes effect for every
    /// byte pushed after this call; already-buffered plaintext is kept.
    pub fn enable_inbound_deflate(&mut self) {
        // zlib wrapper, matching what peers negotiate as "deflate"
        self.inflater = Some(Decompress::new(true));
    }

    /// Append one chunk of raw socket bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        match &mut self.inflater {
            None => {
                self.buf.extend_from_slice(chunk);
                Ok(())
            }
            Some(inflater) => {
                let mut out = Vec::with_capacity(chunk.len() * 4);
                let mut pos = 0usize;
                loop {
                    out.reserve(8192);
                    let before_in = inflater.total_in();
                    let status =
                        inflater.decompress_vec(&chunk[pos..], &mut out, FlushDecompress::None)?;
                    pos += (inflater.total_in() - before_in) as usize;
                    if matches!(status, Status::StreamEnd) {
                        break;
                    }
                    if pos >= chunk.len() && out.len() < out.capacity() {
                        break;
                    }
                }
                self.buf.extend_from_slice(&out);
                Ok(())
            }
        }
    }

    /// Next complete binary descriptor, if the buffer holds one.
    pub fn next_descriptor(&mut self) -> Result<Option<Descriptor>, TransportError> {
        match descriptor::parse(&self.buf)? {
            descriptor::Parsed::Descriptor(d, used) => {
                self.buf.advance(used);
                Ok(Some(d))
            }
            descriptor::Parsed::NeedMore => Ok(None),
        }
    }

}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Prepares outbound frames for the socket, deflating when negotiated.
pub struct FrameWriter {
    deflater: Option<Compress>,
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameWriter {
    pub fn new() -> Self {
        Self { deflater: None }
    }

    /// Switch the outbound direction to deflate for every frame prepared
    /// after this call.
    pub fn enable_outbound_deflate(&mut self) {
        self.deflater = Some(Compress::new(Compression::fast(), true));
    }

    /// Turn one frame into the exact bytes to write to the socket.
    ///
    /// With compression on, the stream is sync-flushed after the frame so
    /// the peer can decode it without waiting for more traffic.
    pub fn prepare(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        match &mut self.deflater {
            None => Ok(frame.to_vec()),
            Some(deflater) => {
                let mut out = Vec::with_capacity(frame.len() + 64);
                let mut pos = 0usize;
                loop {
                    out.reserve(4096);
                    let before_in = deflater.total_in();
                    deflater.compress_vec(&frame[pos..], &mut out, FlushCompress::Sync)?;
                    pos += (deflater.total_in() - before_in) as usize;
                    if pos >= frame.len() && out.len() < out.capacity() {
                        break;
                    }
                }
                Ok(out)
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
