// Stream compression layers negotiated after IDENTIFY: raw deflate and framed snappy.
use bytes::{Buf, BytesMut};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::Write;

use crate::{Error, Result};

const SCRATCH_BYTES: usize = 16 * 1024;

// Snappy framing format chunk types.
const CHUNK_STREAM_ID: u8 = 0xff;
const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_PADDING: u8 = 0xfe;
const CHUNK_SKIPPABLE_MIN: u8 = 0x80;
const CHUNK_HEADER_LEN: usize = 4;
const CHUNK_CRC_LEN: usize = 4;
const STREAM_ID_BODY: &[u8] = b"sNaPpY";

/// Compression applied to the byte stream after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate { level: u32 },
    Snappy,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Deflate { .. } => "deflate",
            Compression::Snappy => "snappy",
        }
    }
}

pub(crate) enum Compressor {
    Identity,
    Deflate(Box<Compress>),
    Snappy(Box<snap::write::FrameEncoder<Vec<u8>>>),
}

impl Compressor {
    pub(crate) fn new(compression: Compression) -> Self {
        match compression {
            Compression::None => Compressor::Identity,
            // Negative window bits in zlib terms: raw deflate, no zlib header.
            Compression::Deflate { level } => Compressor::Deflate(Box::new(Compress::new(
                flate2::Compression::new(level.clamp(1, 9)),
                false,
            ))),
            Compression::Snappy => {
                Compressor::Snappy(Box::new(snap::write::FrameEncoder::new(Vec::new())))
            }
        }
    }

    /// Encodes `data` and flushes, so the peer can decode everything written so far.
    pub(crate) fn compress(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Compressor::Identity => {
                out.extend_from_slice(data);
                Ok(())
            }
            Compressor::Deflate(inner) => deflate(inner, data, out),
            Compressor::Snappy(encoder) => {
                encoder.write_all(data).map_err(Error::Io)?;
                encoder.flush().map_err(Error::Io)?;
                let framed = encoder.get_mut();
                out.extend_from_slice(framed);
                framed.clear();
                Ok(())
            }
        }
    }
}

fn deflate(inner: &mut Compress, mut data: &[u8], out: &mut BytesMut) -> Result<()> {
    let mut scratch = [0u8; SCRATCH_BYTES];
    loop {
        let before_in = inner.total_in();
        let before_out = inner.total_out();
        inner
            .compress(data, &mut scratch, FlushCompress::Sync)
            .map_err(|err| Error::Compression(err.to_string()))?;
        let consumed = (inner.total_in() - before_in) as usize;
        let produced = (inner.total_out() - before_out) as usize;
        out.extend_from_slice(&scratch[..produced]);
        data = &data[consumed..];
        // A full scratch buffer means the sync flush may not be complete yet.
        if data.is_empty() && produced < scratch.len() {
            return Ok(());
        }
    }
}

pub(crate) enum Decompressor {
    Identity,
    Deflate(Box<Decompress>),
    Snappy(SnappyFrames),
}

impl Decompressor {
    pub(crate) fn new(compression: Compression) -> Self {
        match compression {
            Compression::None => Decompressor::Identity,
            Compression::Deflate { .. } => {
                Decompressor::Deflate(Box::new(Decompress::new(false)))
            }
            Compression::Snappy => Decompressor::Snappy(SnappyFrames::default()),
        }
    }

    pub(crate) fn decompress(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Decompressor::Identity => {
                out.extend_from_slice(data);
                Ok(())
            }
            Decompressor::Deflate(inner) => inflate(inner, data, out),
            Decompressor::Snappy(frames) => frames.push(data, out),
        }
    }
}

fn inflate(inner: &mut Decompress, mut data: &[u8], out: &mut BytesMut) -> Result<()> {
    let mut scratch = [0u8; SCRATCH_BYTES];
    loop {
        let before_in = inner.total_in();
        let before_out = inner.total_out();
        let status = inner
            .decompress(data, &mut scratch, FlushDecompress::Sync)
            .map_err(|err| Error::Compression(err.to_string()))?;
        let consumed = (inner.total_in() - before_in) as usize;
        let produced = (inner.total_out() - before_out) as usize;
        out.extend_from_slice(&scratch[..produced]);
        data = &data[consumed..];
        if status == Status::StreamEnd {
            return Err(Error::Compression("deflate stream ended".to_string()));
        }
        if produced < scratch.len() && (data.is_empty() || consumed == 0) {
            return Ok(());
        }
    }
}

/// Incremental parser for the snappy framing format.
///
/// Chunks may straddle reads, so partial chunks stay buffered until complete.
/// Data chunks carry a masked CRC-32C of their uncompressed bytes, checked
/// before anything is handed out.
pub(crate) struct SnappyFrames {
    pending: BytesMut,
    decoder: snap::raw::Decoder,
}

impl Default for SnappyFrames {
    fn default() -> Self {
        Self {
            pending: BytesMut::new(),
            decoder: snap::raw::Decoder::new(),
        }
    }
}

impl SnappyFrames {
    fn push(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        self.pending.extend_from_slice(data);
        loop {
            if self.pending.len() < CHUNK_HEADER_LEN {
                return Ok(());
            }
            let chunk_type = self.pending[0];
            let len = u32::from_le_bytes([self.pending[1], self.pending[2], self.pending[3], 0])
                as usize;
            if self.pending.len() < CHUNK_HEADER_LEN + len {
                return Ok(());
            }
            self.pending.advance(CHUNK_HEADER_LEN);
            let chunk = self.pending.split_to(len);
            match chunk_type {
                CHUNK_STREAM_ID => {
                    if chunk.as_ref() != STREAM_ID_BODY {
                        return Err(Error::Compression("bad snappy stream identifier".into()));
                    }
                }
                CHUNK_COMPRESSED => {
                    let (crc, payload) = chunk_payload(&chunk)?;
                    let decoded = self
                        .decoder
                        .decompress_vec(payload)
                        .map_err(|err| Error::Compression(err.to_string()))?;
                    verify_crc(crc, &decoded)?;
                    out.extend_from_slice(&decoded);
                }
                CHUNK_UNCOMPRESSED => {
                    let (crc, payload) = chunk_payload(&chunk)?;
                    verify_crc(crc, payload)?;
                    out.extend_from_slice(payload);
                }
                CHUNK_PADDING => {}
                other if other >= CHUNK_SKIPPABLE_MIN => {}
                other => {
                    return Err(Error::Compression(format!(
                        "reserved snappy chunk type {other:#04x}"
                    )));
                }
            }
        }
    }
}

fn chunk_payload(chunk: &[u8]) -> Result<(u32, &[u8])> {
    if chunk.len() < CHUNK_CRC_LEN {
        return Err(Error::Compression("snappy chunk too short".into()));
    }
    let crc = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    Ok((crc, &chunk[CHUNK_CRC_LEN..]))
}

fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    crc.rotate_right(15).wrapping_add(0xa282_ead8)
}

fn verify_crc(expected: u32, data: &[u8]) -> Result<()> {
    let actual = masked_crc(data);
    if actual != expected {
        return Err(Error::Compression(format!(
            "snappy checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
        )));
    }
    Ok(())
}

// Lets tests build raw chunks without a second encoder implementation.
#[cfg(test)]
fn put_chunk(out: &mut Vec<u8>, chunk_type: u8, body: &[u8]) {
    out.push(chunk_type);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
    out.extend_from_slice(body);
}
