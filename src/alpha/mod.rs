//! Alpha-plane decompression.
//!
//! Each alpha unit is the head of an alpha + video frame: the ES header, the alpha
//! sub-block and the alpha body. The body carries the placement rectangle and the
//! compressed plane, which is expanded into a pooled `w * h` buffer and handed to the
//! external [`AlphaRenderer`] together with the frame timestamp.

pub mod rle;

use std::time::Instant;

use flate2::{Decompress, FlushDecompress, Status};
use tracing::{debug, trace, warn};

use crate::error::{Result, VcsError};
use crate::media::es::ALPHA_BODY_OFFSET;
use crate::media::{EsFrame, NativeBufferPool, PooledBuffer};
use crate::wire::{read_i32_be, read_i64_le};

const PLACEMENT_LEN: usize = 20;
const TIMESTAMP_OFFSET: usize = 10;

/// Compression applied to an alpha plane, keyed by the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaCompression {
    None,
    Zip,
    Rle,
    ZipRle,
    Lz4,
}

impl AlphaCompression {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(AlphaCompression::None),
            1 => Some(AlphaCompression::Zip),
            2 => Some(AlphaCompression::Rle),
            3 => Some(AlphaCompression::ZipRle),
            4 => Some(AlphaCompression::Lz4),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            AlphaCompression::None => 0,
            AlphaCompression::Zip => 1,
            AlphaCompression::Rle => 2,
            AlphaCompression::ZipRle => 3,
            AlphaCompression::Lz4 => 4,
        }
    }
}

/// Where an alpha plane lands on the video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlphaPlacement {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl AlphaPlacement {
    pub fn area(&self) -> usize {
        self.width.max(0) as usize * self.height.max(0) as usize
    }
}

/// A decompressed alpha plane. Dropping it returns the buffer to its pool.
#[derive(Debug)]
pub struct AlphaFrame {
    pub placement: AlphaPlacement,
    pub timestamp: i64,
    pub buffer: PooledBuffer,
    pub length: usize,
}

impl AlphaFrame {
    pub fn plane(&self) -> &[u8] {
        &self.buffer[..self.length]
    }
}

/// Consumer of decompressed alpha planes, typically the compositing surface.
pub trait AlphaRenderer: Send + Sync {
    fn update_alpha_channel(&self, frame: AlphaFrame);

    /// Presentation timestamp of the video frame currently on screen.
    fn set_alpha_timestamp(&self, timestamp: i64);
}

/// Stateful alpha decompressor. One instance per alpha render thread.
pub struct AlphaDecompressor {
    inflater: Decompress,
    pool: NativeBufferPool,
}

impl AlphaDecompressor {
    pub fn new(pool: NativeBufferPool) -> Self {
        Self { inflater: Decompress::new(true), pool }
    }

    pub fn pool(&self) -> &NativeBufferPool {
        &self.pool
    }

    /// Decompresses one alpha unit.
    ///
    /// Returns `Ok(None)` for units without an alpha body or when the plane expands
    /// to nothing.
    pub fn decompress(&mut self, unit: &[u8]) -> Result<Option<AlphaFrame>> {
        let frame = EsFrame::new(unit)?;
        let Some(block) = frame.alpha_sub_block()? else {
            return Ok(None);
        };
        if block.body_length <= 0 {
            return Ok(None);
        }
        let tag = block.compression;
        let timestamp = read_i64_le(unit, TIMESTAMP_OFFSET)?;

        let base = ALPHA_BODY_OFFSET;
        let placement = AlphaPlacement {
            x: read_i32_be(unit, base)?,
            y: read_i32_be(unit, base + 4)?,
            width: read_i32_be(unit, base + 8)?,
            height: read_i32_be(unit, base + 12)?,
        };
        let compressed_len = read_i32_be(unit, base + 16)?;
        if placement.width <= 0 || placement.height <= 0 || compressed_len < 0 {
            return Err(VcsError::decompression_error(
                tag,
                format!("invalid placement {:?} with {} compressed bytes", placement, compressed_len),
            ));
        }
        let plane = placement.area();
        if plane > self.pool.buffer_size() {
            return Err(VcsError::decompression_error(
                tag,
                format!("plane of {} bytes exceeds pool buffers of {}", plane, self.pool.buffer_size()),
            ));
        }
        let start = base + PLACEMENT_LEN;
        let src = unit.get(start..start + compressed_len as usize).ok_or_else(|| {
            VcsError::decompression_error(
                tag,
                format!("{} compressed bytes at {} exceed unit of {}", compressed_len, start, unit.len()),
            )
        })?;

        let compression = AlphaCompression::from_tag(tag)
            .ok_or_else(|| VcsError::decompression_error(tag, "unknown compression tag"))?;

        let started = Instant::now();
        let mut out = self.pool.acquire_or_allocate();
        let produced = match compression {
            AlphaCompression::None => {
                let n = src.len().min(plane);
                out[..n].copy_from_slice(&src[..n]);
                n
            }
            AlphaCompression::Zip => self.inflate(tag, src, &mut out[..plane])?,
            AlphaCompression::Rle => rle::decode(&mut out[..plane], src)?,
            AlphaCompression::ZipRle => {
                let mut scratch = self.pool.acquire_or_allocate();
                let inflated = self.inflate(tag, src, &mut scratch)?;
                rle::decode(&mut out[..plane], &scratch[..inflated])?
            }
            AlphaCompression::Lz4 => lz4_flex::block::decompress_into(src, &mut out[..plane])
                .map_err(|e| VcsError::decompression_error(tag, e.to_string()))?,
        };

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            tag,
            width = placement.width,
            height = placement.height,
            compressed_len,
            "Alpha plane decompressed"
        );

        if produced == 0 {
            trace!(tag, "Alpha plane expanded to nothing");
            return Ok(None);
        }
        Ok(Some(AlphaFrame { placement, timestamp, buffer: out, length: plane }))
    }

    /// Inflates `src` into `dst`. The inflater is reset on every path.
    fn inflate(&mut self, tag: i32, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let status = self.inflater.decompress(src, dst, FlushDecompress::Finish);
        let produced = self.inflater.total_out() as usize;
        self.inflater.reset(true);

        match status {
            Ok(Status::StreamEnd) => Ok(produced),
            Ok(_) if produced > 0 => {
                warn!(tag, produced, expected = dst.len(), "Inflate stopped before stream end, plane is partial");
                Ok(produced)
            }
            Ok(status) => Err(VcsError::decompression_error(tag, format!("inflate produced no data ({:?})", status))),
            Err(e) => Err(VcsError::decompression_error(tag, e.to_string())),
        }
    }
}
