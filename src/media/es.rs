//! Parser for the proprietary elementary-stream container.
//!
//! ```text
//! offset  size  field
//!      0     1  content type (0x12 video, 0x22 audio, 0x52 alpha + video)
//!      1     1  content count
//!      2     1  video codec sub-type
//!      3     1  audio codec sub-type
//!      4     1  optional info (0x01 = additional frame)
//!     10     8  presentation timestamp (reversed)
//!     18     4  contents length (reversed), plain video/audio only
//! ```
//!
//! Alpha + video frames carry a 28-byte alpha sub-block at offset 10 whose body is
//! followed by the inner ES payload at `10 + 28 + body_length`:
//!
//! ```text
//!     18     4  alpha data length (reversed)
//!     22     4  alpha compression tag (big-endian)
//!     26     4  alpha body length (big-endian)
//!     30    20  x, y, w, h, compressed length (big-endian)
//!     50     n  compressed alpha plane
//! ```
//!
//! The inner payload is a reversed `i32` length followed by the codec bytes.

use std::fmt;

use crate::error::{Result, VcsError};
use crate::wire::{read_i32_be, read_i32_le, read_i64_le, read_u8};

pub const CONTENT_TYPE_VIDEO: u8 = 0x12;
pub const CONTENT_TYPE_AUDIO: u8 = 0x22;
pub const CONTENT_TYPE_ALPHA_VIDEO: u8 = 0x52;

const OPTIONAL_INFO_ADDITIONAL_FRAME: u8 = 0x01;

const TIMESTAMP_OFFSET: usize = 10;
const PLAIN_PAYLOAD_OFFSET: usize = 18;
const ALPHA_BLOCK_OFFSET: usize = 10;
const ALPHA_BLOCK_LEN: usize = 28;
/// Bytes preceding the alpha body: header, timestamp and the three alpha fields.
pub const ALPHA_BODY_OFFSET: usize = 30;

const NALU_TYPE_SLICE: u8 = 1;
const NALU_TYPE_IDR: u8 = 5;

/// AAC sampling frequencies indexed by the ADTS frequency index.
const AAC_SAMPLE_RATES: [u32; 13] =
    [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350];
const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Kind of content carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Video,
    Audio,
    AlphaVideo,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(value: u8) -> Self {
        match value {
            CONTENT_TYPE_VIDEO => ContentType::Video,
            CONTENT_TYPE_AUDIO => ContentType::Audio,
            CONTENT_TYPE_ALPHA_VIDEO => ContentType::AlphaVideo,
            other => ContentType::Unknown(other),
        }
    }
}

/// Presentation timestamp of a frame.
///
/// Additional frames must not advance the presentation clock. They are kept apart
/// from real timestamps here and only collapse to the reserved numeric value at the
/// codec boundary, where a plain integer is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTimestamp {
    Hold,
    Pts(i64),
}

impl FrameTimestamp {
    /// Numeric value standing for [`FrameTimestamp::Hold`] at the codec boundary.
    pub const HOLD_PTS: i64 = 1;

    pub fn to_pts(self) -> i64 {
        match self {
            FrameTimestamp::Hold => Self::HOLD_PTS,
            FrameTimestamp::Pts(pts) => pts,
        }
    }

    pub fn from_pts(pts: i64) -> Self {
        if pts == Self::HOLD_PTS { FrameTimestamp::Hold } else { FrameTimestamp::Pts(pts) }
    }

    pub fn is_hold(self) -> bool {
        matches!(self, FrameTimestamp::Hold)
    }
}

/// H.264 picture classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// IDR slice.
    I,
    /// Non-IDR slice.
    P,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::I => f.write_str("I"),
            FrameType::P => f.write_str("P"),
        }
    }
}

/// Fixed fields of the alpha sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlphaSubBlock {
    pub data_length: i32,
    pub compression: i32,
    pub body_length: i32,
}

/// Borrowed view over one received frame.
#[derive(Clone, Copy)]
pub struct EsFrame<'a> {
    data: &'a [u8],
}

impl<'a> EsFrame<'a> {
    /// Wraps `data`, rejecting input too short to hold the fixed header.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < PLAIN_PAYLOAD_OFFSET {
            return Err(VcsError::parse_error(
                "ES frame header",
                format!("frame of {} bytes is shorter than the {} byte header", data.len(), PLAIN_PAYLOAD_OFFSET),
            ));
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn content_type(&self) -> ContentType {
        ContentType::from(self.data[0])
    }

    pub fn content_count(&self) -> u8 {
        self.data[1]
    }

    pub fn video_type(&self) -> u8 {
        self.data[2]
    }

    pub fn audio_type(&self) -> u8 {
        self.data[3]
    }

    pub fn optional_info(&self) -> u8 {
        self.data[4]
    }

    pub fn is_additional_frame(&self) -> bool {
        self.optional_info() == OPTIONAL_INFO_ADDITIONAL_FRAME
    }

    /// Alpha sub-block fields, present only on alpha + video frames.
    pub fn alpha_sub_block(&self) -> Result<Option<AlphaSubBlock>> {
        if self.content_type() != ContentType::AlphaVideo {
            return Ok(None);
        }
        Ok(Some(AlphaSubBlock {
            data_length: read_i32_le(self.data, ALPHA_BLOCK_OFFSET + 8)?,
            compression: read_i32_be(self.data, ALPHA_BLOCK_OFFSET + 12)?,
            body_length: read_i32_be(self.data, ALPHA_BLOCK_OFFSET + 16)?,
        }))
    }

    /// True for alpha + video frames whose alpha body is not empty.
    pub fn exist_alpha_frame(&self) -> bool {
        matches!(self.alpha_sub_block(), Ok(Some(block)) if block.body_length > 0)
    }

    /// Bytes of this frame that make up the alpha unit copied to the alpha buffer.
    pub fn alpha_unit_len(&self) -> Option<usize> {
        match self.alpha_sub_block() {
            Ok(Some(block)) if block.body_length > 0 => {
                Some((block.body_length as usize + ALPHA_BODY_OFFSET).min(self.data.len()))
            }
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Result<FrameTimestamp> {
        if self.is_additional_frame() && !self.exist_alpha_frame() {
            return Ok(FrameTimestamp::Hold);
        }
        self.wire_timestamp().map(FrameTimestamp::Pts)
    }

    /// Timestamp field as sent, including on additional frames.
    pub fn wire_timestamp(&self) -> Result<i64> {
        read_i64_le(self.data, TIMESTAMP_OFFSET)
    }

    /// Contents length field of plain frames.
    pub fn contents_length(&self) -> Result<i32> {
        read_i32_le(self.data, PLAIN_PAYLOAD_OFFSET)
    }

    /// Offset of the inner payload's length prefix.
    pub fn payload_offset(&self) -> Result<usize> {
        match self.alpha_sub_block()? {
            Some(block) => {
                if block.body_length < 0 {
                    return Err(VcsError::parse_error(
                        "alpha sub-block",
                        format!("negative body length {}", block.body_length),
                    ));
                }
                Ok(ALPHA_BLOCK_OFFSET + ALPHA_BLOCK_LEN + block.body_length as usize)
            }
            None => Ok(PLAIN_PAYLOAD_OFFSET),
        }
    }

    /// The inner elementary-stream payload handed to the codec.
    pub fn payload(&self) -> Result<&'a [u8]> {
        let offset = self.payload_offset()?;
        let len = read_i32_le(self.data, offset)?;
        if len < 0 {
            return Err(VcsError::parse_error("ES payload", format!("negative length {}", len)));
        }
        let start = offset + 4;
        self.data.get(start..start + len as usize).ok_or_else(|| {
            VcsError::parse_error(
                "ES payload",
                format!("length {} at offset {} exceeds frame of {} bytes", len, start, self.data.len()),
            )
        })
    }

    /// AAC sample rate from the ADTS frequency index. Audio frames only.
    pub fn sample_rate(&self) -> u32 {
        read_u8(self.data, 24).map(|byte| sample_rate_for_index((byte >> 2) & 0x0F)).unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// Picture type of the first slice in the payload.
    pub fn frame_type(&self) -> Option<FrameType> {
        self.payload().ok().and_then(classify_frame)
    }
}

impl fmt::Debug for EsFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EsFrame")
            .field("content_type", &self.content_type())
            .field("optional_info", &self.optional_info())
            .field("len", &self.data.len())
            .finish()
    }
}

pub fn sample_rate_for_index(index: u8) -> u32 {
    AAC_SAMPLE_RATES.get(index as usize).copied().unwrap_or(DEFAULT_SAMPLE_RATE)
}

/// Scans for `00 00 01` start codes and classifies the first slice NAL unit.
pub fn classify_frame(nal: &[u8]) -> Option<FrameType> {
    nal.windows(4).find_map(|w| {
        if w[0] != 0 || w[1] != 0 || w[2] != 1 {
            return None;
        }
        match w[3] & 0x1F {
            NALU_TYPE_SLICE => Some(FrameType::P),
            NALU_TYPE_IDR => Some(FrameType::I),
            _ => None,
        }
    })
}
