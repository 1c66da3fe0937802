//! Platform codec seams.
//!
//! The engine never decodes media itself. A [`MediaBackend`] supplied by the host
//! creates one [`MediaCodec`] per media kind and, when the host composites alpha,
//! an [`AlphaRenderer`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::alpha::AlphaRenderer;
use crate::config::VideoCodec;
use crate::types::MediaKind;

pub const AAC_MIME_TYPE: &str = "audio/mp4a-latm";
/// AAC low-complexity audio object type.
pub const AAC_PROFILE_LC: u8 = 2;
pub const AUDIO_SAMPLE_RATE: u32 = 48000;
pub const AUDIO_CHANNEL_COUNT: u8 = 2;

/// Sampling frequencies addressable from an AudioSpecificConfig index.
const AAC_CONFIG_RATES: [u32; 12] = [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000];

/// Codec configuration handed to [`MediaCodec::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecFormat {
    Video {
        mime: &'static str,
        width: u32,
        height: u32,
        frame_rate: u32,
    },
    Audio {
        mime: &'static str,
        sample_rate: u32,
        channel_count: u8,
        /// AudioSpecificConfig (`csd-0`).
        codec_specific_data: [u8; 2],
        /// Input frames carry ADTS headers.
        adts: bool,
    },
}

impl CodecFormat {
    pub fn video(codec: VideoCodec, width: u32, height: u32, frame_rate: u32) -> Self {
        CodecFormat::Video { mime: codec.mime_type(), width, height, frame_rate }
    }

    /// AAC-LC stereo at 48 kHz, the format every server streams.
    pub fn aac() -> Self {
        CodecFormat::Audio {
            mime: AAC_MIME_TYPE,
            sample_rate: AUDIO_SAMPLE_RATE,
            channel_count: AUDIO_CHANNEL_COUNT,
            codec_specific_data: aac_codec_specific_data(AAC_PROFILE_LC, AUDIO_SAMPLE_RATE, AUDIO_CHANNEL_COUNT),
            adts: true,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            CodecFormat::Video { mime, .. } | CodecFormat::Audio { mime, .. } => mime,
        }
    }
}

/// Builds the two-byte AudioSpecificConfig.
///
/// ```text
/// 5 bits object type | 4 bits frequency index | 4 bits channel config | 3 bits zero
/// ```
///
/// Rates outside the table use the escape index 15.
pub fn aac_codec_specific_data(profile: u8, sample_rate: u32, channels: u8) -> [u8; 2] {
    let index = AAC_CONFIG_RATES.iter().position(|rate| *rate == sample_rate).unwrap_or(15) as u8;
    [(profile << 3) | (index >> 1), ((index << 7) & 0x80) | ((channels & 0x0F) << 3)]
}

/// One decoded output buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Backend-specific output slot.
    pub index: usize,
    /// Presentation timestamp, as queued.
    pub pts: i64,
    /// Decoded bytes, empty when the backend renders from its own memory.
    pub data: Vec<u8>,
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("index", &self.index)
            .field("pts", &self.pts)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A platform decoder instance.
///
/// Input and output sides are driven from different threads.
pub trait MediaCodec: Send + Sync {
    fn start(&self, format: &CodecFormat) -> Result<()>;

    /// Queues one access unit. `Ok(false)` means no input slot is free yet.
    fn queue_input(&self, data: &[u8], pts: i64) -> Result<bool>;

    /// Waits up to `timeout` for decoded output.
    fn dequeue_output(&self, timeout: Duration) -> Result<Option<DecodedFrame>>;

    /// Returns an output buffer, presenting it when `render` is set.
    fn release_output(&self, frame: DecodedFrame, render: bool) -> Result<()>;

    fn stop(&self);
}

/// Host-provided factory for codecs and the alpha compositor.
pub trait MediaBackend: Send + Sync {
    fn create_codec(&self, media: MediaKind) -> Result<Arc<dyn MediaCodec>>;

    /// Compositor for alpha planes, if the host shows them.
    fn alpha_renderer(&self) -> Option<Arc<dyn AlphaRenderer>> {
        None
    }
}
