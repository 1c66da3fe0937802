//! Media streaming channel.
//!
//! One channel per media kind. After connecting it sends a stream-info request and
//! waits for the acknowledgement, then reads length-prefixed frames forever:
//!
//! ```text
//! [marker: u8][sequence: u16 LE][total length: i32 LE][payload: total - 7 bytes]
//! ```
//!
//! Payloads go straight into the bound [`MediaBuffer`]. On the video channel, frames
//! carrying an alpha sub-block are also copied into the alpha buffer.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::ErrorCode;
use crate::logging::hex_dump;
use crate::media::{EsFrame, MediaBuffer};
use crate::transport::{ReadError, TcpTransport, TransportOptions, WriteErrorHandler};
use crate::types::{Listener, MediaKind};
use crate::wire::{self, code};
use crate::{Result, VcsError};


/// Fixed header in front of every streaming payload.
pub const FRAME_HEADER_LEN: i32 = 7;
/// Audio payloads of exactly this size are silent AAC frames and are skipped.
pub const SILENT_AUDIO_FRAME_LEN: usize = 4118;
pub const MAX_VIDEO_PAYLOAD: usize = 700 * 1024;
pub const MAX_AUDIO_PAYLOAD: usize = 8 * 1024;

/// Stall between buffer-space checks while the destination buffer is full.
const FULL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingEvent {
    /// The destination buffer is full and the channel is stalled.
    BufferFull,
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportOptions,
    /// Largest accepted payload. Clamped to the buffer slot size.
    pub max_payload: usize,
    pub wire_dump: bool,
}

impl StreamingConfig {
    pub fn default_max_payload(media: MediaKind) -> usize {
        match media {
            MediaKind::Video => MAX_VIDEO_PAYLOAD,
            MediaKind::Audio => MAX_AUDIO_PAYLOAD,
        }
    }
}

struct Reader {
    media: MediaKind,
    transport: Arc<TcpTransport>,
    buffer: Arc<MediaBuffer>,
    alpha: Option<Arc<MediaBuffer>>,
    max_payload: usize,
    cancel: CancellationToken,
    listener: Listener<StreamingEvent>,
    wire_dump: bool,
}

/// Streaming connection for one media kind.
pub struct StreamingChannel {
    media: MediaKind,
    transport: Arc<TcpTransport>,
    cancel: CancellationToken,
    buffer: Arc<MediaBuffer>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingChannel {
    /// Connects, starts the reader thread and requests the stream.
    ///
    /// `alpha` is only consulted on the video channel.
    pub fn open(
        config: &StreamingConfig,
        media: MediaKind,
        device_id: &str,
        buffer: Arc<MediaBuffer>,
        alpha: Option<Arc<MediaBuffer>>,
        listener: Listener<StreamingEvent>,
    ) -> Result<Self> {
        info!(%media, host = %config.host, port = config.port, "Opening streaming channel");

        let on_write_error: WriteErrorHandler = {
            let listener = Arc::clone(&listener);
            Arc::new(move |e| {
                listener(StreamingEvent::Error { code: ErrorCode::SOCKET_SEND_ERROR, message: e.to_string() });
            })
        };
        let transport = TcpTransport::connect(&config.host, config.port, config.transport, on_write_error)?;
        let cancel = CancellationToken::new();

        let reader = Reader {
            media,
            transport: Arc::clone(&transport),
            buffer: Arc::clone(&buffer),
            alpha: if media == MediaKind::Video { alpha } else { None },
            max_payload: config.max_payload.min(buffer.slot_size()),
            cancel: cancel.clone(),
            listener,
            wire_dump: config.wire_dump,
        };
        let handle = thread::Builder::new()
            .name(format!("vcs-{}-reader", media))
            .spawn(move || reader.run())
            .map_err(|e| VcsError::connection_failed_with_source("cannot spawn streaming reader", Box::new(e)))?;

        transport.write_async(wire::stream_info_request(media.stream_selector(), device_id));
        debug!(%media, "Stream-info request sent");

        Ok(Self { media, transport, cancel, buffer, reader: Mutex::new(Some(handle)) })
    }

    pub fn media(&self) -> MediaKind {
        self.media
    }

    /// Stops the reader and closes the connection. Idempotent.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.transport.close();
        self.buffer.wake_all();

        if let Some(reader) = self.reader.lock().take() {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                error!(media = %self.media, "Streaming reader panicked");
            }
        }
        info!(media = %self.media, "Streaming channel closed");
    }
}

impl Drop for StreamingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.transport.close();
    }
}

impl fmt::Debug for StreamingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingChannel")
            .field("media", &self.media)
            .field("peer", &self.transport.peer())
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Reader {
    fn run(self) {
        debug!(media = %self.media, "Streaming reader started");
        let result = self.await_stream_info().and_then(|()| self.stream());
        match result {
            Ok(()) | Err(ReadError::Closed) => {}
            Err(ReadError::Io(e)) => {
                if !self.cancel.is_cancelled() && !self.transport.is_closed() {
                    error!(media = %self.media, error = %e, "Streaming socket read failed");
                    self.notify(StreamingEvent::Error { code: ErrorCode::SOCKET_READ_ERROR, message: e.to_string() });
                }
            }
        }
        debug!(media = %self.media, "Streaming reader ended");
    }

    fn notify(&self, event: StreamingEvent) {
        (self.listener)(event);
    }

    /// Command phase: waits for the stream-info acknowledgement.
    fn await_stream_info(&self) -> std::result::Result<(), ReadError> {
        while !self.cancel.is_cancelled() {
            let command = self.transport.read_i32_be()?;
            if command == code::STREAM_INFO_ACK {
                let len = self.transport.read_i32_be()?;
                let info = if len > 0 { self.transport.read_string(len as usize)? } else { String::new() };
                info!(media = %self.media, %info, "<< stream info");
                return Ok(());
            }
            warn!(media = %self.media, command, "<< unexpected command before stream info");
            self.notify(StreamingEvent::Error { code: ErrorCode::from_vcs(command), message: String::new() });
        }
        Err(ReadError::Closed)
    }

    /// Stream phase: reads frames until closed or a protocol violation.
    fn stream(&self) -> std::result::Result<(), ReadError> {
        info!(media = %self.media, "Stream started");
        let mut frame = self.buffer.spare();
        let mut full_reported = false;
        let mut fps = FpsCounter::new();

        while !self.cancel.is_cancelled() {
            if self.buffer.is_full() {
                if !full_reported {
                    warn!(media = %self.media, "Media buffer full");
                    full_reported = true;
                    self.notify(StreamingEvent::BufferFull);
                }
                self.buffer.wait_for_space(FULL_BACKOFF);
                continue;
            }
            full_reported = false;

            let marker = self.transport.read_u8()?;
            let sequence = self.transport.read_u16_le()?;
            let total = self.transport.read_i32_le()?;
            let len = match total.checked_sub(FRAME_HEADER_LEN) {
                Some(len) if len >= 0 && len as usize <= self.max_payload => len as usize,
                _ => {
                    let details = format!(
                        "frame length {} outside {}..={}",
                        total,
                        FRAME_HEADER_LEN,
                        self.max_payload + FRAME_HEADER_LEN as usize
                    );
                    error!(media = %self.media, marker, sequence, %details, "Invalid streaming frame");
                    let err = VcsError::protocol_error(self.media, details);
                    self.notify(StreamingEvent::Error { code: err.code(), message: err.to_string() });
                    return Ok(());
                }
            };

            if frame.len() < len {
                frame.resize(self.buffer.slot_size(), 0);
            }
            self.transport.read_exact_into(&mut frame[..len])?;
            trace!(media = %self.media, marker, sequence, len, "<< frame");
            if self.wire_dump {
                trace!(media = %self.media, bytes = %hex_dump(&frame[..len], 32), "Frame head");
            }

            match self.media {
                MediaKind::Video => self.push_video(&mut frame, len),
                MediaKind::Audio => self.push_audio(&mut frame, len),
            }

            if let Some(rate) = fps.tick() {
                debug!(media = %self.media, fps = rate, "Receive rate");
            }
        }
        Ok(())
    }

    fn push_video(&self, frame: &mut Vec<u8>, len: usize) {
        // Copy the alpha unit first: the swap below hands `frame` a recycled slot.
        if let Some(alpha) = &self.alpha {
            let unit_len = EsFrame::new(&frame[..len]).ok().and_then(|es| es.alpha_unit_len());
            if let Some(unit_len) = unit_len {
                if !alpha.enqueue_copy(&frame[..unit_len]) {
                    warn!("Alpha buffer full, alpha unit dropped");
                }
            }
        }
        if !self.buffer.enqueue_swap(frame, len) {
            warn!(media = %self.media, len, "Frame dropped");
        }
    }

    fn push_audio(&self, frame: &mut Vec<u8>, len: usize) {
        if len == SILENT_AUDIO_FRAME_LEN {
            trace!("Silent audio frame skipped");
            return;
        }
        if !self.buffer.enqueue_swap(frame, len) {
            warn!(media = %self.media, len, "Frame dropped");
        }
    }
}

/// Frames-per-second over one-second windows.
struct FpsCounter {
    window_start: Instant,
    frames: u32,
}

impl FpsCounter {
    fn new() -> Self {
        Self { window_start: Instant::now(), frames: 0 }
    }

    /// Counts a frame; returns the rate whenever a window closes.
    fn tick(&mut self) -> Option<u32> {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let rate = (self.frames as f64 / elapsed.as_secs_f64()).round() as u32;
        self.frames = 0;
        self.window_start = Instant::now();
        Some(rate)
    }
}
