//! Decode pipeline for one media kind.
//!
//! A [`MediaDecoder`] drives a platform [`MediaCodec`] with the threads below:
//!
//! - feed: dequeues frames from the media buffer and queues their ES payload
//! - render: drains decoded output, paces video presentation and samples render timing
//! - alpha (video with a compositor only): decompresses alpha units for the renderer
//! - quality: a runtime task reporting jitter and drop counts every cycle
//!
//! Stopping blocks for at most the configured stop timeout waiting for the render
//! thread to exit, which is also when the codec is stopped.

pub mod codec;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::alpha::{AlphaDecompressor, AlphaRenderer};
use crate::error::ErrorCode;
use crate::media::{EsFrame, FrameTimestamp, MediaBuffer, NativeBufferPool};
use crate::quality::QualityMonitor;
use crate::types::{Listener, MediaKind};
use crate::{Result, VcsError};

pub use codec::{CodecFormat, DecodedFrame, MediaBackend, MediaCodec, aac_codec_specific_data};

/// Idle wait while the codec is not running.
const CODEC_IDLE: Duration = Duration::from_millis(30);
/// Wait for a free codec input slot before retrying.
const INPUT_RETRY: Duration = Duration::from_millis(1);
const OUTPUT_TIMEOUT: Duration = Duration::from_millis(100);
/// Presentation pacing leaves this much of each frame interval for the release itself.
const PACING_SLACK_MS: u64 = 3;

/// Something a decoder observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEvent {
    /// The first decoded video frame was presented.
    FirstFrameRendered,
    /// Delayed plus dropped frames over the last reporting cycle.
    QualityAlert { media: MediaKind, count: u64 },
    Error { media: MediaKind, code: ErrorCode },
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub format: CodecFormat,
    /// Frame rate used for video presentation pacing.
    pub fps: u32,
    pub stop_timeout: Duration,
    pub quality_interval: Duration,
}

impl DecoderConfig {
    /// Minimum spacing between two video presentations.
    pub fn frame_interval(&self) -> Duration {
        let fps = u64::from(self.fps.max(1));
        Duration::from_millis((1000 / fps).saturating_sub(PACING_SLACK_MS))
    }
}

/// Alpha plane path of the video decoder.
pub struct AlphaStage {
    pub buffer: Arc<MediaBuffer>,
    pub pool: NativeBufferPool,
    pub renderer: Arc<dyn AlphaRenderer>,
}

struct Shared {
    media: MediaKind,
    codec: Arc<dyn MediaCodec>,
    buffer: Arc<MediaBuffer>,
    renderer: Option<Arc<dyn AlphaRenderer>>,
    running: AtomicBool,
    render_running: AtomicBool,
    codec_running: AtomicBool,
    frame_rendering: AtomicBool,
    quality: Mutex<QualityMonitor>,
    listener: Listener<DecoderEvent>,
}

impl Shared {
    /// Reports a codec failure once and parks both threads.
    fn codec_failed(&self, code: ErrorCode, reason: &str) {
        if self.codec_running.swap(false, Ordering::AcqRel) {
            error!(media = %self.media, %code, %reason, "Codec failed");
            (self.listener)(DecoderEvent::Error { media: self.media, code });
        }
    }
}

/// Running decode pipeline for one media kind.
pub struct MediaDecoder {
    shared: Arc<Shared>,
    alpha_buffer: Option<Arc<MediaBuffer>>,
    stop_timeout: Duration,
    quality_cancel: CancellationToken,
    render_done: Mutex<Option<mpsc::Receiver<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaDecoder {
    /// Starts the pipeline. The codec is started on the feed thread.
    pub fn start(
        media: MediaKind,
        codec: Arc<dyn MediaCodec>,
        config: DecoderConfig,
        buffer: Arc<MediaBuffer>,
        alpha: Option<AlphaStage>,
        runtime: &Handle,
        listener: Listener<DecoderEvent>,
    ) -> Result<Self> {
        let alpha = if media == MediaKind::Video { alpha } else { None };
        let shared = Arc::new(Shared {
            media,
            codec,
            buffer,
            renderer: alpha.as_ref().map(|stage| Arc::clone(&stage.renderer)),
            running: AtomicBool::new(true),
            render_running: AtomicBool::new(true),
            codec_running: AtomicBool::new(false),
            frame_rendering: AtomicBool::new(true),
            quality: Mutex::new(QualityMonitor::new()),
            listener,
        });

        let (done_tx, done_rx) = mpsc::channel();
        let mut threads = Vec::with_capacity(3);

        let feed = {
            let shared = Arc::clone(&shared);
            let format = config.format.clone();
            spawn(format!("vcs-{}-decoder", media), move || feed_loop(shared, format))?
        };
        threads.push(feed);

        let render = {
            let shared = Arc::clone(&shared);
            let interval = config.frame_interval();
            spawn(format!("vcs-{}-render", media), move || {
                render_loop(&shared, interval);
                let _ = done_tx.send(());
            })?
        };
        threads.push(render);

        let alpha_buffer = alpha.as_ref().map(|stage| Arc::clone(&stage.buffer));
        if let Some(stage) = alpha {
            let shared = Arc::clone(&shared);
            threads.push(spawn("vcs-alpha-render".to_string(), move || alpha_loop(&shared, stage))?);
        }

        let quality_cancel = CancellationToken::new();
        runtime.spawn(quality_task(Arc::clone(&shared), config.quality_interval, quality_cancel.clone()));

        info!(%media, mime = config.format.mime(), "Decoder started");
        Ok(Self {
            shared,
            alpha_buffer,
            stop_timeout: config.stop_timeout,
            quality_cancel,
            render_done: Mutex::new(Some(done_rx)),
            threads: Mutex::new(threads),
        })
    }

    pub fn media(&self) -> MediaKind {
        self.shared.media
    }

    /// Presents decoded video frames when set; otherwise decodes and discards them.
    pub fn set_frame_rendering(&self, render: bool) {
        self.shared.frame_rendering.store(render, Ordering::Release);
        debug!(media = %self.shared.media, render, "Frame rendering");
    }

    /// Clears the quality counters. The threads keep running.
    pub fn pause(&self) {
        self.shared.quality.lock().reset();
        debug!(media = %self.shared.media, "Decoder paused");
    }

    /// Stops every thread, waiting up to the stop timeout for the render thread.
    pub fn stop(&self) {
        let Some(done) = self.render_done.lock().take() else {
            return;
        };
        let media = self.shared.media;
        debug!(%media, "Stopping decoder");

        self.shared.running.store(false, Ordering::Release);
        self.quality_cancel.cancel();
        self.shared.buffer.wake_all();
        if let Some(alpha) = &self.alpha_buffer {
            alpha.wake_all();
        }

        if done.recv_timeout(self.stop_timeout).is_err() {
            warn!(%media, timeout_ms = self.stop_timeout.as_millis() as u64, "Render thread did not exit in time");
        }
        // The render loop normally ends with the feed loop; force it for a stuck feed.
        self.shared.render_running.store(false, Ordering::Release);
        if let Some(alpha) = &self.alpha_buffer {
            alpha.wake_all();
        }

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current || !handle.is_finished() {
                debug!(%media, thread = ?handle.thread().name(), "Detaching decoder thread");
                continue;
            }
            if handle.join().is_err() {
                error!(%media, "Decoder thread panicked");
            }
        }
        info!(%media, "Decoder stopped");
    }
}

impl Drop for MediaDecoder {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.render_running.store(false, Ordering::Release);
        self.quality_cancel.cancel();
        self.shared.buffer.wake_all();
        if let Some(alpha) = &self.alpha_buffer {
            alpha.wake_all();
        }
    }
}

impl fmt::Debug for MediaDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaDecoder")
            .field("media", &self.shared.media)
            .field("running", &self.shared.running.load(Ordering::Acquire))
            .field("codec_running", &self.shared.codec_running.load(Ordering::Acquire))
            .finish()
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| VcsError::connection_failed_with_source("cannot spawn decoder thread", Box::new(e)))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn feed_loop(shared: Arc<Shared>, format: CodecFormat) {
    let media = shared.media;
    if let Err(e) = shared.codec.start(&format) {
        error!(%media, error = %e, "Codec start failed");
        (shared.listener)(DecoderEvent::Error { media, code: ErrorCode::DECODER_CREATE_ERROR });
        shared.render_running.store(false, Ordering::Release);
        return;
    }
    shared.codec_running.store(true, Ordering::Release);
    debug!(%media, "Feed loop started");

    let mut frame = shared.buffer.spare();
    while shared.running.load(Ordering::Acquire) {
        if !shared.codec_running.load(Ordering::Acquire) {
            thread::sleep(CODEC_IDLE);
            continue;
        }
        let Some(len) = shared.buffer.dequeue_blocking(&mut frame, || !shared.running.load(Ordering::Acquire))
        else {
            break;
        };

        let (payload, timestamp) = match EsFrame::new(&frame[..len]).and_then(|es| Ok((es.payload()?, es.timestamp()?))) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%media, len, error = %e, "Unreadable frame skipped");
                continue;
            }
        };
        if payload.is_empty() {
            continue;
        }

        if !queue(&shared, payload, timestamp.to_pts()) {
            continue;
        }
        shared.quality.lock().record_decoder_input();
        trace!(%media, len = payload.len(), ?timestamp, "Queued to codec");

        // Additional frames must not leave a stale alpha plane on screen.
        if timestamp.is_hold() {
            if let Some(renderer) = &shared.renderer {
                renderer.set_alpha_timestamp(i64::MAX);
            }
        }
    }

    debug!(%media, "Feed loop ended");
    shared.render_running.store(false, Ordering::Release);
}

/// Queues one payload, waiting for an input slot. Returns whether it was queued.
fn queue(shared: &Shared, payload: &[u8], pts: i64) -> bool {
    loop {
        match shared.codec.queue_input(payload, pts) {
            Ok(true) => return true,
            Ok(false) => {
                if !shared.running.load(Ordering::Acquire) || !shared.codec_running.load(Ordering::Acquire) {
                    return false;
                }
                thread::sleep(INPUT_RETRY);
            }
            Err(e) => {
                shared.codec_failed(ErrorCode::DECODER_MEDIACODEC_ERROR, &e.to_string());
                return false;
            }
        }
    }
}

fn render_loop(shared: &Shared, frame_interval: Duration) {
    let media = shared.media;
    let mut first_frame = media == MediaKind::Video;
    let mut last_release: Option<Instant> = None;
    debug!(%media, "Render loop started");

    while shared.render_running.load(Ordering::Acquire) {
        if !shared.codec_running.load(Ordering::Acquire) {
            thread::sleep(CODEC_IDLE);
            continue;
        }

        let frame = match shared.codec.dequeue_output(OUTPUT_TIMEOUT) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                shared.codec_failed(ErrorCode::DECODER_MEDIACODEC_ERROR, &e.to_string());
                continue;
            }
        };
        let pts = frame.pts;

        if first_frame {
            first_frame = false;
            info!(%media, "First video frame rendered");
            (shared.listener)(DecoderEvent::FirstFrameRendered);
        }

        let render = match media {
            MediaKind::Video => {
                if let Some(last) = last_release {
                    let working = last.elapsed();
                    if working < frame_interval {
                        thread::sleep(frame_interval - working);
                    }
                }
                shared.frame_rendering.load(Ordering::Acquire)
            }
            MediaKind::Audio => true,
        };

        if let Err(e) = shared.codec.release_output(frame, render) {
            shared.codec_failed(ErrorCode::DECODER_MEDIACODEC_ERROR, &e.to_string());
            continue;
        }
        last_release = Some(Instant::now());

        shared.quality.lock().record_render(FrameTimestamp::from_pts(pts), now_millis());
        if let Some(renderer) = &shared.renderer {
            renderer.set_alpha_timestamp(pts);
        }
    }

    shared.codec_running.store(false, Ordering::Release);
    shared.codec.stop();
    debug!(%media, "Render loop ended, codec stopped");
}

fn alpha_loop(shared: &Shared, stage: AlphaStage) {
    let mut decompressor = AlphaDecompressor::new(stage.pool);
    let mut unit = stage.buffer.spare();
    debug!("Alpha render loop started");

    while shared.render_running.load(Ordering::Acquire) {
        let Some(len) = stage.buffer.dequeue_blocking(&mut unit, || !shared.render_running.load(Ordering::Acquire))
        else {
            break;
        };
        match decompressor.decompress(&unit[..len]) {
            Ok(Some(frame)) => stage.renderer.update_alpha_channel(frame),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Alpha unit dropped"),
        }
    }
    debug!("Alpha render loop ended");
}

async fn quality_task(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let media = shared.media;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = shared.quality.lock().take_report();
                if report.total() > 0 {
                    debug!(%media, delayed = report.delayed, dropped = report.dropped, "Quality alert");
                    (shared.listener)(DecoderEvent::QualityAlert { media, count: report.total() });
                }
            }
        }
    }
    trace!(%media, "Quality task ended");
}
