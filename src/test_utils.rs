//! Test utilities: frame builders, an in-process fake VCS server, a loopback
//! codec backend and player event helpers.
//!
//! Builders produce byte-exact ES frames, alpha units and streaming frames so tests
//! and benches can drive the parsers without a real server. [`LoopbackBackend`]
//! stands in for the platform decoders.

#![cfg(any(test, feature = "test-utils"))]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::write::ZlibEncoder;
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::alpha::{AlphaFrame, AlphaRenderer};
use crate::decoder::{CodecFormat, DecodedFrame, MediaBackend, MediaCodec};
use crate::media::es::{CONTENT_TYPE_ALPHA_VIDEO, CONTENT_TYPE_AUDIO, CONTENT_TYPE_VIDEO};
use crate::types::{MediaKind, PlayerEvent};
use crate::wire::{CommandWriter, code};
use crate::{Result, VcsError};

/// Start marker used by the fake server for streaming frames.
pub const START_MARKER: u8 = 0xF2;

fn header(content_type: u8, optional_info: u8) -> CommandWriter {
    CommandWriter::new().bytes(&[content_type, 1, 0, 0, optional_info, 0, 0, 0, 0, 0])
}

/// Plain video frame: header, timestamp, reversed length, ES bytes.
pub fn video_frame(timestamp: i64, additional: bool, es: &[u8]) -> Vec<u8> {
    header(CONTENT_TYPE_VIDEO, u8::from(additional))
        .long_le(timestamp)
        .int_le(es.len() as i32)
        .bytes(es)
        .finish()
}

/// Plain audio frame.
pub fn audio_frame(timestamp: i64, es: &[u8]) -> Vec<u8> {
    header(CONTENT_TYPE_AUDIO, 0).long_le(timestamp).int_le(es.len() as i32).bytes(es).finish()
}

/// Alpha + video frame with a raw alpha `body` followed by the ES payload.
pub fn alpha_video_frame(timestamp: i64, compression: i32, body: &[u8], es: &[u8]) -> Vec<u8> {
    header(CONTENT_TYPE_ALPHA_VIDEO, 0)
        .long_le(timestamp)
        .int_le(body.len() as i32 + 8)
        .int(compression)
        .int(body.len() as i32)
        .bytes(body)
        .bytes(&[0u8; 8])
        .int_le(es.len() as i32)
        .bytes(es)
        .finish()
}

/// Alpha body: placement rectangle, compressed length and compressed bytes.
pub fn alpha_body(placement: (i32, i32, i32, i32), compressed: &[u8]) -> Vec<u8> {
    let (x, y, w, h) = placement;
    CommandWriter::new().int(x).int(y).int(w).int(h).int(compressed.len() as i32).bytes(compressed).finish()
}

/// Alpha unit as copied into the alpha buffer by the video channel.
pub fn alpha_unit(timestamp: i64, compression: i32, placement: (i32, i32, i32, i32), compressed: &[u8]) -> Vec<u8> {
    let body = alpha_body(placement, compressed);
    let mut frame = alpha_video_frame(timestamp, compression, &body, &[0, 0, 0, 1, 0x65]);
    frame.truncate(30 + body.len());
    frame
}

pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).expect("in-memory write");
    encoder.finish().expect("in-memory finish")
}

/// Streaming frame: start marker, reversed sequence, reversed total length, payload.
pub fn streaming_frame(sequence: u16, payload: &[u8]) -> Vec<u8> {
    CommandWriter::new()
        .byte(START_MARKER)
        .short_le(sequence)
        .int_le(payload.len() as i32 + 7)
        .bytes(payload)
        .finish()
}

pub fn stream_info_ack(info: &[u8]) -> Vec<u8> {
    CommandWriter::command(code::STREAM_INFO_ACK).int(info.len() as i32).bytes(info).finish()
}

pub fn connect_success(result: i32, max_packets: u8) -> Vec<u8> {
    CommandWriter::command(code::CONNECT_SUCCESS).int(result).byte(max_packets).finish()
}

/// Loopback listener standing in for a VCS server.
pub struct FakeVcsServer {
    listener: TcpListener,
}

impl FakeVcsServer {
    pub fn bind() -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind("127.0.0.1:0")? })
    }

    pub fn host(&self) -> &'static str {
        "127.0.0.1"
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|addr| addr.port()).unwrap_or_default()
    }

    pub fn accept(&self) -> io::Result<FakePeer> {
        let (stream, _) = self.listener.accept()?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(FakePeer { stream })
    }
}

/// Server side of one accepted connection.
pub struct FakePeer {
    stream: TcpStream,
}

impl FakePeer {
    pub fn read_i32(&mut self) -> io::Result<i32> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn read_string(&mut self) -> io::Result<String> {
        let len = self.read_i32()?;
        let mut buf = vec![0u8; len.max(0) as usize];
        self.stream.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Reads a start-app command, returning the device id and status body.
    pub fn read_start_app(&mut self) -> io::Result<(String, String)> {
        let command = self.read_i32()?;
        if command != code::START_APP {
            return Err(io::Error::other(format!("expected 2000, got {}", command)));
        }
        for _ in 0..3 {
            self.read_i32()?;
        }
        let device = self.read_string()?;
        let status = self.read_string()?;
        Ok((device, status))
    }

    /// Reads a stream-info request, returning the media selector and device id.
    pub fn read_stream_info_request(&mut self) -> io::Result<(i32, String)> {
        let command = self.read_i32()?;
        if command != code::STREAM_INFO_REQUEST {
            return Err(io::Error::other(format!("expected 2020, got {}", command)));
        }
        let selector = self.read_i32()?;
        let device = self.read_string()?;
        Ok((selector, device))
    }

    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

#[derive(Default)]
struct LoopbackState {
    format: Option<CodecFormat>,
    pending: VecDeque<i64>,
    queued: Vec<(i64, Vec<u8>)>,
    released: Vec<(i64, bool)>,
    next_index: usize,
    stopped: bool,
}

/// Codec that "decodes" every input into one output with the same timestamp.
#[derive(Default)]
pub struct LoopbackCodec {
    state: Mutex<LoopbackState>,
    output_ready: Condvar,
    fail_start: bool,
    fail_input: bool,
    input_stalled: AtomicBool,
    input_attempts: AtomicUsize,
}

impl LoopbackCodec {
    pub fn failing_start() -> Self {
        Self { fail_start: true, ..Self::default() }
    }

    pub fn failing_input() -> Self {
        Self { fail_input: true, ..Self::default() }
    }

    /// While stalled, every input is refused with "no slot yet".
    pub fn stall_input(&self, stalled: bool) {
        self.input_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Calls to `queue_input`, refused or not.
    pub fn input_attempts(&self) -> usize {
        self.input_attempts.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> Option<CodecFormat> {
        self.state.lock().format.clone()
    }

    /// Timestamps and bytes of every queued input.
    pub fn queued(&self) -> Vec<(i64, Vec<u8>)> {
        self.state.lock().queued.clone()
    }

    /// Timestamps and render flags of every released output.
    pub fn released(&self) -> Vec<(i64, bool)> {
        self.state.lock().released.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl MediaCodec for LoopbackCodec {
    fn start(&self, format: &CodecFormat) -> Result<()> {
        if self.fail_start {
            return Err(VcsError::decoder_error(
                MediaKind::Video,
                crate::error::DecoderFailure::Create,
                "loopback start refused",
            ));
        }
        self.state.lock().format = Some(format.clone());
        Ok(())
    }

    fn queue_input(&self, data: &[u8], pts: i64) -> Result<bool> {
        self.input_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_input {
            return Err(VcsError::decoder_error(
                MediaKind::Video,
                crate::error::DecoderFailure::Runtime,
                "loopback input refused",
            ));
        }
        if self.input_stalled.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut state = self.state.lock();
        state.queued.push((pts, data.to_vec()));
        state.pending.push_back(pts);
        drop(state);
        self.output_ready.notify_one();
        Ok(true)
    }

    fn dequeue_output(&self, timeout: Duration) -> Result<Option<DecodedFrame>> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            self.output_ready.wait_for(&mut state, timeout);
        }
        let Some(pts) = state.pending.pop_front() else {
            return Ok(None);
        };
        let index = state.next_index;
        state.next_index += 1;
        Ok(Some(DecodedFrame { index, pts, data: Vec::new() }))
    }

    fn release_output(&self, frame: DecodedFrame, render: bool) -> Result<()> {
        self.state.lock().released.push((frame.pts, render));
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
    }
}

/// Alpha renderer that records what it is given.
#[derive(Default)]
pub struct RecordingRenderer {
    planes: Mutex<Vec<(i32, i32, i64, Vec<u8>)>>,
    timestamps: Mutex<Vec<i64>>,
}

impl RecordingRenderer {
    /// `(x, y, timestamp, plane)` of every alpha frame received.
    pub fn planes(&self) -> Vec<(i32, i32, i64, Vec<u8>)> {
        self.planes.lock().clone()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.timestamps.lock().clone()
    }
}

impl AlphaRenderer for RecordingRenderer {
    fn update_alpha_channel(&self, frame: AlphaFrame) {
        let entry = (frame.placement.x, frame.placement.y, frame.timestamp, frame.plane().to_vec());
        self.planes.lock().push(entry);
    }

    fn set_alpha_timestamp(&self, timestamp: i64) {
        self.timestamps.lock().push(timestamp);
    }
}

/// Backend handing out loopback codecs and, optionally, a recording renderer.
#[derive(Default)]
pub struct LoopbackBackend {
    codecs: Mutex<HashMap<MediaKind, Arc<LoopbackCodec>>>,
    renderer: Option<Arc<RecordingRenderer>>,
    refuse_create: bool,
    stall_input: bool,
}

impl LoopbackBackend {
    pub fn with_renderer() -> Self {
        Self { renderer: Some(Arc::new(RecordingRenderer::default())), ..Self::default() }
    }

    /// Backend whose codec creation always fails.
    pub fn refusing() -> Self {
        Self { refuse_create: true, ..Self::default() }
    }

    /// Codecs created from now on start with their input stalled.
    pub fn with_stalled_input(mut self) -> Self {
        self.stall_input = true;
        self
    }

    /// The most recently created codec for `media`.
    pub fn codec(&self, media: MediaKind) -> Option<Arc<LoopbackCodec>> {
        self.codecs.lock().get(&media).cloned()
    }

    pub fn renderer(&self) -> Option<Arc<RecordingRenderer>> {
        self.renderer.clone()
    }
}

impl MediaBackend for LoopbackBackend {
    fn create_codec(&self, media: MediaKind) -> Result<Arc<dyn MediaCodec>> {
        if self.refuse_create {
            return Err(VcsError::decoder_error(media, crate::error::DecoderFailure::Create, "no codec available"));
        }
        let codec = Arc::new(LoopbackCodec::default());
        codec.stall_input(self.stall_input);
        self.codecs.lock().insert(media, Arc::clone(&codec));
        Ok(codec as Arc<dyn MediaCodec>)
    }

    fn alpha_renderer(&self) -> Option<Arc<dyn AlphaRenderer>> {
        self.renderer.clone().map(|renderer| renderer as Arc<dyn AlphaRenderer>)
    }
}

/// Collects player events until one satisfies `done`.
///
/// Returns everything received, ending with the matching event, or `Err` with what
/// arrived before the timeout.
pub fn events_until(
    events: &mut broadcast::Receiver<PlayerEvent>,
    timeout: Duration,
    done: impl Fn(&PlayerEvent) -> bool,
) -> std::result::Result<Vec<PlayerEvent>, Vec<PlayerEvent>> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => {
                let matched = done(&event);
                seen.push(event);
                if matched {
                    return Ok(seen);
                }
            }
            Err(TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return Err(seen);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Closed) => return Err(seen),
        }
    }
}
