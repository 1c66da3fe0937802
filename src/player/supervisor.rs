//! Serialises worker-thread events onto the session.
//!
//! Control, streaming and decoder threads only enqueue [`Signal`]s. The supervisor
//! thread handles them one at a time under the session lock, so a worker never
//! tears down the pipeline it is running on.

use std::sync::Weak;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use super::command::{is_session_timeout, merge_session_id};
use super::{Inner, Session};
use crate::config::InterfaceFormat;
use crate::control::ControlEvent;
use crate::decoder::DecoderEvent;
use crate::error::ErrorCode;
use crate::media::EsFrame;
use crate::streaming::StreamingEvent;
use crate::types::{MediaKind, PlayerEvent, PlayerStatus, SessionInfo};
use crate::{Result, VcsError};

pub(super) enum Signal {
    Control(ControlEvent),
    Streaming(MediaKind, StreamingEvent),
    Decoder(DecoderEvent),
    Shutdown,
}

/// A signal tagged with the generation of the component that raised it.
pub(super) struct Envelope {
    pub generation: u64,
    pub signal: Signal,
}

pub(super) fn spawn(inner: Weak<Inner>, signals: Receiver<Envelope>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("vcs-supervisor".to_string())
        .spawn(move || run(inner, signals))
        .map_err(|e| VcsError::connection_failed_with_source("cannot spawn supervisor", Box::new(e)))
}

fn run(inner: Weak<Inner>, signals: Receiver<Envelope>) {
    debug!("Supervisor started");
    while let Ok(envelope) = signals.recv() {
        if matches!(envelope.signal, Signal::Shutdown) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(envelope);
    }
    debug!("Supervisor ended");
}

impl Inner {
    fn dispatch(&self, envelope: Envelope) {
        let mut session = self.session.lock();
        // Decoders outlive pause/resume; channels are replaced on every start.
        let current = match envelope.signal {
            Signal::Decoder(_) => session.pipeline,
            _ => session.generation,
        };
        if envelope.generation != current {
            trace!(generation = envelope.generation, current, "Stale signal dropped");
            return;
        }

        let span = session.span.clone();
        let _entered = span.enter();
        match envelope.signal {
            Signal::Control(event) => self.on_control(&mut session, event),
            Signal::Streaming(media, event) => self.on_streaming(&mut session, media, event),
            Signal::Decoder(event) => self.on_decoder(&mut session, event),
            Signal::Shutdown => {}
        }
    }

    fn on_control(&self, session: &mut Session, event: ControlEvent) {
        match event {
            ControlEvent::SessionConnected { max_packet_count } => self.on_session_connected(session, max_packet_count),
            ControlEvent::AppReady => debug!("App ready to communicate"),
            ControlEvent::Xml(xml) => {
                if is_session_timeout(&xml) {
                    info!("Remote session timed out");
                    self.emit_qsm(session.qsm.session_timeout_log());
                    self.set_status(PlayerStatus::TimedOut);
                } else {
                    self.emit(PlayerEvent::Command(xml));
                }
            }
            ControlEvent::Json(json) => self.emit(PlayerEvent::Command(json)),
            ControlEvent::Error { code, message } => self.notify_error(session, code, &message),
        }
    }

    fn on_session_connected(&self, session: &mut Session, max_packet_count: u8) {
        let status = self.status();
        if status != PlayerStatus::Loading {
            debug!(%status, "Handshake outside loading ignored");
            return;
        }
        info!(max_packet_count, "Session connected");

        if let Err(e) = self.open_streaming(session) {
            self.notify_error(session, ErrorCode::VCS_CONNECTION_ERROR, &e.to_string());
            return;
        }
        let Some(route) = session.route.clone() else {
            return;
        };

        if session.app.interface_format == InterfaceFormat::Json {
            session.start_command = merge_session_id(&session.start_command, &route.session_id);
            if let Some(control) = &session.control {
                control.send_json(&session.start_command);
            }
        }

        self.emit(PlayerEvent::SessionInfo(SessionInfo {
            server_ip: route.endpoint.ip,
            server_port: route.endpoint.port,
            so_code: session.app.so_code.clone().unwrap_or_default(),
            public_ip: session.app.public_ip.clone().unwrap_or_default(),
            session_id: route.session_id,
        }));
        self.set_status(PlayerStatus::Playing);
    }

    fn on_streaming(&self, session: &mut Session, media: MediaKind, event: StreamingEvent) {
        match event {
            StreamingEvent::BufferFull => {
                self.drain_buffers(media);
                self.notify_error(session, ErrorCode::MEDIA_BUFFER_FULL, &media.to_string());
            }
            StreamingEvent::Error { code, message } => self.notify_error(session, code, &message),
        }
    }

    /// Drops queued audio and video so playback catches up with the stream.
    ///
    /// The alpha overlay is pinned to the newest queued video frame first, so planes
    /// already decoded for it stay on screen.
    fn drain_buffers(&self, media: MediaKind) {
        if media == MediaKind::Video && self.video_buffer.is_full() {
            if let Some(renderer) = &self.renderer {
                let newest = self
                    .video_buffer
                    .peek_last(|frame| EsFrame::new(frame).and_then(|frame| frame.wire_timestamp()));
                match newest {
                    Some(Ok(timestamp)) => renderer.set_alpha_timestamp(timestamp),
                    Some(Err(e)) => warn!(error = %e, "Newest video frame has no timestamp"),
                    None => {}
                }
            }
        }
        warn!(%media, "Media buffer full, dropping queued audio and video");
        self.audio_buffer.reset();
        self.video_buffer.reset();
    }

    fn on_decoder(&self, session: &mut Session, event: DecoderEvent) {
        match event {
            DecoderEvent::FirstFrameRendered => {
                self.notify_error(session, ErrorCode::FIRST_VIDEO_FRAME_RECEIVED, "");
                if let Some(initiate_type) = session.app.initiate_type.take().filter(|kind| !kind.is_empty()) {
                    self.emit_qsm(session.qsm.initiate_time_log(&initiate_type));
                }
            }
            DecoderEvent::QualityAlert { media, count } => {
                let (video, audio) = match media {
                    MediaKind::Video => (count, 0),
                    MediaKind::Audio => (0, count),
                };
                if let Some(record) = session.qsm.quality_log(video, audio) {
                    self.emit_qsm(record);
                }
            }
            DecoderEvent::Error { media, code } => {
                debug!(%media, %code, "Decoder reported an error");
                self.notify_error(session, code, "");
            }
        }
    }
}
