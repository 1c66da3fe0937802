//! Session state machine.
//!
//! [`VcsPlayer`] owns every resource a session needs: the media buffers, the alpha
//! pool, the timer service, the QSM logger and a small tokio runtime for timers,
//! routing requests and quality reports. Lifecycle calls (`start`, `pause`,
//! `resume`, `stop`) are serialised by one session lock.
//!
//! Worker threads never call back into the player. Their events are queued to a
//! supervisor thread which applies them under the same lock.
//! Hosts observe the session through [`VcsPlayer::events`] or
//! [`VcsPlayer::subscribe`].
//!
//! ```text
//! Stopped --start--> Loading --handshake--> Playing --pause--> Paused
//!    ^                  |                      |                 |
//!    +------stop / error+----------------------+      resume --> Loading
//! ```

mod command;
mod supervisor;

pub use command::{CLOUD_VERSION, control_start_command, is_session_timeout, merge_session_id};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{Span, debug, error, info, info_span, trace, warn};

use self::supervisor::{Envelope, Signal};
use crate::alpha::AlphaRenderer;
use crate::config::{AppDescriptor, EngineConfig, InterfaceFormat};
use crate::control::{ControlChannel, ControlConfig};
use crate::decoder::{AlphaStage, CodecFormat, DecoderConfig, MediaBackend, MediaDecoder};
use crate::error::ErrorCode;
use crate::logging::new_log_id;
use crate::media::{MediaBuffer, NativeBufferPool};
use crate::quality::qsm::QsmLogger;
use crate::router::{CsrRouter, HttpTransport, ReqwestTransport, Route};
use crate::streaming::{StreamingChannel, StreamingConfig};
use crate::timer::TimerService;
use crate::transport::TransportOptions;
use crate::types::{Listener, LogKind, MediaKind, PlayerEvent, PlayerStatus, ServerEndpoint};
use crate::{Result, VcsError};

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;
const RUNTIME_WORKERS: usize = 2;

/// Everything tied to one start/resume.
struct Session {
    /// Bumped on every start and resume. Tags control and streaming signals.
    generation: u64,
    /// Bumped whenever decoders are created. Tags decoder signals.
    pipeline: u64,
    span: Span,
    app: AppDescriptor,
    start_command: String,
    route: Option<Route>,
    control: Option<ControlChannel>,
    streams: Vec<StreamingChannel>,
    decoders: Vec<MediaDecoder>,
    qsm: QsmLogger,
}

impl Session {
    fn new() -> Self {
        Self {
            generation: 0,
            pipeline: 0,
            span: Span::none(),
            app: AppDescriptor::default(),
            start_command: String::new(),
            route: None,
            control: None,
            streams: Vec::new(),
            decoders: Vec::new(),
            qsm: QsmLogger::new(),
        }
    }
}

struct Inner {
    config: EngineConfig,
    runtime: Handle,
    timers: TimerService,
    backend: Arc<dyn MediaBackend>,
    renderer: Option<Arc<dyn AlphaRenderer>>,
    http: Arc<dyn HttpTransport>,
    video_buffer: Arc<MediaBuffer>,
    audio_buffer: Arc<MediaBuffer>,
    alpha_buffer: Arc<MediaBuffer>,
    alpha_pool: NativeBufferPool,
    status: RwLock<PlayerStatus>,
    frame_rendering: AtomicBool,
    events: broadcast::Sender<PlayerEvent>,
    signals: mpsc::Sender<Envelope>,
    session: Mutex<Session>,
}

/// Client for one cloud-streamed app at a time.
///
/// Lifecycle calls block: routing and connecting can take several seconds, so call
/// them from a regular thread rather than from async code.
pub struct VcsPlayer {
    inner: Arc<Inner>,
    supervisor: Option<JoinHandle<()>>,
    runtime: Option<Runtime>,
}

impl VcsPlayer {
    /// Creates a player whose routing requests go through [`ReqwestTransport`].
    pub fn new(config: EngineConfig, backend: Arc<dyn MediaBackend>) -> Result<Self> {
        let http = Arc::new(ReqwestTransport::new(config.timeouts.connect(), config.accept_invalid_certs)?);
        Self::with_http_transport(config, backend, http)
    }

    pub fn with_http_transport(
        config: EngineConfig,
        backend: Arc<dyn MediaBackend>,
        http: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKERS)
            .thread_name("vcs-runtime")
            .enable_all()
            .build()
            .map_err(|e| VcsError::connection_failed_with_source("cannot start runtime", Box::new(e)))?;

        let buffers = &config.buffers;
        let (signals, signal_rx) = mpsc::channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            runtime: runtime.handle().clone(),
            timers: TimerService::new(runtime.handle().clone()),
            renderer: backend.alpha_renderer(),
            backend,
            http,
            video_buffer: Arc::new(MediaBuffer::new("video", buffers.video_capacity, buffers.video_slot_size)),
            audio_buffer: Arc::new(MediaBuffer::new("audio", buffers.audio_capacity, buffers.audio_slot_size)),
            alpha_buffer: Arc::new(MediaBuffer::new("alpha", buffers.alpha_capacity, buffers.alpha_slot_size)),
            alpha_pool: NativeBufferPool::with_preallocated(
                buffers.alpha_pool_capacity,
                config.alpha_plane_size(),
                buffers.alpha_pool_preallocated,
            ),
            status: RwLock::new(PlayerStatus::Stopped),
            frame_rendering: AtomicBool::new(true),
            events,
            signals,
            session: Mutex::new(Session::new()),
            config,
        });

        let supervisor = supervisor::spawn(Arc::downgrade(&inner), signal_rx)?;
        info!(
            resolution = %inner.config.resolution(),
            alpha = inner.renderer.is_some(),
            "Player created"
        );
        Ok(Self { inner, supervisor: Some(supervisor), runtime: Some(runtime) })
    }

    pub fn status(&self) -> PlayerStatus {
        self.inner.status()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    /// Stream of every event emitted from now on. Slow consumers skip events.
    pub fn events(&self) -> impl Stream<Item = PlayerEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.inner.events.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagged");
                None
            }
        })
    }

    /// Starts a session. Ignored unless the player is stopped.
    ///
    /// Failures are reported as [`PlayerEvent::Error`] and leave the player stopped.
    pub fn start(&self, app: AppDescriptor, start_command: &str) {
        let mut session = self.inner.session.lock();
        let status = self.inner.status();
        if status != PlayerStatus::Stopped {
            info!(%status, "Player already started");
            return;
        }
        self.inner.begin(&mut session, app, start_command);
    }

    /// Closes the connections and keeps the decoders. Ignored when stopped.
    pub fn pause(&self) {
        let mut session = self.inner.session.lock();
        if self.inner.status() == PlayerStatus::Stopped {
            info!("Player already stopped");
            return;
        }
        let span = session.span.clone();
        let _entered = span.enter();

        self.inner.set_status(PlayerStatus::Paused);
        self.inner.close_channels(&mut session);
        for decoder in &session.decoders {
            decoder.pause();
        }
    }

    /// Reconnects a paused session, reusing its decoders. Ignored unless paused.
    pub fn resume(&self, app: AppDescriptor, start_command: &str) {
        let mut session = self.inner.session.lock();
        let status = self.inner.status();
        if status != PlayerStatus::Paused {
            info!(%status, "Player not paused");
            return;
        }
        self.inner.begin(&mut session, app, start_command);
    }

    /// Tears the session down. Idempotent.
    pub fn stop(&self) {
        let mut session = self.inner.session.lock();
        let span = session.span.clone();
        let _entered = span.enter();
        self.inner.stop_locked(&mut session);
    }

    /// Sends a key-down for a platform key code. Only while playing.
    pub fn send_key_down(&self, key_code: i32) -> bool {
        self.inner.with_control("key down", |_, control| control.request_key_down(key_code))
    }

    /// Sends a key-up for a platform key code and arms the response timer.
    pub fn send_key_up(&self, key_code: i32) -> bool {
        self.inner.with_control("key up", |_, control| control.request_key_up(key_code))
    }

    pub fn send_keep_alive(&self) -> bool {
        self.inner.with_control("keep-alive", |_, control| control.send_keep_alive())
    }

    /// Sends an application command in the session's interface format.
    pub fn send_command(&self, command: &str) -> bool {
        self.inner.with_control("command", |session, control| match session.app.interface_format {
            InterfaceFormat::Json => control.send_json(command),
            InterfaceFormat::Xml => control.send_xml(command),
        })
    }

    /// Presents decoded video when set; otherwise video is decoded and discarded.
    pub fn set_frame_rendering(&self, render: bool) {
        self.inner.frame_rendering.store(render, Ordering::Release);
        let session = self.inner.session.lock();
        for decoder in session.decoders.iter().filter(|decoder| decoder.media() == MediaKind::Video) {
            decoder.set_frame_rendering(render);
        }
    }
}

impl Drop for VcsPlayer {
    fn drop(&mut self) {
        self.stop();
        let _ = self.inner.signals.send(Envelope { generation: 0, signal: Signal::Shutdown });
        if let Some(supervisor) = self.supervisor.take() {
            if supervisor.join().is_err() {
                error!("Supervisor thread panicked");
            }
        }
        self.inner.timers.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!("Player dropped");
    }
}

impl std::fmt::Debug for VcsPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcsPlayer").field("status", &self.status()).finish()
    }
}

impl Inner {
    fn status(&self) -> PlayerStatus {
        *self.status.read()
    }

    /// Publishes a status. `TimedOut` is announced but never stored.
    fn set_status(&self, status: PlayerStatus) {
        if status != PlayerStatus::TimedOut {
            *self.status.write() = status;
        }
        info!(%status, "Player status");
        self.emit(PlayerEvent::StatusChanged(status));
    }

    fn emit(&self, event: PlayerEvent) {
        trace!(?event, "Emitting");
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn emit_qsm(&self, data: String) {
        debug!(%data, "QSM record");
        self.emit(PlayerEvent::Log { kind: LogKind::Qsm, data });
    }

    /// Listener that forwards component events to the supervisor.
    fn listener<E: 'static>(
        &self,
        generation: u64,
        wrap: impl Fn(E) -> Signal + Send + Sync + 'static,
    ) -> Listener<E> {
        let signals = self.signals.clone();
        Arc::new(move |event| {
            let _ = signals.send(Envelope { generation, signal: wrap(event) });
        })
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: self.config.timeouts.connect(),
            read_timeout: self.config.timeouts.socket_read(),
        }
    }

    /// Shared body of start and resume: resolve, build decoders if needed, connect.
    fn begin(&self, session: &mut Session, app: AppDescriptor, start_command: &str) {
        session.generation += 1;
        session.span = info_span!("vcs_session", log_id = %new_log_id());
        let span = session.span.clone();
        let _entered = span.enter();

        self.set_status(PlayerStatus::Loading);
        session.qsm.begin_session(app.app_id.clone());
        session.start_command = start_command.to_string();
        session.app = app;
        session.app.log_summary();

        if let Err(e) = session.app.validate() {
            self.notify_error(session, e.code(), &e.to_string());
            return;
        }

        let route = match self.resolve_route(&mut session.app) {
            Ok(route) => route,
            Err(e) => {
                self.notify_error(session, e.code(), &e.to_string());
                return;
            }
        };
        info!(
            server = %route.endpoint,
            session_id = %route.session_id,
            so_code = ?session.app.so_code,
            public_ip = ?session.app.public_ip,
            "Server resolved"
        );
        session.qsm.set_server_ip(route.endpoint.ip.clone());
        session.route = Some(route);

        if session.decoders.is_empty() {
            if let Err(e) = self.start_decoders(session) {
                self.notify_error(session, ErrorCode::DECODER_CREATE_ERROR, &e.to_string());
                return;
            }
        }
        self.connect_control(session);
    }

    fn resolve_route(&self, app: &mut AppDescriptor) -> Result<Route> {
        if app.use_csr {
            let router = CsrRouter::new(Arc::clone(&self.http), self.runtime.clone(), self.config.timeouts.http());
            return router.resolve(app);
        }
        Ok(Route {
            endpoint: ServerEndpoint { ip: app.vcs_ip.clone().unwrap_or_default(), port: app.vcs_port },
            session_id: String::new(),
        })
    }

    fn start_decoders(&self, session: &mut Session) -> Result<()> {
        self.video_buffer.reset();
        self.audio_buffer.reset();
        self.alpha_buffer.reset();
        session.pipeline += 1;

        let timeouts = &self.config.timeouts;
        let video_config = DecoderConfig {
            format: CodecFormat::video(
                session.app.video_codec,
                self.config.screen_width,
                self.config.screen_height,
                session.app.video_fps,
            ),
            fps: session.app.video_fps,
            stop_timeout: timeouts.decoder_stop(),
            quality_interval: timeouts.quality_report(),
        };
        let audio_config = DecoderConfig { format: CodecFormat::aac(), ..video_config.clone() };
        let alpha = self.renderer.as_ref().map(|renderer| AlphaStage {
            buffer: Arc::clone(&self.alpha_buffer),
            pool: self.alpha_pool.clone(),
            renderer: Arc::clone(renderer),
        });

        let stages = [
            (MediaKind::Video, video_config, Arc::clone(&self.video_buffer), alpha),
            (MediaKind::Audio, audio_config, Arc::clone(&self.audio_buffer), None),
        ];
        for (media, config, buffer, alpha) in stages {
            let codec = self.backend.create_codec(media)?;
            let listener = self.listener(session.pipeline, Signal::Decoder);
            let decoder = MediaDecoder::start(media, codec, config, buffer, alpha, &self.runtime, listener)?;
            if media == MediaKind::Video {
                decoder.set_frame_rendering(self.frame_rendering.load(Ordering::Acquire));
            }
            session.decoders.push(decoder);
        }
        Ok(())
    }

    fn connect_control(&self, session: &mut Session) {
        let Some(route) = session.route.as_ref() else {
            return;
        };
        let command =
            control_start_command(&session.app, &session.start_command, &route.session_id, &self.config.resolution());
        let config = ControlConfig {
            host: route.endpoint.ip.clone(),
            port: route.endpoint.port,
            transport: self.transport_options(),
            keep_alive_timeout: self.config.timeouts.keep_alive(),
            disconnect_grace: self.config.timeouts.disconnect_grace(),
            wire_dump: self.config.log.wire_dump,
        };
        let listener = self.listener(session.generation, Signal::Control);

        match ControlChannel::connect(&config, &session.app.mac_address, &command, self.timers.clone(), listener) {
            Ok(control) => session.control = Some(control),
            Err(e) => {
                error!(error = %e, "Control connect failed");
                self.notify_error(session, ErrorCode::VCS_CONNECTION_ERROR, &e.to_string());
            }
        }
    }

    /// Opens the video channel, then the audio channel.
    fn open_streaming(&self, session: &mut Session) -> Result<()> {
        let endpoint = match &session.route {
            Some(route) => route.endpoint.clone(),
            None => return Err(VcsError::connection_failed("no resolved server")),
        };
        for media in [MediaKind::Video, MediaKind::Audio] {
            let config = StreamingConfig {
                host: endpoint.ip.clone(),
                port: endpoint.port,
                transport: self.transport_options(),
                max_payload: StreamingConfig::default_max_payload(media),
                wire_dump: self.config.log.wire_dump,
            };
            let (buffer, alpha) = match media {
                MediaKind::Video => (
                    Arc::clone(&self.video_buffer),
                    self.renderer.as_ref().map(|_| Arc::clone(&self.alpha_buffer)),
                ),
                MediaKind::Audio => (Arc::clone(&self.audio_buffer), None),
            };
            let listener = self.listener(session.generation, move |event| Signal::Streaming(media, event));
            let channel = StreamingChannel::open(&config, media, &session.app.mac_address, buffer, alpha, listener)?;
            session.streams.push(channel);
        }
        Ok(())
    }

    fn close_channels(&self, session: &mut Session) {
        if let Some(control) = session.control.take() {
            control.disconnect();
        }
        for stream in session.streams.drain(..).rev() {
            stream.close();
        }
    }

    fn stop_locked(&self, session: &mut Session) {
        if self.status() == PlayerStatus::Stopped {
            debug!("Player already stopped");
            return;
        }
        self.set_status(PlayerStatus::Stopped);
        self.close_channels(session);
        for decoder in session.decoders.drain(..).rev() {
            decoder.stop();
        }
        info!("Session stopped");
    }

    /// Reports an error to the host, preceded by its QSM record.
    ///
    /// Anything but the informational codes ends the session.
    fn notify_error(&self, session: &mut Session, code: ErrorCode, message: &str) {
        if self.status() == PlayerStatus::Stopped {
            info!(%code, "Error after stop ignored");
            return;
        }
        if code == ErrorCode::FIRST_VIDEO_FRAME_RECEIVED {
            debug!("First video frame rendered");
        } else if code.is_informational() {
            warn!(%code, %message, "Session notice");
        } else {
            error!(%code, %message, "Session error");
        }

        if !code.is_informational() && code != ErrorCode::UI_EMERGENCY_MODE {
            let detail = (!message.is_empty()).then_some(message);
            self.emit_qsm(session.qsm.error_log(code, detail));
        }
        self.emit(PlayerEvent::Error { code, message: message.to_string() });

        if !code.is_informational() {
            self.stop_locked(session);
        }
    }

    /// Runs `f` against the control channel while playing.
    fn with_control(&self, operation: &str, f: impl FnOnce(&Session, &ControlChannel) -> bool) -> bool {
        let status = self.status();
        if status != PlayerStatus::Playing {
            warn!(operation, %status, "Not playing");
            return false;
        }
        let session = self.session.lock();
        match &session.control {
            Some(control) => f(&session, control),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests;
