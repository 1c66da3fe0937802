//! Lifecycle guards and failure paths. Full sessions against the fake server are
//! exercised in `tests/player_session.rs`.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use anyhow::{Context, ensure};
use tokio::sync::broadcast::error::TryRecvError;

use super::VcsPlayer;
use crate::config::{AppDescriptor, EngineConfig};
use crate::error::ErrorCode;
use crate::router::{HttpResponse, HttpTransport};
use crate::test_utils::{
    FakeVcsServer, LoopbackBackend, audio_frame, connect_success, events_until, stream_info_ack, streaming_frame,
    video_frame,
};
use crate::types::{LogKind, MediaKind, PlayerEvent, PlayerStatus};
use crate::{Result, VcsError};

const START_XML: &str = r#"<INTERFACE version="3"><COMMAND>StartApp</COMMAND></INTERFACE>"#;
const WAIT: Duration = Duration::from_secs(3);

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timeouts.connect_ms = 500;
    config.timeouts.http_ms = 500;
    config.timeouts.decoder_stop_ms = 500;
    config.timeouts.disconnect_grace_ms = 50;
    config
}

fn player(backend: Arc<LoopbackBackend>) -> VcsPlayer {
    let _ = tracing_subscriber::fmt::try_init();
    VcsPlayer::with_http_transport(config(), backend, Arc::new(CannedHttp::default())).expect("player")
}

/// A loopback port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn is_stopped(event: &PlayerEvent) -> bool {
    *event == PlayerEvent::StatusChanged(PlayerStatus::Stopped)
}

fn error_code(events: &[PlayerEvent]) -> Option<ErrorCode> {
    events.iter().find_map(|event| match event {
        PlayerEvent::Error { code, .. } => Some(*code),
        _ => None,
    })
}

/// Answers every POST with the same body.
#[derive(Default)]
struct CannedHttp {
    body: String,
    posts: AtomicUsize,
}

#[async_trait::async_trait]
impl HttpTransport for CannedHttp {
    async fn post(&self, _url: &str, _headers: &[(String, String)], _body: String) -> Result<HttpResponse> {
        self.posts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(HttpResponse::ok(self.body.clone()))
    }

    async fn get(&self, _url: &str, _headers: &[(String, String)]) -> Result<HttpResponse> {
        Err(VcsError::connection_failed("unexpected GET"))
    }
}

#[test]
fn invalid_descriptor_ends_in_stopped() -> anyhow::Result<()> {
    let player = player(Arc::new(LoopbackBackend::default()));
    let mut events = player.subscribe();

    player.start(AppDescriptor::default(), START_XML);

    let seen = events_until(&mut events, WAIT, is_stopped).ok().context("no stop after invalid descriptor")?;
    ensure!(seen[0] == PlayerEvent::StatusChanged(PlayerStatus::Loading), "first event was {:?}", seen[0]);
    ensure!(matches!(seen[1], PlayerEvent::Log { kind: LogKind::Qsm, .. }), "QSM record must precede the error");
    ensure!(error_code(&seen) == Some(ErrorCode::VCS_CONNECTION_ERROR), "events: {:?}", seen);
    ensure!(player.status() == PlayerStatus::Stopped);
    Ok(())
}

#[test]
fn codec_creation_failure_reports_decoder_error() -> anyhow::Result<()> {
    let player = player(Arc::new(LoopbackBackend::refusing()));
    let mut events = player.subscribe();

    player.start(AppDescriptor::direct("aa:bb", "127.0.0.1", closed_port()), START_XML);

    let seen = events_until(&mut events, WAIT, is_stopped).ok().context("no stop after codec failure")?;
    ensure!(error_code(&seen) == Some(ErrorCode::DECODER_CREATE_ERROR), "events: {:?}", seen);
    ensure!(player.status() == PlayerStatus::Stopped);
    Ok(())
}

#[test]
fn unreachable_server_stops_and_releases_decoders() -> anyhow::Result<()> {
    let backend = Arc::new(LoopbackBackend::default());
    let player = player(Arc::clone(&backend));
    let mut events = player.subscribe();

    player.start(AppDescriptor::direct("aa:bb", "127.0.0.1", closed_port()), START_XML);

    let seen = events_until(&mut events, WAIT, is_stopped).ok().context("no stop after refused connect")?;
    ensure!(error_code(&seen) == Some(ErrorCode::VCS_CONNECTION_ERROR), "events: {:?}", seen);
    let video = backend.codec(MediaKind::Video).context("video codec never created")?;
    ensure!(video.is_stopped(), "video codec still running after stop");
    Ok(())
}

#[test]
fn routing_rejection_is_reported_in_the_csr_band() -> anyhow::Result<()> {
    let http = Arc::new(CannedHttp {
        body: r#"<CSROUTE><Result Code="105" Message="no server"/></CSROUTE>"#.to_string(),
        ..CannedHttp::default()
    });
    let backend = Arc::new(LoopbackBackend::default());
    let player = VcsPlayer::with_http_transport(config(), backend, Arc::clone(&http) as Arc<dyn HttpTransport>)?;
    let mut events = player.subscribe();

    let app = AppDescriptor {
        use_csr: true,
        csr_url: "https://csr.example".to_string(),
        public_ip: Some("1.2.3.4".to_string()),
        ..AppDescriptor::direct("aa:bb", "127.0.0.1", 1)
    };
    player.start(app, START_XML);

    let seen = events_until(&mut events, WAIT, is_stopped).ok().context("no stop after routing rejection")?;
    ensure!(error_code(&seen) == Some(ErrorCode(20105)), "events: {:?}", seen);
    ensure!(http.posts.load(std::sync::atomic::Ordering::SeqCst) == 1, "rejections are not retried");
    Ok(())
}

#[test]
fn idle_player_ignores_everything_but_start() {
    let player = player(Arc::new(LoopbackBackend::default()));
    let mut events = player.subscribe();

    player.pause();
    player.stop();
    player.stop();
    player.resume(AppDescriptor::direct("aa:bb", "127.0.0.1", 1), START_XML);

    assert!(!player.send_key_down(crate::control::keys::host::KEYCODE_DPAD_UP));
    assert!(!player.send_key_up(crate::control::keys::host::KEYCODE_DPAD_UP));
    assert!(!player.send_keep_alive());
    assert!(!player.send_command("<INTERFACE/>"));
    assert_eq!(player.status(), PlayerStatus::Stopped);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn second_start_while_loading_is_ignored() -> anyhow::Result<()> {
    let server = FakeVcsServer::bind()?;
    let player = player(Arc::new(LoopbackBackend::default()));
    let mut events = player.subscribe();
    let app = AppDescriptor::direct("aa:bb", server.host(), server.port());

    player.start(app.clone(), START_XML);
    ensure!(player.status() == PlayerStatus::Loading, "status {:?}", player.status());
    let first = events_until(&mut events, Duration::from_millis(200), |_| false).unwrap_err();

    player.start(app, START_XML);
    ensure!(player.status() == PlayerStatus::Loading);
    ensure!(matches!(events.try_recv(), Err(TryRecvError::Empty)), "second start emitted events");
    ensure!(first == vec![PlayerEvent::StatusChanged(PlayerStatus::Loading)], "events: {:?}", first);

    player.stop();
    player.stop();
    let seen = events_until(&mut events, WAIT, is_stopped).ok().context("no stop event")?;
    ensure!(seen == vec![PlayerEvent::StatusChanged(PlayerStatus::Stopped)], "events: {:?}", seen);
    ensure!(matches!(events.try_recv(), Err(TryRecvError::Empty)), "second stop emitted events");
    Ok(())
}

#[test]
fn event_stream_sees_the_same_sequence() -> anyhow::Result<()> {
    use futures::StreamExt;

    let player = player(Arc::new(LoopbackBackend::default()));
    let mut stream = player.events();

    player.start(AppDescriptor::default(), START_XML);

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let first = rt.block_on(async { tokio::time::timeout(WAIT, stream.next()).await })?;
    ensure!(first == Some(PlayerEvent::StatusChanged(PlayerStatus::Loading)), "first event {:?}", first);
    let seen = rt.block_on(async {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(WAIT, stream.next()).await {
            let stopped = is_stopped(&event);
            seen.push(event);
            if stopped {
                break;
            }
        }
        seen
    });
    ensure!(seen.last().is_some_and(is_stopped), "stream events: {:?}", seen);
    Ok(())
}

/// Polls `done` until it holds or the wait runs out.
fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while !done() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn full_video_buffer_drains_both_queues_and_keeps_playing() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = FakeVcsServer::bind()?;
    let backend = Arc::new(LoopbackBackend::with_renderer().with_stalled_input());
    let mut config = config();
    config.buffers.video_capacity = 4;
    config.buffers.audio_capacity = 4;
    let player = VcsPlayer::with_http_transport(config, Arc::clone(&backend) as _, Arc::new(CannedHttp::default()))?;
    let mut events = player.subscribe();

    player.start(AppDescriptor::direct("aa:bb", server.host(), server.port()), START_XML);
    let mut control = server.accept()?;
    control.read_start_app()?;
    control.send(&connect_success(0, 4))?;
    let mut video = server.accept()?;
    video.read_stream_info_request()?;
    let mut audio = server.accept()?;
    audio.read_stream_info_request()?;
    events_until(&mut events, WAIT, |event| *event == PlayerEvent::StatusChanged(PlayerStatus::Playing))
        .ok()
        .context("session never reached playing")?;

    let video_codec = backend.codec(MediaKind::Video).context("no video codec")?;
    let audio_codec = backend.codec(MediaKind::Audio).context("no audio codec")?;
    let renderer = backend.renderer().context("no renderer")?;

    // Each feed thread holds its first frame against the stalled codec.
    audio.send(&stream_info_ack(b""))?;
    audio.send(&streaming_frame(1, &audio_frame(10, &[0x21, 0x10])))?;
    ensure!(wait_until(|| audio_codec.input_attempts() > 0), "audio feed never reached the codec");
    audio.send(&streaming_frame(2, &audio_frame(20, &[0x21, 0x11])))?;
    ensure!(wait_until(|| player.inner.audio_buffer.len() == 1), "second audio frame not buffered");

    video.send(&stream_info_ack(b"1920x1080@30"))?;
    video.send(&streaming_frame(1, &video_frame(100, false, &[0, 0, 0, 1, 0x65])))?;
    ensure!(wait_until(|| video_codec.input_attempts() > 0), "video feed never reached the codec");
    video.send(&streaming_frame(2, &video_frame(200, false, &[0, 0, 0, 1, 0x41])))?;
    video.send(&streaming_frame(3, &video_frame(300, false, &[0, 0, 0, 1, 0x41])))?;
    // The newest frame is an additional frame: its wire timestamp is pinned, not the hold value.
    video.send(&streaming_frame(4, &video_frame(400, true, &[0, 0, 0, 1, 0x41])))?;

    let seen = events_until(&mut events, WAIT, |event| {
        matches!(event, PlayerEvent::Error { code, .. } if *code == ErrorCode::MEDIA_BUFFER_FULL)
    })
    .ok()
    .context("no buffer-full notice")?;
    ensure!(
        !seen.iter().any(|event| matches!(event, PlayerEvent::Log { kind: LogKind::Qsm, .. })),
        "buffer-full must not write a QSM record: {:?}",
        seen
    );
    ensure!(player.inner.video_buffer.is_empty(), "video buffer holds {}", player.inner.video_buffer.len());
    ensure!(player.inner.audio_buffer.is_empty(), "audio buffer holds {}", player.inner.audio_buffer.len());
    ensure!(renderer.timestamps() == vec![400], "alpha timestamps {:?}", renderer.timestamps());

    std::thread::sleep(Duration::from_millis(100));
    ensure!(player.status() == PlayerStatus::Playing, "status {:?}", player.status());
    ensure!(
        !matches!(events.try_recv(), Ok(PlayerEvent::StatusChanged(PlayerStatus::Stopped))),
        "buffer-full ended the session"
    );

    player.stop();
    ensure!(player.status() == PlayerStatus::Stopped);
    Ok(())
}
