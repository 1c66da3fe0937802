//! Full player sessions against the in-process fake VCS server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use vcs_client::control::keys::host::KEYCODE_DPAD_UP;
use vcs_client::test_utils::{
    FakePeer, FakeVcsServer, LoopbackBackend, connect_success, events_until, stream_info_ack, streaming_frame,
    video_frame,
};
use vcs_client::wire::{CommandWriter, code};
use vcs_client::{
    AppDescriptor, EngineConfig, ErrorCode, InterfaceFormat, LogKind, MediaKind, PlayerEvent, PlayerStatus, VcsPlayer,
};

const MAC: &str = "00:11:22:33:44:55";
const START_XML: &str = r#"<INTERFACE version="3"><COMMAND>StartApp</COMMAND></INTERFACE>"#;
const WAIT: Duration = Duration::from_secs(5);

struct Session {
    player: VcsPlayer,
    backend: Arc<LoopbackBackend>,
    events: broadcast::Receiver<PlayerEvent>,
    control: FakePeer,
    video: FakePeer,
    _audio: FakePeer,
    start_body: String,
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timeouts.connect_ms = 1000;
    config.timeouts.socket_read_ms = 100;
    config.timeouts.decoder_stop_ms = 1000;
    config.timeouts.disconnect_grace_ms = 50;
    config
}

fn wait_for(
    events: &mut broadcast::Receiver<PlayerEvent>,
    what: &str,
    done: impl Fn(&PlayerEvent) -> bool,
) -> Result<Vec<PlayerEvent>> {
    events_until(events, WAIT, done).map_err(|seen| anyhow!("timed out waiting for {}; saw {:?}", what, seen))
}

fn is_status(status: PlayerStatus) -> impl Fn(&PlayerEvent) -> bool {
    move |event| *event == PlayerEvent::StatusChanged(status)
}

/// Starts a session and plays the server side of the handshake up to `Playing`.
fn establish(app: AppDescriptor, start_command: &str) -> Result<(Session, Vec<PlayerEvent>)> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = FakeVcsServer::bind()?;
    let backend = Arc::new(LoopbackBackend::default());
    let player = VcsPlayer::new(config(), Arc::clone(&backend) as _)?;
    let mut events = player.subscribe();

    let app = AppDescriptor { vcs_ip: Some(server.host().to_string()), vcs_port: server.port(), ..app };
    player.start(app, start_command);
    ensure!(player.status() == PlayerStatus::Loading, "status after start: {:?}", player.status());

    let mut control = server.accept()?;
    let (device, start_body) = control.read_start_app()?;
    ensure!(device == format!("{{{}}}", MAC), "device id was {}", device);
    control.send(&connect_success(0, 5))?;

    let mut video = server.accept()?;
    ensure!(video.read_stream_info_request()?.0 == 0, "first streaming channel must be video");
    let mut audio = server.accept()?;
    ensure!(audio.read_stream_info_request()?.0 == 1, "second streaming channel must be audio");

    let seen = wait_for(&mut events, "playing", is_status(PlayerStatus::Playing))?;
    let session = Session { player, backend, events, control, video, _audio: audio, start_body };
    Ok((session, seen))
}

#[test]
fn xml_session_plays_reports_and_stops() -> Result<()> {
    let app = AppDescriptor { initiate_type: Some("launcher".to_string()), ..AppDescriptor::direct(MAC, "", 0) };
    let (mut session, seen) = establish(app, START_XML)?;

    ensure!(
        session.start_body == r#"<INTERFACE version="3"><COMMAND>StartApp</COMMAND><sessionId></sessionId></INTERFACE>"#,
        "start body was {}",
        session.start_body
    );
    let info = seen
        .iter()
        .find_map(|event| match event {
            PlayerEvent::SessionInfo(info) => Some(info.clone()),
            _ => None,
        })
        .context("no session info before playing")?;
    ensure!(info.server_ip == "127.0.0.1");

    // First decoded video frame: informational notice, then the initiate-time record.
    session.video.send(&stream_info_ack(b"1920x1080@30"))?;
    session.video.send(&streaming_frame(1, &video_frame(33_000, false, &[0, 0, 0, 1, 0x65, 0x88])))?;
    let seen = wait_for(&mut session.events, "initiate-time record", |event| {
        matches!(event, PlayerEvent::Log { kind: LogKind::Qsm, .. })
    })?;
    ensure!(
        seen.iter().any(|event| matches!(
            event,
            PlayerEvent::Error { code, .. } if *code == ErrorCode::FIRST_VIDEO_FRAME_RECEIVED
        )),
        "no first-frame notice in {:?}",
        seen
    );
    ensure!(session.player.status() == PlayerStatus::Playing, "first frame must not end the session");
    let codec = session.backend.codec(MediaKind::Video).context("no video codec")?;
    ensure!(codec.queued().iter().any(|(pts, _)| *pts == 33_000), "frame never reached the codec");

    ensure!(session.player.send_key_down(KEYCODE_DPAD_UP));
    ensure!(session.control.read_i32()? == code::KEY_DOWN);

    let command = "<INTERFACE><COMMAND>Notify</COMMAND></INTERFACE>";
    session.control.send(&CommandWriter::command(code::XML_INBOUND).string(command).finish())?;
    wait_for(&mut session.events, "command", |event| *event == PlayerEvent::Command(command.to_string()))?;

    let expiry = "<INTERFACE><COMMAND>ConnectionInfo</COMMAND><DATA><returnApp>-3</returnApp></DATA></INTERFACE>";
    session.control.send(&CommandWriter::command(code::XML_INBOUND).string(expiry).finish())?;
    let seen = wait_for(&mut session.events, "timeout signal", is_status(PlayerStatus::TimedOut))?;
    ensure!(matches!(seen.first(), Some(PlayerEvent::Log { kind: LogKind::Qsm, .. })), "events: {:?}", seen);
    ensure!(session.player.status() == PlayerStatus::Playing, "TimedOut is never retained");

    session.player.stop();
    wait_for(&mut session.events, "stop", is_status(PlayerStatus::Stopped))?;
    ensure!(codec.is_stopped(), "video codec still running");

    session.player.stop();
    ensure!(matches!(session.events.try_recv(), Err(TryRecvError::Empty)), "second stop emitted events");
    Ok(())
}

#[test]
fn json_session_sends_the_start_command_after_handshake() -> Result<()> {
    let app = AppDescriptor { interface_format: InterfaceFormat::Json, ..AppDescriptor::direct(MAC, "", 0) };
    let (mut session, _) = establish(app, r#"{"COMMAND":"StartApp","DATA":{"url":"app://home"}}"#)?;

    ensure!(session.start_body.contains("<COMMAND>StartApp</COMMAND>"), "start body: {}", session.start_body);
    ensure!(session.start_body.contains("<mac>00:11:22:33:44:55</mac>"));

    ensure!(session.control.read_i32()? == code::JSON_OUTBOUND);
    let json: serde_json::Value = serde_json::from_str(&session.control.read_string()?)?;
    ensure!(json["DATA"]["sessionId"] == "", "json: {}", json);
    ensure!(json["DATA"]["url"] == "app://home", "json: {}", json);

    ensure!(session.player.send_command(r#"{"COMMAND":"Back"}"#));
    ensure!(session.control.read_i32()? == code::JSON_OUTBOUND);
    ensure!(session.control.read_string()? == r#"{"COMMAND":"Back"}"#);
    Ok(())
}

#[test]
fn server_error_report_ends_the_session() -> Result<()> {
    let (mut session, _) = establish(AppDescriptor::direct(MAC, "", 0), START_XML)?;

    session.control.send(&CommandWriter::command(code::ERROR_REPORT).int(12).int(3).int(0).finish())?;
    let seen = wait_for(&mut session.events, "stop", is_status(PlayerStatus::Stopped))?;

    let error = seen.iter().position(|event| matches!(event, PlayerEvent::Error { .. })).context("no error event")?;
    ensure!(error > 0 && matches!(seen[error - 1], PlayerEvent::Log { kind: LogKind::Qsm, .. }), "events: {:?}", seen);
    ensure!(
        matches!(&seen[error], PlayerEvent::Error { code, message } if *code == ErrorCode(47001) && message == "3"),
        "events: {:?}",
        seen
    );
    ensure!(session.player.status() == PlayerStatus::Stopped);
    ensure!(!session.player.send_key_down(KEYCODE_DPAD_UP), "keys are refused once stopped");
    Ok(())
}

#[test]
fn pause_and_resume_reuse_the_decoders() -> Result<()> {
    let (mut session, _) = establish(AppDescriptor::direct(MAC, "", 0), START_XML)?;
    let first_codec = session.backend.codec(MediaKind::Video).context("no video codec")?;

    session.player.pause();
    wait_for(&mut session.events, "pause", is_status(PlayerStatus::Paused))?;
    ensure!(!first_codec.is_stopped(), "pause must keep the decoders");

    // A second pause still reports the status.
    session.player.pause();
    wait_for(&mut session.events, "second pause", is_status(PlayerStatus::Paused))?;

    session.player.stop();
    wait_for(&mut session.events, "stop", is_status(PlayerStatus::Stopped))?;
    ensure!(first_codec.is_stopped());

    session.player.resume(AppDescriptor::direct(MAC, "127.0.0.1", 1), START_XML);
    ensure!(session.player.status() == PlayerStatus::Stopped, "resume needs a paused player");
    Ok(())
}
