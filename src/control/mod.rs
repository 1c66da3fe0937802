//! Control channel: session handshake, app commands, key events and keep-alive.
//!
//! The channel owns one [`TcpTransport`] and a reader thread that consumes one
//! command word at a time. Everything the server sends is reported as a
//! [`ControlEvent`] through the listener given at connect time; the listener is
//! called from the reader thread (or a timer worker) and must not block.

pub mod keys;

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::ErrorCode;
use crate::logging::hex_dump;
use crate::timer::{CONTROL_KEEP_ALIVE, TimerService};
use crate::transport::{ReadError, TcpTransport, TransportOptions, WriteErrorHandler};
use crate::types::Listener;
use crate::wire::{self, code};
use crate::Result;

/// Something the control channel observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The server accepted the start-app command.
    SessionConnected { max_packet_count: u8 },
    /// The cloud app is ready to exchange commands.
    AppReady,
    Xml(String),
    Json(String),
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Ready,
    Disconnecting,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlState::Disconnected => "disconnected",
            ControlState::Connecting => "connecting",
            ControlState::AwaitingHandshake => "awaiting-handshake",
            ControlState::Ready => "ready",
            ControlState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportOptions,
    /// How long a key-up may go unacknowledged.
    pub keep_alive_timeout: Duration,
    /// How long disconnect waits for the disconnect command to flush.
    pub disconnect_grace: Duration,
    /// Dump inbound command bodies at trace level.
    pub wire_dump: bool,
}

struct Shared {
    device_id: String,
    transport: Arc<TcpTransport>,
    state: Mutex<ControlState>,
    timers: TimerService,
    listener: Listener<ControlEvent>,
    wire_dump: bool,
}

impl Shared {
    fn set_state(&self, next: ControlState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = %*state, to = %next, "Control state");
            *state = next;
        }
    }

    fn notify_error(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        info!(%code, %message, "Control channel error");
        (self.listener)(ControlEvent::Error { code, message });
    }
}

/// Command connection to a VCS server.
pub struct ControlChannel {
    shared: Arc<Shared>,
    keep_alive_timeout: Duration,
    disconnect_grace: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// Connects, starts the reader thread and sends the start-app command.
    pub fn connect(
        config: &ControlConfig,
        device_id: &str,
        start_command: &str,
        timers: TimerService,
        listener: Listener<ControlEvent>,
    ) -> Result<Self> {
        debug!(host = %config.host, port = config.port, "Connecting control channel");

        let on_write_error: WriteErrorHandler = {
            let listener = Arc::clone(&listener);
            Arc::new(move |e| {
                listener(ControlEvent::Error { code: ErrorCode::SOCKET_SEND_ERROR, message: e.to_string() });
            })
        };
        let transport = TcpTransport::connect(&config.host, config.port, config.transport, on_write_error)?;

        let shared = Arc::new(Shared {
            device_id: device_id.to_string(),
            transport,
            state: Mutex::new(ControlState::Connecting),
            timers,
            listener,
            wire_dump: config.wire_dump,
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("vcs-control-reader".to_string())
            .spawn(move || read_loop(reader_shared))
            .map_err(|e| crate::VcsError::connection_failed_with_source("cannot spawn control reader", Box::new(e)))?;

        let channel = Self {
            shared,
            keep_alive_timeout: config.keep_alive_timeout,
            disconnect_grace: config.disconnect_grace,
            reader: Mutex::new(Some(reader)),
        };

        channel.shared.set_state(ControlState::AwaitingHandshake);
        channel.send(wire::start_app(device_id, start_command));
        info!(peer = %channel.shared.transport.peer(), "Start-app sent");
        trace!(status = %start_command, "Start-app body");
        Ok(channel)
    }

    pub fn state(&self) -> ControlState {
        *self.shared.state.lock()
    }

    /// Sends a key-down for a host key. Returns `false` for unmapped keys.
    pub fn request_key_down(&self, host_key: i32) -> bool {
        let Some(key) = keys::to_protocol(host_key) else {
            debug!(host_key, "Unmapped key");
            return false;
        };
        debug!(key, "Key down");
        self.send(wire::key_down(key))
    }

    /// Sends a key-up and arms the keep-alive response timer.
    pub fn request_key_up(&self, host_key: i32) -> bool {
        let Some(key) = keys::to_protocol(host_key) else {
            debug!(host_key, "Unmapped key");
            return false;
        };

        let listener = Arc::clone(&self.shared.listener);
        self.shared.timers.start(CONTROL_KEEP_ALIVE, self.keep_alive_timeout, move || {
            warn!("Key response timeout");
            listener(ControlEvent::Error { code: ErrorCode::VCS_KEY_RESPONSE_TIMEOUT, message: String::new() });
        });

        debug!(key, "Key up");
        self.send(wire::key_up(key))
    }

    /// Probes server liveness with the reserved dummy key.
    pub fn send_keep_alive(&self) -> bool {
        debug!("Keep-alive");
        self.send(wire::key_down(keys::KEEP_ALIVE_KEY_CODE))
    }

    pub fn send_xml(&self, xml: &str) -> bool {
        debug!(len = xml.len(), "Send XML command");
        trace!(%xml, "XML command body");
        self.send(wire::xml_command(xml))
    }

    pub fn send_json(&self, json: &str) -> bool {
        debug!(len = json.len(), "Send JSON command");
        trace!(%json, "JSON command body");
        self.send(wire::json_command(json))
    }

    /// Tells the server the session is over and releases the connection.
    ///
    /// Waits up to the configured grace period for the disconnect command to
    /// flush. Safe to call more than once.
    pub fn disconnect(&self) {
        self.shared.timers.cancel(CONTROL_KEEP_ALIVE);

        let transport = &self.shared.transport;
        if !transport.is_closed() {
            self.shared.set_state(ControlState::Disconnecting);
            let packet = wire::disconnect(&self.shared.device_id);
            match transport.write_and_wait(packet, self.disconnect_grace) {
                Ok(()) => debug!("Disconnect sent"),
                Err(e) => debug!(error = %e, "Disconnect not delivered"),
            }
            transport.close();
            info!("Control channel disconnected");
        }
        self.shared.set_state(ControlState::Disconnected);

        if let Some(reader) = self.reader.lock().take() {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                error!("Control reader panicked");
            }
        }
    }

    fn send(&self, packet: Vec<u8>) -> bool {
        match self.state() {
            ControlState::AwaitingHandshake | ControlState::Ready => self.shared.transport.write_async(packet),
            state => {
                debug!(%state, "Control channel not connected, dropping command");
                false
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shared.timers.cancel(CONTROL_KEEP_ALIVE);
        self.shared.transport.close();
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("peer", &self.shared.transport.peer())
            .field("state", &self.state())
            .finish()
    }
}

fn read_loop(shared: Arc<Shared>) {
    debug!("Control reader started");
    loop {
        match read_command(&shared) {
            Ok(()) => {}
            Err(ReadError::Closed) => break,
            Err(ReadError::Io(e)) => {
                if !shared.transport.is_closed() {
                    error!(error = %e, "Control socket read failed");
                    shared.notify_error(ErrorCode::SOCKET_READ_ERROR, e.to_string());
                }
                break;
            }
        }
    }
    debug!("Control reader ended");
}

fn read_command(shared: &Shared) -> std::result::Result<(), ReadError> {
    let transport = &shared.transport;
    let command = transport.read_i32_be()?;

    match command {
        code::CONNECT_SUCCESS => {
            let result = transport.read_i32_be()?;
            let max_packet_count = transport.read_u8()?;
            info!(result, max_packet_count, "<< connect success");
            if result < 0 {
                error!(result, "Server refused the session");
                shared.notify_error(ErrorCode::SOCKET_READ_ERROR, result.to_string());
                return Ok(());
            }
            shared.set_state(ControlState::Ready);
            (shared.listener)(ControlEvent::SessionConnected { max_packet_count });
        }
        code::CONNECT_FAILURE => {
            let result = transport.read_i32_be()?;
            let max_packet_count = transport.read_u8()?;
            info!(result, max_packet_count, "<< connect failure");
            let error_code =
                if result < 0 { ErrorCode::SOCKET_READ_ERROR } else { ErrorCode::from_vcs(code::CONNECT_FAILURE) };
            shared.notify_error(error_code, result.to_string());
        }
        code::APP_READY => {
            let size = transport.read_i32_be()?;
            let body = if size > 0 { transport.read_bytes(size as usize)? } else { Vec::new() };
            let checksum = transport.read_i32_be()?;
            info!(size, checksum, "<< app ready");
            if shared.wire_dump {
                trace!(body = %hex_dump(&body, 64), "App ready body");
            }
            (shared.listener)(ControlEvent::AppReady);
        }
        code::XML_INBOUND => {
            if let Some(xml) = read_body(transport)? {
                info!(len = xml.len(), "<< XML command");
                trace!(%xml, "XML command body");
                (shared.listener)(ControlEvent::Xml(xml));
            }
        }
        code::JSON_INBOUND => {
            if let Some(json) = read_body(transport)? {
                info!(len = json.len(), "<< JSON command");
                trace!(%json, "JSON command body");
                (shared.listener)(ControlEvent::Json(json));
            }
        }
        code::KEEP_ALIVE_ACK => {
            debug!("<< keep-alive ack");
            shared.timers.cancel(CONTROL_KEEP_ALIVE);
        }
        code::ERROR_REPORT => {
            let body_size = transport.read_i32_be()?;
            let result = transport.read_i32_be()?;
            let reserved = transport.read_i32_be()?;
            info!(body_size, result, reserved, "<< error report");
            if result != 0 {
                shared.notify_error(ErrorCode::from_vcs(code::ERROR_REPORT), result.to_string());
            }
        }
        other => {
            warn!(command = other, "<< unknown control command");
        }
    }
    Ok(())
}

fn read_body(transport: &TcpTransport) -> std::result::Result<Option<String>, ReadError> {
    let size = transport.read_i32_be()?;
    if size <= 0 {
        debug!(size, "Empty command body");
        return Ok(None);
    }
    transport.read_string(size as usize).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakePeer, FakeVcsServer, connect_success};
    use crate::wire::CommandWriter;
    use std::sync::mpsc;

    struct Harness {
        _runtime: tokio::runtime::Runtime,
        channel: ControlChannel,
        peer: FakePeer,
        events: mpsc::Receiver<ControlEvent>,
    }

    impl Harness {
        fn next_event(&self) -> ControlEvent {
            self.events.recv_timeout(Duration::from_secs(3)).expect("control event")
        }
    }

    fn connect(start_command: &str) -> Harness {
        let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(1).enable_time().build().unwrap();
        let server = FakeVcsServer::bind().unwrap();
        let config = ControlConfig {
            host: server.host().to_string(),
            port: server.port(),
            transport: TransportOptions { read_timeout: Duration::from_millis(50), ..TransportOptions::default() },
            keep_alive_timeout: Duration::from_millis(100),
            disconnect_grace: Duration::from_millis(500),
            wire_dump: true,
        };
        let (tx, events) = mpsc::channel();
        let listener: Listener<ControlEvent> = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let timers = TimerService::new(runtime.handle().clone());
        let channel = ControlChannel::connect(&config, "aa:bb", start_command, timers, listener).unwrap();
        let peer = server.accept().unwrap();
        Harness { _runtime: runtime, channel, peer, events }
    }

    fn handshake(harness: &mut Harness) {
        let (device, status) = harness.peer.read_start_app().unwrap();
        assert_eq!(device, "{aa:bb}");
        assert_eq!(status, "<INTERFACE/>");
        harness.peer.send(&connect_success(0, 4)).unwrap();
        assert_eq!(harness.next_event(), ControlEvent::SessionConnected { max_packet_count: 4 });
        assert_eq!(harness.channel.state(), ControlState::Ready);
    }

    #[test]
    fn handshake_and_inbound_commands() {
        let mut harness = connect("<INTERFACE/>");
        handshake(&mut harness);

        let app_ready = CommandWriter::command(code::APP_READY).string("ok").int(77).finish();
        harness.peer.send(&app_ready).unwrap();
        assert_eq!(harness.next_event(), ControlEvent::AppReady);

        harness.peer.send(&CommandWriter::command(code::XML_INBOUND).string("<a/>").finish()).unwrap();
        assert_eq!(harness.next_event(), ControlEvent::Xml("<a/>".into()));

        // Empty bodies are consumed silently.
        harness.peer.send(&CommandWriter::command(code::XML_INBOUND).int(0).finish()).unwrap();
        harness.peer.send(&CommandWriter::command(code::JSON_INBOUND).string("{}").finish()).unwrap();
        assert_eq!(harness.next_event(), ControlEvent::Json("{}".into()));
    }

    #[test]
    fn connect_failure_maps_into_vcs_band() {
        let mut harness = connect("<INTERFACE/>");
        harness.peer.read_start_app().unwrap();
        harness.peer.send(&CommandWriter::command(code::CONNECT_FAILURE).int(3).byte(0).finish()).unwrap();

        match harness.next_event() {
            ControlEvent::Error { code, message } => {
                assert_eq!(code, ErrorCode(42002));
                assert_eq!(message, "3");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn negative_handshake_result_is_a_read_error() {
        let mut harness = connect("<INTERFACE/>");
        harness.peer.read_start_app().unwrap();
        harness.peer.send(&connect_success(-1, 4)).unwrap();

        assert_eq!(
            harness.next_event(),
            ControlEvent::Error { code: ErrorCode::SOCKET_READ_ERROR, message: "-1".into() }
        );
        assert_ne!(harness.channel.state(), ControlState::Ready);
        assert!(harness.events.recv_timeout(Duration::from_millis(200)).is_err(), "session must not connect");
    }

    #[test]
    fn negative_connect_failure_result_is_a_read_error() {
        let mut harness = connect("<INTERFACE/>");
        harness.peer.read_start_app().unwrap();
        harness.peer.send(&CommandWriter::command(code::CONNECT_FAILURE).int(-5).byte(0).finish()).unwrap();

        assert_eq!(
            harness.next_event(),
            ControlEvent::Error { code: ErrorCode::SOCKET_READ_ERROR, message: "-5".into() }
        );
    }

    #[test]
    fn error_report_with_zero_result_is_ignored() {
        let mut harness = connect("<INTERFACE/>");
        handshake(&mut harness);

        harness.peer.send(&CommandWriter::command(code::ERROR_REPORT).int(8).int(0).int(0).finish()).unwrap();
        harness.peer.send(&CommandWriter::command(code::ERROR_REPORT).int(8).int(12).int(0).finish()).unwrap();
        assert_eq!(harness.next_event(), ControlEvent::Error { code: ErrorCode(47001), message: "12".into() });
    }

    #[test]
    fn unacknowledged_key_up_times_out() {
        let mut harness = connect("<INTERFACE/>");
        handshake(&mut harness);

        assert!(harness.channel.request_key_up(keys::host::KEYCODE_DPAD_CENTER));
        assert_eq!(harness.peer.read_i32().unwrap(), code::KEY_UP);
        assert_eq!(harness.peer.read_i32().unwrap(), 28);
        assert_eq!(harness.peer.read_i32().unwrap(), 0);

        assert_eq!(
            harness.next_event(),
            ControlEvent::Error { code: ErrorCode::VCS_KEY_RESPONSE_TIMEOUT, message: String::new() }
        );
    }

    #[test]
    fn acknowledged_key_up_cancels_timer() {
        let mut harness = connect("<INTERFACE/>");
        handshake(&mut harness);

        assert!(harness.channel.request_key_up(keys::host::KEYCODE_BACK));
        harness.peer.send(&CommandWriter::command(code::KEEP_ALIVE_ACK).finish()).unwrap();
        assert!(harness.events.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn unmapped_keys_send_nothing() {
        let mut harness = connect("<INTERFACE/>");
        handshake(&mut harness);

        assert!(!harness.channel.request_key_down(0));
        assert!(!harness.channel.request_key_up(9999));
        assert!(harness.channel.send_keep_alive());
        assert_eq!(harness.peer.read_i32().unwrap(), code::KEY_DOWN);
        assert_eq!(harness.peer.read_i32().unwrap(), keys::KEEP_ALIVE_KEY_CODE);
    }

    #[test]
    fn disconnect_sends_command_and_is_idempotent() {
        let mut harness = connect("<INTERFACE/>");
        handshake(&mut harness);

        harness.channel.disconnect();
        harness.channel.disconnect();
        assert_eq!(harness.channel.state(), ControlState::Disconnected);
        assert!(!harness.channel.send_xml("<late/>"));

        assert_eq!(harness.peer.read_i32().unwrap(), code::DISCONNECT);
        assert_eq!(harness.peer.read_string().unwrap(), "{aa:bb}");
        // Local close is not reported as an error.
        assert!(harness.events.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn peer_close_reports_socket_read_error() {
        let mut harness = connect("<INTERFACE/>");
        handshake(&mut harness);
        drop(harness.peer);

        match harness.events.recv_timeout(Duration::from_secs(3)).unwrap() {
            ControlEvent::Error { code, .. } => assert_eq!(code, ErrorCode::SOCKET_READ_ERROR),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
