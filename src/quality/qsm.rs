//! Structured quality-system (QSM) log records.
//!
//! Records are JSON documents handed to the host through
//! [`PlayerEvent::Log`](crate::types::PlayerEvent::Log). The logger is owned by the
//! player; nothing here is global.

use std::time::Instant;

use chrono::Local;
use serde_json::{Map, Value, json};

use crate::error::ErrorCode;

const QUALITY_TRANS_TYPE: &str = "VCS_QUALITY";
const ERROR_TRANS_TYPE: &str = "VCS_ERROR";
const LOG_INFO_TYPE: &str = "Q2";
const LOG_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

/// Builds QSM records for one session.
#[derive(Debug, Clone)]
pub struct QsmLogger {
    version: String,
    started: Option<Instant>,
    server_ip: String,
    app_id: String,
}

impl Default for QsmLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl QsmLogger {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: None,
            server_ip: String::new(),
            app_id: String::new(),
        }
    }

    /// Clears session details and marks the session start.
    pub fn begin_session(&mut self, app_id: impl Into<String>) {
        self.started = Some(Instant::now());
        self.server_ip.clear();
        self.app_id = app_id.into();
    }

    pub fn set_server_ip(&mut self, server_ip: impl Into<String>) {
        self.server_ip = server_ip.into();
    }

    pub fn server_ip(&self) -> &str {
        &self.server_ip
    }

    /// Time to first frame, labelled with the host-supplied initiate type.
    pub fn initiate_time_log(&self, initiate_type: &str) -> String {
        let mut body = self.base_body();
        body.insert("initiate_time".into(), json!(self.elapsed_secs()));
        body.insert("initiate_type".into(), json!(initiate_type));
        envelope(QUALITY_TRANS_TYPE, "vcs_quality", body)
    }

    /// Jitter counts for the last reporting cycle. `None` when both are zero.
    pub fn quality_log(&self, video_errors: u64, audio_errors: u64) -> Option<String> {
        if video_errors == 0 && audio_errors == 0 {
            return None;
        }
        let mut body = self.base_body();
        if video_errors > 0 {
            body.insert("video_jitter".into(), json!(video_errors));
        }
        if audio_errors > 0 {
            body.insert("audio_jitter".into(), json!(audio_errors));
        }
        Some(envelope(QUALITY_TRANS_TYPE, "vcs_quality", body))
    }

    /// Error record. The code is rendered as `code` or `code:message`.
    pub fn error_log(&self, code: ErrorCode, message: Option<&str>) -> String {
        let error_code = match message {
            Some(message) if !message.is_empty() => format!("{}:{}", code, message),
            _ => code.to_string(),
        };
        let mut body = self.base_body();
        body.insert("vcs_use_time".into(), json!(self.elapsed_secs()));
        body.insert("error_code".into(), json!(error_code));
        body.insert("error_description".into(), json!(code.description()));
        envelope(ERROR_TRANS_TYPE, "vcs_error", body)
    }

    pub fn session_timeout_log(&self) -> String {
        let mut body = self.base_body();
        body.insert("vcs_use_time".into(), json!(self.elapsed_secs()));
        body.insert("session_timeout".into(), json!(true));
        envelope(ERROR_TRANS_TYPE, "vcs_error", body)
    }

    fn elapsed_secs(&self) -> f64 {
        self.started.map(|started| started.elapsed().as_millis() as f64 / 1000.0).unwrap_or(0.0)
    }

    fn base_body(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("vcs_version".into(), json!(self.version));
        body.insert("vcs_ip".into(), json!(self.server_ip));
        body.insert("vcs_app_id".into(), json!(self.app_id));
        body
    }
}

fn envelope(trans_type: &str, section: &str, body: Map<String, Value>) -> String {
    let mut log = Map::new();
    log.insert("log_info_type".into(), json!(LOG_INFO_TYPE));
    log.insert("log_time".into(), json!(Local::now().format(LOG_TIME_FORMAT).to_string()));
    log.insert(section.into(), Value::Object(body));
    json!({ "transType": trans_type, "log": log }).to_string()
}
