//! Tracing setup and small logging helpers.

use std::fmt::Write as _;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use crate::{Result, VcsError};

/// Logging section of [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set.
    pub level: String,
    /// Include file and line information.
    pub file_info: bool,
    /// Log span open/close events.
    pub log_spans: bool,
    /// Dump raw wire bytes at trace level.
    pub wire_dump: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file_info: false, log_spans: false, wire_dump: false }
    }
}

/// Installs a global fmt subscriber.
///
/// Safe to call more than once: when a subscriber is already installed this is a
/// no-op.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| VcsError::config_error(format!("invalid log level '{}': {}", config.level, e)))?,
    };

    let span_events = if config.log_spans { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .try_init();
    Ok(())
}

/// Short hex identifier used to correlate the records of one session.
pub fn new_log_id() -> String {
    format!("{:x}", Utc::now().timestamp_millis())
}

/// Space-separated hex rendering, truncated after `limit` bytes.
pub fn hex_dump(data: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(data.len().min(limit) * 3 + 8);
    for (i, byte) in data.iter().take(limit).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    if data.len() > limit {
        let _ = write!(out, " .. (+{} bytes)", data.len() - limit);
    }
    out
}
