//! Events delivered to the host application.

use std::sync::Arc;

use serde::Serialize;

use super::{PlayerStatus, SessionInfo};
use crate::error::ErrorCode;

/// Event callback shared with engine worker threads. Must not block.
pub type Listener<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Category of a log record forwarded to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogKind {
    /// Structured quality-system record (JSON).
    Qsm,
}

/// Everything the player reports to its host, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// The session status changed. `TimedOut` is published here but never retained.
    StatusChanged(PlayerStatus),
    /// An error or informational pseudo-error.
    Error { code: ErrorCode, message: String },
    /// An application command (XML or JSON) received from the server.
    Command(String),
    /// The session is established; sent right before the switch to `Playing`.
    SessionInfo(SessionInfo),
    /// A log record for offline analysis.
    Log { kind: LogKind, data: String },
}
