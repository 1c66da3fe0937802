//! Session status and media kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally visible status of the player.
///
/// `TimedOut` is only ever published as a momentary signal. The session keeps
/// whatever status it had when the remote side reported the expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlayerStatus {
    #[default]
    Stopped,
    Loading,
    Playing,
    Paused,
    TimedOut,
}

impl PlayerStatus {
    /// Numeric status value used by host bindings.
    pub fn code(self) -> i32 {
        match self {
            PlayerStatus::Stopped => 0,
            PlayerStatus::Loading => 1,
            PlayerStatus::Playing => 2,
            PlayerStatus::Paused => 3,
            PlayerStatus::TimedOut => 4,
        }
    }
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerStatus::Stopped => "stopped",
            PlayerStatus::Loading => "loading",
            PlayerStatus::Playing => "playing",
            PlayerStatus::Paused => "paused",
            PlayerStatus::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// One of the two media channels of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Stream selector sent in the stream-info request.
    pub fn stream_selector(self) -> i32 {
        match self {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}
