//! Error types for the streaming engine.
//!
//! Two layers of error information exist side by side:
//!
//! - [`VcsError`] is the Rust error returned from fallible operations inside the
//!   engine (socket I/O, frame parsing, decompression, routing lookups).
//! - [`ErrorCode`] is the numeric code surfaced to the host application through
//!   [`PlayerEvent::Error`](crate::PlayerEvent::Error). Every [`VcsError`] maps to one.
//!
//! ## Error code bands
//!
//! - `20000..30000`: routing (CSR) errors, remapped from the raw CSR result code
//! - `40000..50000`: session and connection errors, including codes reported by the
//!   VCS server itself
//! - `50000..`: socket-level errors
//! - `90000` / `90001`: informational pseudo-errors that never end a session
//!
//! ```rust
//! use vcs_client::{ErrorCode, VcsError};
//!
//! let error = VcsError::connection_failed("control handshake refused");
//! assert_eq!(error.code(), ErrorCode::VCS_CONNECTION_ERROR);
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MediaKind;

/// Result type alias for engine operations.
pub type Result<T, E = VcsError> = std::result::Result<T, E>;

/// Numeric error code reported to the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Gateway emergency mode. Passed through unchanged and never logged.
    pub const UI_EMERGENCY_MODE: ErrorCode = ErrorCode(8301);

    pub const CSR_ERROR_START: ErrorCode = ErrorCode(20000);
    pub const ICS_ERROR_START: ErrorCode = ErrorCode(30000);

    pub const VCS_ERROR_START: ErrorCode = ErrorCode(40000);
    pub const VCS_CONNECTION_ERROR: ErrorCode = ErrorCode(40003);
    pub const VCS_FRAME_RECEIVE_ERROR: ErrorCode = ErrorCode(40004);
    pub const VCS_KEY_RESPONSE_TIMEOUT: ErrorCode = ErrorCode(40005);
    pub const DECODER_CREATE_ERROR: ErrorCode = ErrorCode(40007);
    pub const DECODER_MEDIACODEC_ERROR: ErrorCode = ErrorCode(40008);

    pub const SOCKET_READ_ERROR: ErrorCode = ErrorCode(50001);
    pub const SOCKET_SEND_ERROR: ErrorCode = ErrorCode(50002);

    /// Informational: the first decoded video frame reached the renderer.
    pub const FIRST_VIDEO_FRAME_RECEIVED: ErrorCode = ErrorCode(90000);
    /// Informational: a media buffer filled up and was reset in place.
    pub const MEDIA_BUFFER_FULL: ErrorCode = ErrorCode(90001);

    /// Raw numeric value.
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Maps a code reported by the VCS server into the VCS band.
    pub fn from_vcs(raw: i32) -> Self {
        if raw < Self::VCS_ERROR_START.0 { ErrorCode(raw + Self::VCS_ERROR_START.0) } else { ErrorCode(raw) }
    }

    /// Maps a non-zero CSR route result code into the CSR band.
    ///
    /// Zero, the emergency-mode code and codes already at or above the CSR band
    /// start are returned unchanged.
    pub fn from_csr(raw: i32) -> Self {
        if raw != 0 && raw != Self::UI_EMERGENCY_MODE.0 && raw < Self::CSR_ERROR_START.0 {
            ErrorCode(raw + Self::CSR_ERROR_START.0)
        } else {
            ErrorCode(raw)
        }
    }

    /// Informational codes are reported to the host but never end a session.
    pub fn is_informational(self) -> bool {
        self == Self::FIRST_VIDEO_FRAME_RECEIVED || self == Self::MEDIA_BUFFER_FULL
    }

    /// Short tag used by the quality log records.
    pub fn description(self) -> &'static str {
        if self >= Self::CSR_ERROR_START && self < Self::ICS_ERROR_START {
            return "csr_server_error";
        }
        if self >= Self::VCS_ERROR_START {
            return match self {
                Self::VCS_CONNECTION_ERROR => "connection_error",
                Self::VCS_FRAME_RECEIVE_ERROR => "stream_error",
                Self::VCS_KEY_RESPONSE_TIMEOUT => "alive_error",
                Self::DECODER_CREATE_ERROR => "decoder_error",
                Self::DECODER_MEDIACODEC_ERROR => "mediacodec_error",
                Self::SOCKET_READ_ERROR => "socket_read_error",
                Self::SOCKET_SEND_ERROR => "socket_send_error",
                _ => "vcs_server_error",
            };
        }
        "unknown_error"
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ErrorCode {
    fn from(value: i32) -> Self {
        ErrorCode(value)
    }
}

/// Which side of a decoder failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderFailure {
    /// The backend could not create or configure the codec.
    Create,
    /// The codec failed while running.
    Runtime,
}

/// Main error type for engine operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum VcsError {
    #[error("Failed to connect to VCS server: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Socket read failed")]
    SocketRead {
        #[source]
        source: std::io::Error,
    },

    #[error("Socket send failed")]
    SocketSend {
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol violation on {media} channel: {details}")]
    Protocol { media: MediaKind, details: String },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Decoder error ({failure:?}) for {media}: {reason}")]
    Decoder {
        media: MediaKind,
        failure: DecoderFailure,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Alpha decompression failed for tag {tag}: {details}")]
    Decompression { tag: i32, details: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("{media} buffer is full")]
    BufferFull { media: MediaKind },

    #[error("Routing lookup failed with code {code}: {reason}")]
    Routing { code: ErrorCode, reason: String },

    #[error("VCS server reported error {code}")]
    Remote { code: ErrorCode },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Configuration file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VcsError {
    /// Numeric code surfaced to the host for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            VcsError::Connection { .. } => ErrorCode::VCS_CONNECTION_ERROR,
            VcsError::SocketRead { .. } => ErrorCode::SOCKET_READ_ERROR,
            VcsError::SocketSend { .. } => ErrorCode::SOCKET_SEND_ERROR,
            VcsError::Protocol { .. } => ErrorCode::VCS_FRAME_RECEIVE_ERROR,
            VcsError::Parse { .. } => ErrorCode::VCS_FRAME_RECEIVE_ERROR,
            VcsError::Decoder { failure: DecoderFailure::Create, .. } => ErrorCode::DECODER_CREATE_ERROR,
            VcsError::Decoder { failure: DecoderFailure::Runtime, .. } => ErrorCode::DECODER_MEDIACODEC_ERROR,
            VcsError::Decompression { .. } => ErrorCode::VCS_FRAME_RECEIVE_ERROR,
            VcsError::Timeout { .. } => ErrorCode::VCS_KEY_RESPONSE_TIMEOUT,
            VcsError::BufferFull { .. } => ErrorCode::MEDIA_BUFFER_FULL,
            VcsError::Routing { code, .. } => *code,
            VcsError::Remote { code } => *code,
            VcsError::Config { .. } => ErrorCode::VCS_CONNECTION_ERROR,
            VcsError::File { .. } => ErrorCode::VCS_CONNECTION_ERROR,
        }
    }

    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            VcsError::Connection { .. } => true,
            VcsError::Timeout { .. } => true,
            VcsError::BufferFull { .. } => true,
            VcsError::Routing { code, .. } => *code == ErrorCode::VCS_CONNECTION_ERROR,
            VcsError::SocketRead { .. } => false,
            VcsError::SocketSend { .. } => false,
            VcsError::Protocol { .. } => false,
            VcsError::Parse { .. } => false,
            VcsError::Decoder { .. } => false,
            VcsError::Decompression { .. } => false,
            VcsError::Remote { .. } => false,
            VcsError::Config { .. } => false,
            VcsError::File { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            VcsError::Connection { .. } => vec![
                "Check network connectivity to the VCS server",
                "Verify the server address resolved by the routing service",
                "Start a new session",
            ],
            VcsError::SocketRead { .. } | VcsError::SocketSend { .. } => vec![
                "Check network stability",
                "Start a new session",
            ],
            VcsError::Protocol { .. } | VcsError::Parse { .. } => vec![
                "Verify client and server protocol versions match",
                "Check the configured maximum frame sizes",
            ],
            VcsError::Decoder { .. } => vec![
                "Check that the platform supports the configured video codec",
                "Release other decoder instances",
                "Restart the player",
            ],
            VcsError::Decompression { .. } => vec![
                "Verify the configured alpha compression type",
                "Check alpha frame integrity",
            ],
            VcsError::Timeout { .. } => vec![
                "Check network latency to the VCS server",
                "Increase the configured timeout",
            ],
            VcsError::BufferFull { .. } => vec![
                "Check decoder throughput",
                "Increase media buffer capacity",
            ],
            VcsError::Routing { .. } => vec![
                "Check the routing service URL",
                "Verify authentication values in the app descriptor",
                "Retry the route request",
            ],
            VcsError::Remote { .. } => vec![
                "Check the server-side session state",
                "Start a new session",
            ],
            VcsError::Config { .. } => vec![
                "Check the app descriptor fields",
                "Fix configuration values and restart",
            ],
            VcsError::File { .. } => vec![
                "Check file exists and is readable",
                "Check file permissions",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        VcsError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        VcsError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for parse errors.
    pub fn parse_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        VcsError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for protocol violations on a media channel.
    pub fn protocol_error(media: MediaKind, details: impl Into<String>) -> Self {
        VcsError::Protocol { media, details: details.into() }
    }

    /// Helper constructor for decoder failures.
    pub fn decoder_error(media: MediaKind, failure: DecoderFailure, reason: impl Into<String>) -> Self {
        VcsError::Decoder { media, failure, reason: reason.into(), source: None }
    }

    /// Helper constructor for alpha decompression failures.
    pub fn decompression_error(tag: i32, details: impl Into<String>) -> Self {
        VcsError::Decompression { tag, details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(reason: impl Into<String>) -> Self {
        VcsError::Config { reason: reason.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        VcsError::File { path, source }
    }
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        VcsError::SocketRead { source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn server_codes_always_land_in_vcs_band(raw in 0i32..40000) {
            let code = ErrorCode::from_vcs(raw);
            prop_assert!(code >= ErrorCode::VCS_ERROR_START);
            prop_assert_eq!(code.value(), raw + 40000);
          }

          #[test]
          fn codes_already_in_vcs_band_are_unchanged(raw in 40000i32..100000) {
            prop_assert_eq!(ErrorCode::from_vcs(raw).value(), raw);
          }

          #[test]
          fn csr_codes_below_band_are_shifted(raw in 1i32..20000) {
            let code = ErrorCode::from_csr(raw);
            if raw == ErrorCode::UI_EMERGENCY_MODE.value() {
              prop_assert_eq!(code, ErrorCode::UI_EMERGENCY_MODE);
            } else {
              prop_assert_eq!(code.value(), raw + 20000);
              prop_assert_eq!(code.description(), "csr_server_error");
            }
          }

          #[test]
          fn error_messages_contain_their_context(reason in "[a-z ]{1,40}", details in "[a-z ]{1,40}") {
            let connection = VcsError::connection_failed(reason.clone());
            prop_assert!(connection.to_string().contains(&reason));

            let parse = VcsError::parse_error("es frame", details.clone());
            prop_assert!(parse.to_string().contains(&details));
            prop_assert!(parse.to_string().contains("es frame"));
          }
        }
    }

    #[test]
    fn descriptions_follow_code_bands() {
        assert_eq!(ErrorCode(20100).description(), "csr_server_error");
        assert_eq!(ErrorCode::VCS_CONNECTION_ERROR.description(), "connection_error");
        assert_eq!(ErrorCode::VCS_FRAME_RECEIVE_ERROR.description(), "stream_error");
        assert_eq!(ErrorCode::VCS_KEY_RESPONSE_TIMEOUT.description(), "alive_error");
        assert_eq!(ErrorCode::DECODER_CREATE_ERROR.description(), "decoder_error");
        assert_eq!(ErrorCode::DECODER_MEDIACODEC_ERROR.description(), "mediacodec_error");
        assert_eq!(ErrorCode::SOCKET_READ_ERROR.description(), "socket_read_error");
        assert_eq!(ErrorCode::SOCKET_SEND_ERROR.description(), "socket_send_error");
        assert_eq!(ErrorCode(42002).description(), "vcs_server_error");
        assert_eq!(ErrorCode(30001).description(), "unknown_error");
        assert_eq!(ErrorCode(100).description(), "unknown_error");
    }

    #[test]
    fn only_first_frame_and_buffer_full_are_informational() {
        assert!(ErrorCode::FIRST_VIDEO_FRAME_RECEIVED.is_informational());
        assert!(ErrorCode::MEDIA_BUFFER_FULL.is_informational());
        assert!(!ErrorCode::VCS_CONNECTION_ERROR.is_informational());
        assert!(!ErrorCode::UI_EMERGENCY_MODE.is_informational());
    }

    #[test]
    fn csr_zero_and_emergency_are_not_remapped() {
        assert_eq!(ErrorCode::from_csr(0), ErrorCode(0));
        assert_eq!(ErrorCode::from_csr(8301), ErrorCode::UI_EMERGENCY_MODE);
        assert_eq!(ErrorCode::from_csr(40003), ErrorCode::VCS_CONNECTION_ERROR);
    }

    #[test]
    fn errors_map_to_host_codes() {
        let io = || std::io::Error::other("boom");
        assert_eq!(VcsError::SocketRead { source: io() }.code(), ErrorCode::SOCKET_READ_ERROR);
        assert_eq!(VcsError::SocketSend { source: io() }.code(), ErrorCode::SOCKET_SEND_ERROR);
        assert_eq!(
            VcsError::decoder_error(MediaKind::Video, DecoderFailure::Create, "no codec").code(),
            ErrorCode::DECODER_CREATE_ERROR
        );
        assert_eq!(
            VcsError::decoder_error(MediaKind::Audio, DecoderFailure::Runtime, "crashed").code(),
            ErrorCode::DECODER_MEDIACODEC_ERROR
        );
        assert_eq!(
            VcsError::protocol_error(MediaKind::Video, "oversize").code(),
            ErrorCode::VCS_FRAME_RECEIVE_ERROR
        );
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<VcsError>();

        let error = VcsError::connection_failed("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn recovery_methods_work() {
        let connection_error = VcsError::connection_failed("test");
        let parse_error = VcsError::parse_error("header", "short");

        assert!(connection_error.is_retryable());
        assert!(!parse_error.is_retryable());

        for suggestion in connection_error.recovery_suggestions() {
            assert!(suggestion.len() > 5);
        }
        assert!(!parse_error.recovery_suggestions().is_empty());
    }

    #[test]
    fn io_errors_convert_to_socket_reads() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let error: VcsError = io_err.into();
        assert!(matches!(error, VcsError::SocketRead { .. }));
    }
}
