//! Client engine for the VCS cloud-streaming protocol.
//!
//! A VCS server runs an application remotely and streams its video, audio and an
//! optional alpha overlay to a thin client, which sends key input back. This crate
//! implements the client side of that protocol.
//!
//! # Features
//!
//! - **Control channel**: start-app handshake, key events, keep-alive, XML/JSON commands
//! - **Streaming channels**: framed video and audio intake into bounded media buffers
//! - **Alpha overlay**: ZIP/RLE/LZ4 plane decompression with pooled buffers
//! - **Session routing**: routing-service lookup with public-ip and community resolution
//! - **Session lifecycle**: one state machine reporting through a typed event stream
//!
//! Decoding and presentation stay with the host: it supplies a
//! [`MediaBackend`](decoder::MediaBackend) that creates platform codecs.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use vcs_client::{AppDescriptor, EngineConfig, PlayerEvent, VcsPlayer};
//! # fn backend() -> Arc<dyn vcs_client::decoder::MediaBackend> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let player = VcsPlayer::new(EngineConfig::default(), backend())?;
//!     let mut events = player.events();
//!
//!     let app = AppDescriptor::direct("00:11:22:33:44:55", "10.0.0.1", 8100);
//!     let start = r#"<INTERFACE version="3"><COMMAND>StartApp</COMMAND></INTERFACE>"#;
//!     let player = tokio::task::spawn_blocking(move || {
//!         player.start(app, start);
//!         player
//!     })
//!     .await?;
//!
//!     while let Some(event) = events.next().await {
//!         if let PlayerEvent::Error { code, message } = &event {
//!             eprintln!("{}: {}", code, message);
//!         }
//!     }
//!     drop(player);
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
pub mod types;

// Wire protocol and transport
pub mod control;
pub mod streaming;
pub mod transport;
pub mod wire;

// Media path
pub mod alpha;
pub mod decoder;
pub mod media;
pub mod quality;

// Session
pub mod player;
pub mod router;
pub mod timer;

// Ambient
pub mod config;
pub mod logging;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Core exports
pub use error::*;
pub use types::*;

pub use config::{AppDescriptor, EngineConfig, InterfaceFormat, VideoCodec};
pub use logging::init_tracing;
pub use player::VcsPlayer;
