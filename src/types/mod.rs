//! Core types shared across the engine and exposed to the host application.
//!
//! - [`MediaKind`] names the two media channels
//! - [`PlayerStatus`] is the externally visible session state
//! - [`PlayerEvent`] is the tagged union delivered on the player's event stream
//! - [`SessionInfo`] and [`ServerEndpoint`] describe the resolved session

mod event;
mod session;
mod status;

pub use event::{Listener, LogKind, PlayerEvent};
pub use session::{ServerEndpoint, SessionInfo};
pub use status::{MediaKind, PlayerStatus};
