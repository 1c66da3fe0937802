//! Resolved session details.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of the VCS server serving a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Session details reported to the host once the session is established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub server_ip: String,
    pub server_port: u16,
    pub so_code: String,
    pub public_ip: String,
    pub session_id: String,
}
