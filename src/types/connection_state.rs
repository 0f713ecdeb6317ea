//! Connection lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one tracking connection, observable by the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Socket open and receiving
    Connected,
    /// Link lost, retrying with backoff
    Reconnecting,
    /// Gave up; the connection must be reconfigured or recreated
    Faulted(String),
}

impl ConnectionState {
    /// Whether the ingestion task is still trying to deliver data.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Faulted(reason) => write!(f, "faulted: {}", reason),
        }
    }
}
