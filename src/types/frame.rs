//! Raw chunks and frames flowing between transport, framer and decoder

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Bytes as received from the transport.
///
/// One datagram for UDP, one read for TCP. Cloning is cheap; the payload is
/// reference counted.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub bytes: Bytes,
    /// Local arrival time
    pub arrival: Instant,
    /// Sender address, when the transport knows it
    pub source: Option<SocketAddr>,
}

impl RawChunk {
    pub fn new(bytes: impl Into<Bytes>, arrival: Instant, source: Option<SocketAddr>) -> Self {
        Self { bytes: bytes.into(), arrival, source }
    }
}

/// Framing used on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Native 67-byte Stype HF datagrams
    #[default]
    Hf,
    /// Length-prefixed, versioned envelope frames
    Envelope,
}

/// Envelope protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const V1: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
    pub const V2: ProtocolVersion = ProtocolVersion { major: 2, minor: 0 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// One complete, checksum-validated protocol unit.
///
/// For HF frames `payload` is the whole 67-byte packet. For envelope frames
/// it is the bytes between the length field and the checksum.
#[derive(Debug, Clone)]
pub struct Frame {
    pub format: WireFormat,
    pub version: Option<ProtocolVersion>,
    pub payload: Bytes,
    pub source: Option<SocketAddr>,
    /// Arrival time of the chunk that completed this frame
    pub arrival: Instant,
}
