//! Subject identity and packet-number arithmetic

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol-level identifier of a tracked camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(transparent)]
pub struct SubjectId(pub u16);

impl SubjectId {
    /// Create a subject id from its raw value.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the raw u16 value.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for SubjectId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Packets elapsed going from packet number `from` to `to`, accounting for the
/// 255 → 0 wrap. Equal numbers count as a full lap (256).
pub fn packets_elapsed(from: u8, to: u8) -> u32 {
    match to.wrapping_sub(from) {
        0 => 256,
        step => u32::from(step),
    }
}

/// Compare 8-bit packet numbers with wraparound using the half-range rule.
/// Returns true if `a` is considered newer than `b`.
pub fn packet_after(a: u8, b: u8) -> bool {
    if a == b {
        return false;
    }
    a.wrapping_sub(b) < 0x80
}
