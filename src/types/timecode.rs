//! SMPTE timecode as carried by the HF protocol
//!
//! The rig packs its timecode into three bytes as a little-endian bitfield:
//!
//! ```text
//! bit  0..7   frames   (7 bits, 0..=127)
//! bit  7..13  seconds  (6 bits)
//! bit 13..19  minutes  (6 bits)
//! bit 19..24  hours    (5 bits)
//! ```
//!
//! The 7-bit frames field caps usable frame rates at 127.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest frame rate the packed frames field can express.
pub const MAX_TIMECODE_RATE: u32 = 127;

/// Non-drop-frame timecode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
}

impl Timecode {
    /// Size of the packed wire representation.
    pub const WIRE_SIZE: usize = 3;

    /// Create a timecode from its components.
    pub const fn new(hours: u8, minutes: u8, seconds: u8, frames: u8) -> Self {
        Self { hours, minutes, seconds, frames }
    }

    /// Unpack the three-byte wire bitfield.
    pub fn from_wire(bytes: [u8; 3]) -> Self {
        let packed = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
        Self {
            frames: (packed & 0x7F) as u8,
            seconds: ((packed >> 7) & 0x3F) as u8,
            minutes: ((packed >> 13) & 0x3F) as u8,
            hours: ((packed >> 19) & 0x1F) as u8,
        }
    }

    /// Pack into the three-byte wire bitfield. Out-of-range components are masked.
    pub fn to_wire(self) -> [u8; 3] {
        let packed = u32::from(self.frames & 0x7F)
            | u32::from(self.seconds & 0x3F) << 7
            | u32::from(self.minutes & 0x3F) << 13
            | u32::from(self.hours & 0x1F) << 19;
        [packed as u8, (packed >> 8) as u8, (packed >> 16) as u8]
    }

    /// Absolute frame number at `rate` frames per second.
    pub fn to_frame_number(self, rate: u32) -> i64 {
        let whole_seconds =
            (i64::from(self.hours) * 60 + i64::from(self.minutes)) * 60 + i64::from(self.seconds);
        whole_seconds * i64::from(rate) + i64::from(self.frames)
    }

    /// Seconds since midnight at `rate` frames per second.
    pub fn to_seconds(self, rate: u32) -> f64 {
        self.to_frame_number(rate) as f64 / f64::from(rate.max(1))
    }

    /// Build a timecode from an absolute frame number (wraps at 32 hours,
    /// the range of the hours field).
    pub fn from_frame_number(frame: i64, rate: u32) -> Self {
        let rate = i64::from(rate.max(1));
        let frames = frame.rem_euclid(rate);
        let total_seconds = frame.div_euclid(rate);
        Self {
            hours: total_seconds.div_euclid(3600).rem_euclid(32) as u8,
            minutes: total_seconds.div_euclid(60).rem_euclid(60) as u8,
            seconds: total_seconds.rem_euclid(60) as u8,
            frames: frames as u8,
        }
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds, self.frames)
    }
}

/// Frame number qualified by the rate it counts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct QualifiedFrameTime {
    pub frame: i64,
    pub rate: u32,
}

impl QualifiedFrameTime {
    pub fn new(frame: i64, rate: u32) -> Self {
        Self { frame, rate }
    }

    /// Frame time expressed in seconds.
    pub fn as_seconds(&self) -> f64 {
        self.frame as f64 / f64::from(self.rate.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unpacks_known_bitfield() {
        // 10:20:30:45
        let packed: u32 = 45 | 30 << 7 | 20 << 13 | 10 << 19;
        let bytes = [packed as u8, (packed >> 8) as u8, (packed >> 16) as u8];
        let tc = Timecode::from_wire(bytes);
        assert_eq!(tc, Timecode::new(10, 20, 30, 45));
        assert_eq!(tc.to_string(), "10:20:30:45");
    }

    #[test]
    fn frame_numbers() {
        let tc = Timecode::new(1, 0, 2, 5);
        assert_eq!(tc.to_frame_number(25), (3600 + 2) * 25 + 5);
        assert_eq!(Timecode::from_frame_number(tc.to_frame_number(25), 25), tc);
        assert!((tc.to_seconds(25) - 3602.2).abs() < 1e-9);
    }

    #[test]
    fn qualified_frame_time_seconds() {
        let t = QualifiedFrameTime::new(150, 60);
        assert!((t.as_seconds() - 2.5).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn wire_packing_is_lossless_for_valid_fields(
            hours in 0u8..24, minutes in 0u8..60, seconds in 0u8..60, frames in 0u8..120
        ) {
            let tc = Timecode::new(hours, minutes, seconds, frames);
            prop_assert_eq!(Timecode::from_wire(tc.to_wire()), tc);
        }
    }
}
