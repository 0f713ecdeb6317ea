//! Wire protocol: framing, decoding and encoding.
//!
//! Two framings are understood:
//!
//! - **HF**: the rig's native 67-byte datagram. One camera per sender, no
//!   subject id on the wire.
//! - **Envelope**: a length-prefixed, versioned wrapper for links that carry
//!   several subjects or message kinds, or that run over TCP.
//!
//! ```text
//! HF        [0x0F][cmd][timecode x3][packet][15 x f32][checksum]
//! Envelope  [0xA5 0x5A][major][minor][len u16][tag][subject u16][body ...][checksum]
//! ```
//!
//! All multi-byte values are little-endian. Checksums are the wrapping byte
//! sum of the bytes they cover.

pub mod decoder;
pub mod encoder;
pub mod framer;

pub use decoder::Decoder;
pub use encoder::{encode_envelope, encode_envelope_raw, encode_hf};
pub use framer::{Framer, FramerStats};

use std::ops::RangeInclusive;

/// First byte of every HF packet.
pub const HF_HEADER: u8 = 0x0F;
/// Size of an HF packet including header and checksum.
pub const HF_PACKET_SIZE: usize = 67;
/// Number of f32 fields in an HF packet.
pub const HF_FLOAT_COUNT: usize = 15;
/// HF body: command, timecode, packet number, floats.
pub const HF_BODY_SIZE: usize = 1 + 3 + 1 + HF_FLOAT_COUNT * 4;

/// Envelope sync marker.
pub const ENVELOPE_SYNC: [u8; 2] = [0xA5, 0x5A];
/// Sync, version and length.
pub const ENVELOPE_HEADER_SIZE: usize = 6;
/// Largest payload an envelope frame may declare.
pub const MAX_ENVELOPE_PAYLOAD: usize = 1024;
/// Tag and subject id present in every envelope payload.
pub const MIN_ENVELOPE_PAYLOAD: usize = 3;

/// Envelope major versions this build decodes.
pub const SUPPORTED_MAJOR_VERSIONS: RangeInclusive<u8> = 1..=2;

/// Envelope message tags.
pub mod tag {
    pub const TRACKING: u8 = 0x01;
    pub const LENS: u8 = 0x02;
    pub const CAMERA: u8 = 0x03;
    pub const SUBJECT_ANNOUNCE: u8 = 0x10;
    pub const HEARTBEAT: u8 = 0x11;
    pub const STATUS: u8 = 0x7F;
}

/// Wrapping byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Human-readable list of supported major versions for errors.
pub(crate) fn supported_versions() -> String {
    format!("{}-{}", SUPPORTED_MAJOR_VERSIONS.start(), SUPPORTED_MAJOR_VERSIONS.end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_wraps() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[0x0F; 17]), (0x0F * 17 % 256) as u8);
    }

    #[test]
    fn hf_layout_adds_up() {
        assert_eq!(1 + HF_BODY_SIZE + 1, HF_PACKET_SIZE);
    }
}
