//! Packet-number ordering

use std::collections::VecDeque;

use crate::types::packet_after;

/// Missing packet numbers remembered for late-arrival accounting.
const MISSING_WINDOW: usize = 64;

/// How a packet number relates to the stream so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// First packet since creation or reset
    First,
    /// Newer than the last accepted packet; `skipped` numbers in between are missing
    Accept { skipped: u32 },
    /// Same number as the last accepted packet
    Duplicate,
    /// Older than the last accepted packet. `recovered` is set when it was
    /// one of the numbers previously counted as missing.
    OutOfOrder { recovered: bool },
}

/// Half-range ordering over 8-bit packet numbers, one per stream.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u8>,
    missing: VecDeque<u8>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    pub fn observe(&mut self, packet: u8) -> SequenceVerdict {
        let Some(last) = self.last else {
            self.last = Some(packet);
            return SequenceVerdict::First;
        };

        if packet == last {
            return SequenceVerdict::Duplicate;
        }

        if packet_after(packet, last) {
            let skipped = packet.wrapping_sub(last) - 1;
            for step in 1..=skipped {
                if self.missing.len() == MISSING_WINDOW {
                    self.missing.pop_front();
                }
                self.missing.push_back(last.wrapping_add(step));
            }
            // Forget numbers that are no longer behind the new head.
            self.missing.retain(|m| packet_after(packet, *m));
            self.last = Some(packet);
            return SequenceVerdict::Accept { skipped: u32::from(skipped) };
        }

        let recovered = match self.missing.iter().position(|m| *m == packet) {
            Some(index) => {
                self.missing.remove(index);
                true
            }
            None => false,
        };
        SequenceVerdict::OutOfOrder { recovered }
    }

    /// Continue from `packet` without judging it, e.g. after a long silence.
    pub fn reseed(&mut self, packet: u8) {
        self.last = Some(packet);
        self.missing.clear();
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.missing.clear();
    }
}
