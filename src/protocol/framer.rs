//! Byte-stream framing with resynchronization
//!
//! The framer owns a carry-over buffer. Each [`Framer::feed`] appends a chunk
//! and extracts every complete, checksum-valid frame. Bytes that cannot start
//! a valid frame are skipped up to the next sync marker and counted. A frame
//! split over any number of chunks is emitted once its last byte arrives.

use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace};

use super::{
    ENVELOPE_HEADER_SIZE, ENVELOPE_SYNC, HF_HEADER, HF_PACKET_SIZE, MAX_ENVELOPE_PAYLOAD,
    MIN_ENVELOPE_PAYLOAD, checksum,
};
use crate::types::{Frame, ProtocolVersion, RawChunk, WireFormat};

/// Counters kept by a framer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Valid frames emitted
    pub frames: u64,
    /// Bytes skipped while searching for a frame boundary
    pub discarded_bytes: u64,
    /// Times sync was lost and searched for again
    pub resyncs: u64,
}

/// Outcome of inspecting the head of the buffer.
enum Scan {
    /// A complete frame of this many bytes starts at offset 0
    Frame(usize),
    /// Drop this many bytes; no frame can start there
    Skip(usize),
    /// Not enough bytes yet
    NeedMore,
}

/// Reassembles frames from chunks of one sender.
#[derive(Debug)]
pub struct Framer {
    format: WireFormat,
    buffer: BytesMut,
    stats: FramerStats,
    in_resync: bool,
}

impl Framer {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            buffer: BytesMut::with_capacity(2 * HF_PACKET_SIZE),
            stats: FramerStats::default(),
            in_resync: false,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop carried-over bytes, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_resync = false;
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn feed(&mut self, chunk: RawChunk) -> Vec<Frame> {
        self.buffer.extend_from_slice(&chunk.bytes);
        let mut frames = Vec::new();

        loop {
            let scan = match self.format {
                WireFormat::Hf => scan_hf(&self.buffer),
                WireFormat::Envelope => scan_envelope(&self.buffer),
            };

            match scan {
                Scan::Frame(len) => {
                    let bytes = self.buffer.split_to(len).freeze();
                    if self.in_resync {
                        debug!(source = ?chunk.source, "framer resynchronized");
                        self.in_resync = false;
                    }
                    self.stats.frames += 1;
                    frames.push(self.build_frame(bytes, chunk.source, chunk.arrival));
                }
                Scan::Skip(count) => {
                    if !self.in_resync {
                        self.in_resync = true;
                        self.stats.resyncs += 1;
                        debug!(
                            source = ?chunk.source,
                            format = ?self.format,
                            "framer lost sync"
                        );
                    }
                    self.stats.discarded_bytes += count as u64;
                    self.buffer.advance(count);
                }
                Scan::NeedMore => break,
            }
        }

        trace!(frames = frames.len(), carried = self.buffer.len(), "chunk framed");
        frames
    }

    fn build_frame(
        &self,
        bytes: bytes::Bytes,
        source: Option<SocketAddr>,
        arrival: Instant,
    ) -> Frame {
        match self.format {
            WireFormat::Hf => {
                Frame { format: WireFormat::Hf, version: None, payload: bytes, source, arrival }
            }
            WireFormat::Envelope => {
                let version = ProtocolVersion::new(bytes[2], bytes[3]);
                let payload = bytes.slice(ENVELOPE_HEADER_SIZE..bytes.len() - 1);
                Frame { format: WireFormat::Envelope, version: Some(version), payload, source, arrival }
            }
        }
    }
}

fn scan_hf(buf: &[u8]) -> Scan {
    match buf.iter().position(|b| *b == HF_HEADER) {
        None if buf.is_empty() => Scan::NeedMore,
        None => Scan::Skip(buf.len()),
        Some(0) => {
            if buf.len() < HF_PACKET_SIZE {
                return Scan::NeedMore;
            }
            let end = HF_PACKET_SIZE - 1;
            if checksum(&buf[..end]) == buf[end] {
                Scan::Frame(HF_PACKET_SIZE)
            } else {
                // A header byte inside the payload; look past it.
                Scan::Skip(1)
            }
        }
        Some(pos) => Scan::Skip(pos),
    }
}

fn scan_envelope(buf: &[u8]) -> Scan {
    let sync = buf.windows(2).position(|w| w == ENVELOPE_SYNC);
    match sync {
        None => {
            // Keep a trailing first sync byte; its partner may be in the next chunk.
            let keep = usize::from(buf.last() == Some(&ENVELOPE_SYNC[0]));
            match buf.len() - keep {
                0 => Scan::NeedMore,
                skip => Scan::Skip(skip),
            }
        }
        Some(0) => {
            if buf.len() < ENVELOPE_HEADER_SIZE {
                return Scan::NeedMore;
            }
            let len = usize::from(u16::from_le_bytes([buf[4], buf[5]]));
            if !(MIN_ENVELOPE_PAYLOAD..=MAX_ENVELOPE_PAYLOAD).contains(&len) {
                return Scan::Skip(1);
            }
            let total = ENVELOPE_HEADER_SIZE + len + 1;
            if buf.len() < total {
                return Scan::NeedMore;
            }
            if checksum(&buf[2..total - 1]) == buf[total - 1] {
                Scan::Frame(total)
            } else {
                Scan::Skip(1)
            }
        }
        Some(pos) => Scan::Skip(pos),
    }
}
