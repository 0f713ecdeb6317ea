//! Simulated camera rig
//!
//! [`RigSimulator`] produces the sample stream a tracked camera on a slow
//! orbit would send: timecode and packet numbers advance the way a device
//! clocks them, the head pans and the lens zooms. Used by the demo, benches
//! and tests.

use bytes::Bytes;
use std::time::Duration;

use crate::Result;
use crate::protocol::{encode_envelope, encode_hf};
use crate::types::{
    COMMAND_FOCUS_DISTANCE, DeviceTimestamp, LensState, Orientation, ProtocolMessage, ProtocolVersion, SubjectId,
    Timecode, TrackingSample, TrackingState,
};

/// Orbit radius in metres.
const ORBIT_RADIUS: f32 = 2.5;
/// Seconds per orbit.
const ORBIT_PERIOD: f32 = 20.0;

/// Deterministic sample generator for one camera.
#[derive(Debug, Clone)]
pub struct RigSimulator {
    subject: SubjectId,
    packet_rate: u32,
    timecode_rate: u32,
    start_frame: i64,
    index: u64,
}

impl RigSimulator {
    /// One packet per timecode frame at `rate`, starting at 10:00:00:00.
    pub fn new(subject: SubjectId, rate: u32) -> Self {
        Self {
            subject,
            packet_rate: rate,
            timecode_rate: rate,
            start_frame: 10 * 3600 * i64::from(rate),
            index: 0,
        }
    }

    /// Send `packet_rate` packets a second while the timecode counts at
    /// `timecode_rate`, e.g. 50 packets over 25 fps timecode.
    pub fn with_rates(mut self, packet_rate: u32, timecode_rate: u32) -> Self {
        self.start_frame = self.start_frame / i64::from(self.timecode_rate.max(1)) * i64::from(timecode_rate);
        self.packet_rate = packet_rate.max(1);
        self.timecode_rate = timecode_rate.max(1);
        self
    }

    /// Start the timecode at `timecode` instead of 10:00:00:00.
    pub fn starting_at(mut self, timecode: Timecode) -> Self {
        self.start_frame = timecode.to_frame_number(self.timecode_rate);
        self
    }

    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// Packets generated (or skipped) so far.
    pub fn packet_index(&self) -> u64 {
        self.index
    }

    /// Time between two packets.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.packet_rate))
    }

    /// Device time of the next packet.
    pub fn device_time(&self) -> DeviceTimestamp {
        let elapsed = self.index * u64::from(self.timecode_rate) / u64::from(self.packet_rate);
        let frame = self.start_frame + elapsed as i64;
        DeviceTimestamp::new(Timecode::from_frame_number(frame, self.timecode_rate), self.index as u8)
    }

    /// Lose `count` packets: the clock moves on without producing them.
    pub fn skip_packets(&mut self, count: u64) {
        self.index += count;
    }

    pub fn next_sample(&mut self) -> TrackingSample {
        let device_time = self.device_time();
        let t = self.index as f32 / self.packet_rate as f32;
        let angle = t / ORBIT_PERIOD * std::f32::consts::TAU;
        self.index += 1;

        let zoom = 0.5 - 0.5 * (angle * 2.0).cos();
        TrackingSample {
            subject: self.subject,
            device_time,
            tracking: TrackingState {
                position: [ORBIT_RADIUS * angle.cos(), 1.5 + 0.1 * (angle * 3.0).sin(), ORBIT_RADIUS * angle.sin()],
                orientation: Orientation::Euler {
                    pan: (angle.to_degrees() + 90.0) % 360.0,
                    tilt: -5.0 + 2.0 * angle.sin(),
                    roll: 0.0,
                },
            },
            lens: Some(LensState {
                field_of_view: 70.0 - 50.0 * zoom,
                aspect_ratio: 16.0 / 9.0,
                focus: ORBIT_RADIUS,
                zoom,
                k1: 0.01 * (1.0 - zoom),
                k2: -0.002,
                center_shift: [0.0, 0.0],
                projection_area_width: 9.59,
                command: COMMAND_FOCUS_DISTANCE,
            }),
        }
    }

    /// Next sample as a 67-byte HF packet.
    pub fn next_hf(&mut self) -> Result<Bytes> {
        encode_hf(&self.next_sample())
    }

    /// Next sample as an envelope CAMERA frame.
    pub fn next_envelope(&mut self, version: ProtocolVersion) -> Result<Bytes> {
        encode_envelope(&ProtocolMessage::Tracking(self.next_sample()), version)
    }
}

impl Iterator for RigSimulator {
    type Item = TrackingSample;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_sample())
    }
}
