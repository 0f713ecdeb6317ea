//! Rate inference from timecode overflows

use crate::types::{QualifiedFrameTime, Timecode, packets_elapsed};

/// Rates the rig can run at. Anything else is treated as a misreading.
pub const VALID_RATES: [u32; 11] = [24, 25, 30, 48, 50, 60, 72, 75, 96, 100, 120];

/// Consecutive repeats needed before a rate is believed.
const MIN_AGREEMENTS: u32 = 2;

/// Accepts a value once it has been observed `min_agree` more times in a row.
#[derive(Debug, Clone)]
pub struct AgreementEstimator {
    min_agree: u32,
    default: u32,
    last_value: u32,
    estimation: u32,
    agreements: u32,
    valid: bool,
    valid_values: Vec<u32>,
}

impl AgreementEstimator {
    /// An empty `valid_values` accepts anything.
    pub fn new(min_agree: u32, default: u32, valid_values: &[u32]) -> Self {
        Self {
            min_agree,
            default,
            last_value: 0,
            estimation: default,
            agreements: 0,
            valid: false,
            valid_values: valid_values.to_vec(),
        }
    }

    pub fn update(&mut self, value: u32) {
        if value == self.last_value {
            self.agreements = (self.agreements + 1).min(self.min_agree);
            if self.agreements >= self.min_agree
                && (self.valid_values.is_empty() || self.valid_values.contains(&value))
            {
                self.estimation = value;
                self.valid = true;
            }
        } else {
            self.agreements = 0;
        }
        self.last_value = value;
    }

    /// Current estimate, or the default until agreement is reached.
    pub fn estimation(&self) -> u32 {
        self.estimation
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn reset(&mut self) {
        self.last_value = 0;
        self.estimation = self.default;
        self.agreements = 0;
        self.valid = false;
    }
}

/// Infers a rate from a counter that wraps to zero, e.g. timecode frames
/// going 59 → 0 means 60 per second.
#[derive(Debug, Clone)]
pub struct OverflowRateEstimator {
    last_value: u32,
    rate: AgreementEstimator,
    overflowed: bool,
}

impl OverflowRateEstimator {
    pub fn new(default: u32) -> Self {
        Self {
            last_value: 0,
            rate: AgreementEstimator::new(MIN_AGREEMENTS, default, &VALID_RATES),
            overflowed: false,
        }
    }

    pub fn update(&mut self, value: u32) {
        // Repeated zeros are not overflows.
        self.overflowed = value == 0 && self.last_value != 0;
        if self.overflowed {
            self.rate.update(self.last_value + 1);
        }
        self.last_value = value;
    }

    /// Whether the last update wrapped to zero. Detected before the rate is known.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn estimation(&self) -> u32 {
        self.rate.estimation()
    }

    pub fn is_valid(&self) -> bool {
        self.rate.is_valid()
    }

    pub fn reset(&mut self) {
        self.last_value = 0;
        self.overflowed = false;
        self.rate.reset();
    }
}

/// Frame time robust to lost packets.
///
/// The timecode frames field overflows once per second. Counting packet
/// numbers between overflows gives the packet rate; the frame time is the
/// last verified overflow timecode plus packets elapsed since, so it keeps
/// counting correctly through drops (up to 255 consecutive).
#[derive(Debug, Clone)]
pub struct FrameTimeEstimator {
    default_rate: u32,
    last_packet: u8,
    packets_since_overflow: u32,
    verified_packets_since_overflow: u32,
    timecode_at_overflow: Timecode,
    verified_timecode_at_overflow: Timecode,
    timecode_rate: OverflowRateEstimator,
    packet_rate: AgreementEstimator,
    frame_time: QualifiedFrameTime,
}

impl FrameTimeEstimator {
    /// `default_rate` is only a placeholder for both the timecode and packet
    /// rate while they are unknown. It is never reported: [`timecode_rate`],
    /// [`packet_rate`] and [`frame_time`] stay `None` until each rate has been
    /// observed in the stream, so callers pick their own fallback.
    ///
    /// [`timecode_rate`]: Self::timecode_rate
    /// [`packet_rate`]: Self::packet_rate
    /// [`frame_time`]: Self::frame_time
    pub fn new(default_rate: u32) -> Self {
        Self {
            default_rate,
            last_packet: 0,
            packets_since_overflow: 0,
            verified_packets_since_overflow: 0,
            timecode_at_overflow: Timecode::default(),
            verified_timecode_at_overflow: Timecode::default(),
            timecode_rate: OverflowRateEstimator::new(default_rate),
            packet_rate: AgreementEstimator::new(MIN_AGREEMENTS, default_rate, &VALID_RATES),
            frame_time: QualifiedFrameTime::new(0, default_rate),
        }
    }

    /// Feed one accepted packet, in stream order.
    pub fn update(&mut self, packet_number: u8, timecode: Timecode) {
        self.timecode_rate.update(u32::from(timecode.frames));
        if self.timecode_rate.overflowed() {
            self.timecode_at_overflow = timecode;
        }

        let elapsed = packets_elapsed(self.last_packet, packet_number);
        self.packets_since_overflow += elapsed;
        self.verified_packets_since_overflow += elapsed;

        // Only right after an overflow has a whole number of seconds passed.
        if self.timecode_rate.overflowed() {
            self.packet_rate.update(self.packets_since_overflow);

            // A count that is not a multiple of the rate means an overflow packet was lost.
            let rate = self.packet_rate.estimation();
            if self.packet_rate.is_valid() && rate > 0 && self.packets_since_overflow % rate == 0 {
                self.verified_timecode_at_overflow = self.timecode_at_overflow;
                self.verified_packets_since_overflow = 0;
            }
            self.packets_since_overflow = 0;
        }

        let rate = self.packet_rate.estimation();
        let frame = self.verified_timecode_at_overflow.to_frame_number(rate)
            + i64::from(self.verified_packets_since_overflow);
        self.frame_time = QualifiedFrameTime::new(frame, rate);
        self.last_packet = packet_number;
    }

    /// Both the timecode rate and packet rate have been inferred.
    pub fn is_valid(&self) -> bool {
        self.timecode_rate.is_valid() && self.packet_rate.is_valid()
    }

    pub fn frame_time(&self) -> Option<QualifiedFrameTime> {
        self.is_valid().then_some(self.frame_time)
    }

    /// Inferred timecode rate, once known.
    pub fn timecode_rate(&self) -> Option<u32> {
        self.timecode_rate.is_valid().then(|| self.timecode_rate.estimation())
    }

    /// Inferred packet rate, once known.
    pub fn packet_rate(&self) -> Option<u32> {
        self.packet_rate.is_valid().then(|| self.packet_rate.estimation())
    }

    /// Whether `seconds` of silence could hide a full wrap of the 8-bit
    /// packet counter. Assumes the fastest valid rate until the packet rate
    /// is known.
    pub fn counter_may_have_wrapped(&self, seconds: f64) -> bool {
        let rate = self.packet_rate().unwrap_or(VALID_RATES[VALID_RATES.len() - 1]);
        seconds * f64::from(rate) >= f64::from(u8::MAX)
    }

    /// Forget everything inferred so far.
    pub fn reset(&mut self) {
        *self = Self::new(self.default_rate);
    }
}
