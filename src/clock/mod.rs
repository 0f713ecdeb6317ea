//! Device clock handling.
//!
//! The rig stamps each sample with an SMPTE timecode and an 8-bit packet
//! counter. Neither is a usable host timestamp on its own: timecode has frame
//! resolution and wraps daily, packet numbers wrap every 256 packets. This
//! module turns them into something a renderer can use:
//!
//! - [`FrameTimeEstimator`] infers the timecode and packet rates from the
//!   stream and produces a frame number that survives lost packets
//! - [`ClockReconciler`] maps device seconds onto the local monotonic
//!   timeline with a smoothed offset
//! - [`SequenceTracker`] classifies packet numbers as new, duplicate or late

mod estimator;
mod reconciler;
mod sequence;

pub use estimator::{AgreementEstimator, FrameTimeEstimator, OverflowRateEstimator, VALID_RATES};
pub use reconciler::ClockReconciler;
pub use sequence::{SequenceTracker, SequenceVerdict};
