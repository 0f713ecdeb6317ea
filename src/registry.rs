//! Subject registry and per-subject reconciliation
//!
//! The registry owns every [`Subject`] seen on a connection. It decides
//! whether a sample is accepted (ordering, duplicates, clock resets), keeps
//! counters, reconciles device time onto the local timeline and produces the
//! [`Snapshot`] to publish. It runs on the ingestion task only and needs no
//! locking.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::TrackingError;
use crate::clock::{ClockReconciler, FrameTimeEstimator, SequenceTracker, SequenceVerdict};
use crate::config::BridgeConfig;
use crate::types::{
    DeviceTimestamp, LensState, ProtocolMessage, QualifiedFrameTime, Snapshot, SubjectId, SubjectStats,
    Timecode, TrackingState,
};

/// Settings the registry takes from [`BridgeConfig`].
#[derive(Debug, Clone)]
struct Settings {
    staleness_timeout: Duration,
    reset_tolerance: f64,
    smoothing: f64,
    default_frame_rate: u32,
    labels: HashMap<SubjectId, String>,
}

impl Settings {
    fn from_config(config: &BridgeConfig) -> Self {
        let mut labels: HashMap<SubjectId, String> = config
            .subjects
            .iter()
            .filter_map(|m| m.label.clone().map(|label| (SubjectId(m.id), label)))
            .collect();
        if let Some(label) = config.label_for(config.default_subject()) {
            labels.entry(config.default_subject()).or_insert(label);
        }
        Self {
            staleness_timeout: config.staleness_timeout(),
            reset_tolerance: config.clock.reset_tolerance().as_secs_f64(),
            smoothing: config.clock.smoothing,
            default_frame_rate: config.default_frame_rate,
            labels,
        }
    }
}

/// Which packet-number sequence a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Tracking,
    Lens,
}

#[derive(Debug, Clone, Default)]
struct StreamState {
    sequence: SequenceTracker,
    last_timecode: Option<Timecode>,
}

impl StreamState {
    fn reset(&mut self) {
        self.sequence.reset();
        self.last_timecode = None;
    }
}

/// One tracked camera.
#[derive(Debug, Clone)]
pub struct Subject {
    id: SubjectId,
    label: Option<String>,
    label_configured: bool,
    tracking: Option<TrackingState>,
    lens: Option<LensState>,
    device_time: DeviceTimestamp,
    frame_time: Option<QualifiedFrameTime>,
    timestamp: f64,
    last_seen: Instant,
    stale: bool,
    version: u64,
    stats: SubjectStats,
    reconciler: ClockReconciler,
    estimator: FrameTimeEstimator,
    tracking_stream: StreamState,
    lens_stream: StreamState,
    /// Timecode rate the reconciler's offset was computed at
    rate_basis: Option<u32>,
}

impl Subject {
    fn new(id: SubjectId, settings: &Settings, now: Instant) -> Self {
        let label = settings.labels.get(&id).cloned();
        Self {
            id,
            label_configured: label.is_some(),
            label,
            tracking: None,
            lens: None,
            device_time: DeviceTimestamp::default(),
            frame_time: None,
            timestamp: 0.0,
            last_seen: now,
            stale: false,
            version: 0,
            stats: SubjectStats::default(),
            reconciler: ClockReconciler::new(settings.smoothing),
            estimator: FrameTimeEstimator::new(settings.default_frame_rate),
            tracking_stream: StreamState::default(),
            lens_stream: StreamState::default(),
            rate_basis: None,
        }
    }

    pub fn id(&self) -> SubjectId {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn stats(&self) -> SubjectStats {
        self.stats
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Whether any tracking or lens state has been accepted.
    pub fn has_state(&self) -> bool {
        self.tracking.is_some() || self.lens.is_some()
    }

    /// Frame rates inferred from the stream so far (timecode, packets).
    pub fn inferred_rates(&self) -> (Option<u32>, Option<u32>) {
        (self.estimator.timecode_rate(), self.estimator.packet_rate())
    }

    fn stream_mut(&mut self, stream: Stream) -> &mut StreamState {
        match stream {
            Stream::Tracking => &mut self.tracking_stream,
            Stream::Lens => &mut self.lens_stream,
        }
    }

    /// Decide whether a sample is accepted and, if so, stamp it on the local
    /// timeline. Returns false for duplicates and late samples.
    fn admit(&mut self, stream: Stream, device_time: DeviceTimestamp, arrival: Instant, epoch: Instant, settings: &Settings) -> bool {
        let rate = self.estimator.timecode_rate().unwrap_or(settings.default_frame_rate);
        let packet = device_time.packet_number;
        let timecode = device_time.timecode;
        let mut reanchor = false;

        let previous = self.stream_mut(stream).last_timecode;
        match previous {
            None => {
                self.stream_mut(stream).sequence.reseed(packet);
            }
            Some(previous) => {
                let frames = timecode.to_frame_number(rate) - previous.to_frame_number(rate);
                let dt = frames as f64 / f64::from(rate);

                if dt < -settings.reset_tolerance {
                    self.stats.clock_resets += 1;
                    let anomaly = TrackingError::reconciliation(
                        self.id.value(),
                        format!("device time went back {:.3}s ({} -> {})", -dt, previous, timecode),
                    );
                    warn!(subject = %self.id, error = %anomaly, "device clock reset, re-anchoring");
                    self.tracking_stream.reset();
                    self.lens_stream.reset();
                    self.estimator.reset();
                    self.stream_mut(stream).sequence.reseed(packet);
                    reanchor = true;
                } else if dt > settings.reset_tolerance {
                    // Packet numbers no longer say how much time passed.
                    let wrapped = stream == Stream::Tracking && self.estimator.counter_may_have_wrapped(dt);
                    debug!(subject = %self.id, gap = dt, wrapped, "stream resumed after a gap, re-anchoring");
                    if wrapped {
                        self.estimator.reset();
                    }
                    self.stream_mut(stream).sequence.reseed(packet);
                    reanchor = true;
                } else {
                    match self.stream_mut(stream).sequence.observe(packet) {
                        SequenceVerdict::First => {}
                        SequenceVerdict::Accept { skipped } => {
                            if skipped > 0 {
                                trace!(subject = %self.id, skipped, "packets missing");
                            }
                            self.stats.dropped += u64::from(skipped);
                        }
                        SequenceVerdict::Duplicate => {
                            self.stats.duplicates += 1;
                            debug!(subject = %self.id, packet, "duplicate packet dropped");
                            return false;
                        }
                        SequenceVerdict::OutOfOrder { recovered } => {
                            self.stats.out_of_order += 1;
                            if recovered {
                                self.stats.dropped = self.stats.dropped.saturating_sub(1);
                            }
                            debug!(subject = %self.id, packet, recovered, "late packet dropped");
                            return false;
                        }
                    }
                }
            }
        }

        self.stream_mut(stream).last_timecode = Some(timecode);
        if stream == Stream::Tracking {
            self.estimator.update(packet, timecode);
        }

        // The rate may have just been inferred; stamp with the current one.
        let rate = self.estimator.timecode_rate().unwrap_or(settings.default_frame_rate);
        let frame_time = self.estimator.frame_time();
        let device_seconds = match frame_time {
            Some(frame_time) if stream == Stream::Tracking => frame_time.as_seconds(),
            _ => timecode.to_seconds(rate),
        };
        if self.rate_basis != Some(rate) {
            reanchor |= self.rate_basis.is_some();
            self.rate_basis = Some(rate);
        }

        let arrival_seconds = arrival.saturating_duration_since(epoch).as_secs_f64();
        self.timestamp = if reanchor {
            self.reconciler.reanchor(device_seconds, arrival_seconds)
        } else {
            self.reconciler.reconcile(device_seconds, arrival_seconds)
        };
        self.device_time = device_time;
        self.frame_time = frame_time;
        self.last_seen = arrival;
        self.stats.accepted += 1;
        if self.stale {
            debug!(subject = %self.id, "subject is live again");
            self.stale = false;
        }
        true
    }

    fn publish(&mut self) -> Snapshot {
        self.version += 1;
        self.snapshot()
    }

    /// Current state as a snapshot (does not bump the version).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            subject: self.id,
            label: self.label.clone(),
            version: self.version,
            timestamp: self.timestamp,
            device_time: self.device_time,
            frame_time: self.frame_time,
            tracking: self.tracking,
            lens: self.lens,
            stats: self.stats,
            stale: self.stale,
        }
    }
}

/// Arena of subjects for one connection.
#[derive(Debug)]
pub struct SubjectRegistry {
    epoch: Instant,
    settings: Settings,
    subjects: BTreeMap<SubjectId, Subject>,
}

impl SubjectRegistry {
    /// `epoch` is time zero of the local timeline.
    pub fn new(config: &BridgeConfig, epoch: Instant) -> Self {
        Self { epoch, settings: Settings::from_config(config), subjects: BTreeMap::new() }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn subject(&self, id: SubjectId) -> Option<&Subject> {
        self.subjects.get(&id)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.values()
    }

    /// Apply one decoded message. Returns the snapshot to publish, if the
    /// message changed published state.
    pub fn ingest(&mut self, message: ProtocolMessage, arrival: Instant) -> Option<Snapshot> {
        let Self { epoch, settings, subjects } = self;
        match message {
            ProtocolMessage::Tracking(sample) => {
                let subject = entry(subjects, settings, sample.subject, arrival);
                if !subject.admit(Stream::Tracking, sample.device_time, arrival, *epoch, settings) {
                    return None;
                }
                subject.tracking = Some(sample.tracking);
                if let Some(lens) = sample.lens {
                    subject.lens = Some(lens);
                }
                Some(subject.publish())
            }
            ProtocolMessage::Lens(sample) => {
                let subject = entry(subjects, settings, sample.subject, arrival);
                if !subject.admit(Stream::Lens, sample.device_time, arrival, *epoch, settings) {
                    return None;
                }
                subject.lens = Some(sample.lens);
                Some(subject.publish())
            }
            ProtocolMessage::SubjectAnnounce(announce) => {
                let subject = entry(subjects, settings, announce.subject, arrival);
                if subject.label_configured {
                    debug!(subject = %announce.subject, announced = %announce.label, "configured label kept");
                    return None;
                }
                if subject.label.as_deref() == Some(announce.label.as_str()) {
                    return None;
                }
                info!(subject = %announce.subject, label = %announce.label, "subject announced");
                subject.label = Some(announce.label);
                subject.has_state().then(|| subject.publish())
            }
            ProtocolMessage::Heartbeat(heartbeat) => {
                let subject = entry(subjects, settings, heartbeat.subject, arrival);
                subject.last_seen = arrival;
                trace!(subject = %heartbeat.subject, "heartbeat");
                None
            }
            ProtocolMessage::Status(status) => {
                entry(subjects, settings, status.subject, arrival);
                warn!(subject = %status.subject, code = status.code, message = %status.message, "device status");
                None
            }
            ProtocolMessage::Unknown { subject, tag, payload_len } => {
                debug!(subject = ?subject, tag, payload_len, "ignoring unknown message");
                None
            }
        }
    }

    /// Mark subjects silent for longer than the staleness timeout. Returns the
    /// flagged snapshots to publish.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<Snapshot> {
        let timeout = self.settings.staleness_timeout;
        let mut flagged = Vec::new();
        for subject in self.subjects.values_mut() {
            if subject.stale || now.saturating_duration_since(subject.last_seen) <= timeout {
                continue;
            }
            subject.stale = true;
            info!(subject = %subject.id, silent_for = ?now.saturating_duration_since(subject.last_seen), "subject went stale");
            if subject.has_state() {
                flagged.push(subject.publish());
            }
        }
        flagged
    }

    /// Apply new settings. Subjects, counters and clocks are kept.
    pub fn reconfigure(&mut self, config: &BridgeConfig) {
        self.settings = Settings::from_config(config);
        for subject in self.subjects.values_mut() {
            subject.reconciler.set_smoothing(self.settings.smoothing);
            match self.settings.labels.get(&subject.id) {
                Some(label) => {
                    subject.label = Some(label.clone());
                    subject.label_configured = true;
                }
                None if subject.label_configured => {
                    subject.label = None;
                    subject.label_configured = false;
                }
                None => {}
            }
        }
    }
}

fn entry<'a>(
    subjects: &'a mut BTreeMap<SubjectId, Subject>,
    settings: &Settings,
    id: SubjectId,
    now: Instant,
) -> &'a mut Subject {
    subjects.entry(id).or_insert_with(|| {
        info!(subject = %id, label = ?settings.labels.get(&id), "new subject");
        Subject::new(id, settings, now)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubjectMapping;
    use crate::sim::RigSimulator;
    use crate::test_utils::{sample_lens, tracking_at};
    use crate::types::{Heartbeat, SubjectAnnounce};
    use proptest::prelude::*;

    const RATE: u32 = 60;
    const BASE: i64 = 10 * 3600 * 60;

    fn at(epoch: Instant, frame: i64) -> Instant {
        epoch + Duration::from_secs_f64(frame as f64 / f64::from(RATE))
    }

    fn track(registry: &mut SubjectRegistry, subject: u16, frame: i64, arrival: Instant) -> Option<Snapshot> {
        registry.ingest(ProtocolMessage::Tracking(tracking_at(SubjectId(subject), BASE + frame, RATE)), arrival)
    }

    #[test]
    fn first_sample_creates_and_publishes() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        let snapshot = track(&mut registry, 1, 0, at(epoch, 0)).unwrap();
        assert_eq!(snapshot.subject, SubjectId(1));
        assert_eq!(snapshot.label.as_deref(), Some("Camera"));
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.tracking.is_some());
        assert!(snapshot.lens.is_some());
        assert!(snapshot.timestamp.abs() < 1e-9);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn gaps_duplicates_and_late_packets_are_counted() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        for frame in [0, 1, 2, 5] {
            assert!(track(&mut registry, 1, frame, at(epoch, frame)).is_some());
        }
        assert!(track(&mut registry, 1, 5, at(epoch, 6)).is_none());
        assert!(track(&mut registry, 1, 3, at(epoch, 6)).is_none());

        let stats = registry.subject(SubjectId(1)).unwrap().stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.accepted, 4);
    }

    #[test]
    fn clock_reset_reanchors_without_going_back() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        let mut last = f64::MIN;
        for frame in 0..30 {
            let snapshot = track(&mut registry, 1, frame, at(epoch, frame)).unwrap();
            assert!(snapshot.timestamp >= last);
            last = snapshot.timestamp;
        }

        // Device restarts its timecode an hour earlier.
        let snapshot = registry
            .ingest(ProtocolMessage::Tracking(tracking_at(SubjectId(1), BASE - 3600 * 60, RATE)), at(epoch, 30))
            .unwrap();
        assert!(snapshot.timestamp >= last);
        assert!((snapshot.timestamp - 0.5).abs() < 0.02);
        assert_eq!(snapshot.stats.clock_resets, 1);
        assert_eq!(snapshot.stats.dropped, 0);
    }

    #[test]
    fn long_silence_resumes_without_counting_drops() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        track(&mut registry, 1, 0, at(epoch, 0));
        track(&mut registry, 1, 1, at(epoch, 1));
        let snapshot = track(&mut registry, 1, 300, at(epoch, 300)).unwrap();
        assert_eq!(snapshot.stats.dropped, 0);
        assert_eq!(snapshot.stats.clock_resets, 0);
        assert!((snapshot.timestamp - 5.0).abs() < 0.01);
    }

    #[test]
    fn long_silence_reanchors_timestamps_on_arrival() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        let mut rig = RigSimulator::new(SubjectId(1), RATE);
        let send = |registry: &mut SubjectRegistry, rig: &mut RigSimulator| {
            let arrival = epoch + rig.period() * rig.packet_index() as u32;
            let snapshot = registry.ingest(ProtocolMessage::Tracking(rig.next_sample()), arrival).unwrap();
            (snapshot, arrival.duration_since(epoch).as_secs_f64())
        };

        for _ in 0..360 {
            send(&mut registry, &mut rig);
        }
        assert_eq!(registry.subject(SubjectId(1)).unwrap().inferred_rates(), (Some(60), Some(60)));

        // Five seconds of silence: the packet counter wraps more than once.
        rig.skip_packets(300);
        let frame = 1.0 / f64::from(RATE);
        for _ in 0..300 {
            let (snapshot, arrival) = send(&mut registry, &mut rig);
            assert!(
                (snapshot.timestamp - arrival).abs() <= frame,
                "packet {} stamped {:.4}s, arrived {:.4}s",
                rig.packet_index(),
                snapshot.timestamp,
                arrival
            );
        }
        let subject = registry.subject(SubjectId(1)).unwrap();
        assert_eq!(subject.stats().clock_resets, 0);
        assert_eq!(subject.inferred_rates(), (Some(60), Some(60)));
    }

    #[test]
    fn short_gap_keeps_inferred_rates() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        for frame in 0..360 {
            track(&mut registry, 1, frame, at(epoch, frame));
        }
        // One second missing: 60 packets, well short of a counter wrap.
        let snapshot = track(&mut registry, 1, 420, at(epoch, 420)).unwrap();
        assert_eq!(registry.subject(SubjectId(1)).unwrap().inferred_rates(), (Some(60), Some(60)));
        assert!((snapshot.timestamp - 7.0).abs() < 1e-6);
    }

    #[test]
    fn staleness_is_swept_and_cleared() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        track(&mut registry, 1, 0, at(epoch, 0));
        track(&mut registry, 2, 0, at(epoch, 0));
        track(&mut registry, 2, 60, at(epoch, 60));

        assert!(registry.sweep_stale(at(epoch, 60)).is_empty());
        let flagged = registry.sweep_stale(epoch + Duration::from_millis(1_600));
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].subject, SubjectId(1));
        assert!(flagged[0].stale);
        assert_eq!(flagged[0].version, 2);
        // Already stale: not flagged twice.
        assert!(registry.sweep_stale(epoch + Duration::from_millis(1_700)).is_empty());

        let back = track(&mut registry, 1, 120, at(epoch, 120)).unwrap();
        assert!(!back.stale);
    }

    #[test]
    fn heartbeat_keeps_fresh_but_does_not_revive() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        track(&mut registry, 1, 0, at(epoch, 0));
        let heartbeat = |frame: i64| {
            ProtocolMessage::Heartbeat(Heartbeat {
                subject: SubjectId(1),
                device_time: tracking_at(SubjectId(1), BASE + frame, RATE).device_time,
            })
        };

        assert!(registry.ingest(heartbeat(60), at(epoch, 60)).is_none());
        assert!(registry.sweep_stale(epoch + Duration::from_millis(2_000)).is_empty());
        assert_eq!(registry.sweep_stale(epoch + Duration::from_millis(3_000)).len(), 1);
        registry.ingest(heartbeat(200), at(epoch, 200));
        assert!(registry.subject(SubjectId(1)).unwrap().is_stale());
    }

    #[test]
    fn announcements_name_subjects_unless_configured() {
        let epoch = Instant::now();
        let config = BridgeConfig {
            subjects: vec![SubjectMapping { id: 2, label: Some("Crane".into()), sender: None }],
            ..BridgeConfig::default()
        };
        let mut registry = SubjectRegistry::new(&config, epoch);
        let announce = |id: u16, label: &str| {
            ProtocolMessage::SubjectAnnounce(SubjectAnnounce { subject: SubjectId(id), label: label.into() })
        };

        // No state yet: nothing to publish, but the label sticks.
        assert!(registry.ingest(announce(7, "Steadicam"), epoch).is_none());
        let snapshot = track(&mut registry, 7, 0, at(epoch, 0)).unwrap();
        assert_eq!(snapshot.label.as_deref(), Some("Steadicam"));

        let renamed = registry.ingest(announce(7, "Handheld"), at(epoch, 1)).unwrap();
        assert_eq!(renamed.label.as_deref(), Some("Handheld"));
        assert_eq!(renamed.version, 2);

        track(&mut registry, 2, 0, at(epoch, 0));
        assert!(registry.ingest(announce(2, "Other"), at(epoch, 1)).is_none());
        assert_eq!(registry.subject(SubjectId(2)).unwrap().label(), Some("Crane"));
    }

    #[test]
    fn lens_stream_has_its_own_sequence() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        track(&mut registry, 4, 10, at(epoch, 10));
        let snapshot = registry
            .ingest(ProtocolMessage::Lens(sample_lens(SubjectId(4), 3)), at(epoch, 10))
            .unwrap();
        assert!(snapshot.lens.is_some());
        assert_eq!(snapshot.stats.out_of_order, 0);
        assert_eq!(snapshot.stats.accepted, 2);
    }

    #[test]
    fn reconfigure_relabels_subjects() {
        let epoch = Instant::now();
        let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
        track(&mut registry, 1, 0, at(epoch, 0));
        let config = BridgeConfig { default_label: "Main".into(), ..BridgeConfig::default() };
        registry.reconfigure(&config);
        let subject = registry.subject(SubjectId(1)).unwrap();
        assert_eq!(subject.label(), Some("Main"));
        assert_eq!(subject.stats().accepted, 1);
    }

    proptest! {
        #[test]
        fn published_timestamps_never_decrease(
            steps in prop::collection::vec((-3i64..6, 0u64..40, prop::bool::weighted(0.05)), 1..300)
        ) {
            let epoch = Instant::now();
            let mut registry = SubjectRegistry::new(&BridgeConfig::default(), epoch);
            let mut frame = 0i64;
            let mut arrival = epoch;
            let mut last = f64::MIN;
            for (step, arrival_ms, reset) in steps {
                frame = if reset { frame - 10_000 } else { frame + step };
                arrival += Duration::from_millis(arrival_ms);
                if let Some(snapshot) = track(&mut registry, 1, frame, arrival) {
                    prop_assert!(snapshot.timestamp >= last);
                    last = snapshot.timestamp;
                }
            }
        }
    }
}
