//! Driver spawns and manages the ingestion task
//!
//! One task per connection owns the transport, the framers, the decoder and
//! the subject registry. It selects over cancellation, the staleness sweep
//! and `Transport::poll`, and hands every resulting snapshot to the
//! publisher. Nothing in the loop blocks on a consumer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::TrackingError;
use crate::config::BridgeConfig;
use crate::protocol::{Decoder, Framer};
use crate::publisher::SnapshotPublisher;
use crate::registry::SubjectRegistry;
use crate::transport::{Backoff, Transport};
use crate::types::{ConnectionState, ProtocolMessage, RawChunk, Snapshot, WireFormat};

/// Senders tracked with their own framer before the least recent is evicted.
const MAX_FRAMERS: usize = 64;

/// Live ingestion counters, shared between the task and its handle.
#[derive(Debug, Default)]
pub struct IngestCounters {
    chunks: AtomicU64,
    bytes: AtomicU64,
    frames: AtomicU64,
    messages: AtomicU64,
    decode_errors: AtomicU64,
    version_errors: AtomicU64,
    statuses: AtomicU64,
    unknown: AtomicU64,
    discarded_bytes: AtomicU64,
    resyncs: AtomicU64,
    filtered: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`IngestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct IngestStats {
    pub chunks: u64,
    pub bytes: u64,
    /// Checksum-valid frames out of the framers
    pub frames: u64,
    /// Frames that decoded into a message
    pub messages: u64,
    pub decode_errors: u64,
    /// Envelope frames of an unsupported major version
    pub version_errors: u64,
    /// Device status messages received
    pub statuses: u64,
    /// Messages with a tag this build does not know
    pub unknown: u64,
    pub discarded_bytes: u64,
    pub resyncs: u64,
    /// Datagrams dropped by the sender filter
    pub filtered: u64,
    /// Successful reopens after a transport failure
    pub reconnects: u64,
}

impl IngestCounters {
    fn add(counter: &AtomicU64, value: u64) {
        if value > 0 {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> IngestStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        IngestStats {
            chunks: load(&self.chunks),
            bytes: load(&self.bytes),
            frames: load(&self.frames),
            messages: load(&self.messages),
            decode_errors: load(&self.decode_errors),
            version_errors: load(&self.version_errors),
            statuses: load(&self.statuses),
            unknown: load(&self.unknown),
            discarded_bytes: load(&self.discarded_bytes),
            resyncs: load(&self.resyncs),
            filtered: load(&self.filtered),
            reconnects: load(&self.reconnects),
        }
    }
}

/// State the ingestion task shares with its connection handle.
#[derive(Debug, Clone)]
pub struct Shared {
    pub publisher: Arc<SnapshotPublisher>,
    pub status: Arc<watch::Sender<ConnectionState>>,
    pub counters: Arc<IngestCounters>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            publisher: Arc::new(SnapshotPublisher::new()),
            status: Arc::new(watch::Sender::new(ConnectionState::Disconnected)),
            counters: Arc::new(IngestCounters::default()),
        }
    }

    /// Move to `state`, notifying watchers only on an actual change.
    pub fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!(from = %current, to = %state, "connection state changed");
            *current = state;
            true
        });
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames, decodes and reconciles chunks. Synchronous; the driver feeds it.
#[derive(Debug)]
pub struct Pipeline {
    format: WireFormat,
    framers: HashMap<Option<SocketAddr>, (Framer, Instant)>,
    decoder: Decoder,
    registry: SubjectRegistry,
    counters: Arc<IngestCounters>,
}

impl Pipeline {
    pub fn new(config: &BridgeConfig, registry: SubjectRegistry, counters: Arc<IngestCounters>) -> Self {
        Self {
            format: config.format,
            framers: HashMap::new(),
            decoder: Decoder::from_config(config),
            registry,
            counters,
        }
    }

    pub fn registry(&self) -> &SubjectRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> SubjectRegistry {
        self.registry
    }

    /// Drop partial frames, e.g. when a stream reconnects mid-frame.
    pub fn reset_framers(&mut self) {
        self.framers.clear();
    }

    fn framer(&mut self, source: Option<SocketAddr>, now: Instant) -> &mut Framer {
        if !self.framers.contains_key(&source) && self.framers.len() >= MAX_FRAMERS {
            let oldest = self.framers.iter().min_by_key(|(_, (_, used))| *used).map(|(key, _)| *key);
            if let Some(key) = oldest {
                debug!(sender = ?key, "evicting framer of least recent sender");
                self.framers.remove(&key);
            }
        }
        let format = self.format;
        let (framer, used) = self.framers.entry(source).or_insert_with(|| (Framer::new(format), now));
        *used = now;
        framer
    }

    /// Process one chunk and return the snapshots it produced, in order.
    pub fn ingest(&mut self, chunk: RawChunk) -> Vec<Snapshot> {
        let counters = Arc::clone(&self.counters);
        IngestCounters::add(&counters.chunks, 1);
        IngestCounters::add(&counters.bytes, chunk.bytes.len() as u64);

        let chunk_source = chunk.source;
        let framer = self.framer(chunk.source, chunk.arrival);
        let before = framer.stats();
        let frames = framer.feed(chunk);
        let after = framer.stats();
        IngestCounters::add(&counters.frames, after.frames - before.frames);
        let discarded = after.discarded_bytes - before.discarded_bytes;
        IngestCounters::add(&counters.discarded_bytes, discarded);
        IngestCounters::add(&counters.resyncs, after.resyncs - before.resyncs);
        if discarded > 0 {
            let e = TrackingError::framing("bytes outside any valid frame", discarded as usize);
            debug!(error = %e, source = ?chunk_source, "skipped corrupt bytes");
        }

        let mut snapshots = Vec::new();
        for frame in frames {
            let message = match self.decoder.decode(&frame) {
                Ok(message) => message,
                Err(e @ TrackingError::UnsupportedVersion { .. }) => {
                    IngestCounters::add(&counters.version_errors, 1);
                    debug!(error = %e, source = ?frame.source, "dropping frame");
                    continue;
                }
                Err(e) => {
                    IngestCounters::add(&counters.decode_errors, 1);
                    debug!(error = %e, source = ?frame.source, "dropping undecodable frame");
                    continue;
                }
            };

            IngestCounters::add(&counters.messages, 1);
            match &message {
                ProtocolMessage::Status(_) => IngestCounters::add(&counters.statuses, 1),
                ProtocolMessage::Unknown { .. } => IngestCounters::add(&counters.unknown, 1),
                _ => {}
            }
            trace!(kind = message.kind(), subject = ?message.subject(), "message decoded");

            if let Some(snapshot) = self.registry.ingest(message, frame.arrival) {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub fn sweep(&mut self, now: Instant) -> Vec<Snapshot> {
        self.registry.sweep_stale(now)
    }
}

/// What an ingestion task hands back when it ends.
#[derive(Debug)]
pub struct Stopped<T> {
    /// Subjects, counters and clocks, kept across a restart
    pub registry: SubjectRegistry,
    /// The transport, closed
    pub transport: T,
}

/// Handle on a spawned ingestion task.
#[derive(Debug)]
pub struct DriverHandle<T> {
    pub cancel: CancellationToken,
    pub task: JoinHandle<Stopped<T>>,
}

/// Driver spawns and manages the ingestion task
pub struct Driver;

impl Driver {
    /// Spawn the ingestion task for `transport`.
    ///
    /// With `opened` the transport is already bound and the task starts in
    /// `Connected`; otherwise it connects first, with backoff.
    pub fn spawn<T>(
        transport: T,
        opened: bool,
        config: &BridgeConfig,
        registry: SubjectRegistry,
        shared: Shared,
    ) -> DriverHandle<T>
    where
        T: Transport,
    {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(config, registry, Arc::clone(&shared.counters));
        let task = IngestTask {
            pipeline,
            shared,
            backoff: Backoff::new(&config.reconnect),
            sweep_interval: config.sweep_interval(),
            cancel: cancel.clone(),
            filtered_seen: 0,
        };

        let task = tokio::spawn(task.run(transport, opened));
        DriverHandle { cancel, task }
    }
}

struct IngestTask {
    pipeline: Pipeline,
    shared: Shared,
    backoff: Backoff,
    sweep_interval: std::time::Duration,
    cancel: CancellationToken,
    filtered_seen: u64,
}

impl IngestTask {
    async fn run<T: Transport>(mut self, mut transport: T, opened: bool) -> Stopped<T> {
        info!(endpoint = %transport.endpoint(), mode = ?transport.mode(), "ingestion task started");

        let running = if opened {
            self.shared.set_state(ConnectionState::Connected);
            true
        } else {
            self.establish(&mut transport, ConnectionState::Connecting, None).await
        };

        if running {
            self.ingest_loop(&mut transport).await;
        }

        transport.close().await;
        let stats = self.shared.counters.snapshot();
        info!(frames = stats.frames, subjects = self.pipeline.registry().len(), "ingestion task ended");
        Stopped { registry: self.pipeline.into_registry(), transport }
    }

    async fn ingest_loop<T: Transport>(&mut self, transport: &mut T) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("ingestion cancelled");
                    return;
                }
                _ = sweep.tick() => {
                    let flagged = self.pipeline.sweep(Instant::now());
                    self.shared.publisher.publish_all(flagged);
                    continue;
                }
                polled = transport.poll() => polled,
            };

            self.count_filtered(transport);
            match polled {
                Ok(chunks) => {
                    if !chunks.is_empty() {
                        self.backoff.reset();
                    }
                    let mut snapshots = Vec::new();
                    for chunk in chunks {
                        snapshots.extend(self.pipeline.ingest(chunk));
                    }
                    self.shared.publisher.publish_all(snapshots);
                }
                Err(e) => {
                    warn!(error = %e, "transport failed");
                    transport.close().await;
                    self.pipeline.reset_framers();
                    if !self.establish(transport, ConnectionState::Reconnecting, Some(e)).await {
                        return;
                    }
                }
            }
        }
    }

    /// Open the transport, retrying with backoff. Returns false when the
    /// task should stop: cancelled, or out of attempts (state is `Faulted`).
    async fn establish<T: Transport>(
        &mut self,
        transport: &mut T,
        state: ConnectionState,
        mut failure: Option<TrackingError>,
    ) -> bool {
        let reconnecting = state == ConnectionState::Reconnecting;
        self.shared.set_state(state);

        loop {
            if let Some(e) = failure.take() {
                let Some(delay) = self.backoff.next_delay() else {
                    error!(attempts = self.backoff.attempts(), error = %e, "giving up on transport");
                    self.shared.set_state(ConnectionState::Faulted(e.to_string()));
                    return false;
                };
                debug!(attempt = self.backoff.attempts(), delay = ?delay, "retrying transport");
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                opened = transport.open() => opened,
            };
            match opened {
                Ok(()) => {
                    if reconnecting {
                        IngestCounters::add(&self.shared.counters.reconnects, 1);
                    }
                    self.shared.set_state(ConnectionState::Connected);
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, endpoint = %transport.endpoint(), "transport open failed");
                    failure = Some(e);
                }
            }
        }
    }

    fn count_filtered<T: Transport>(&mut self, transport: &T) {
        let filtered = transport.filtered();
        if filtered > self.filtered_seen {
            IngestCounters::add(&self.shared.counters.filtered, filtered - self.filtered_seen);
        }
        self.filtered_seen = filtered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::protocol::{encode_envelope, encode_envelope_raw, encode_hf};
    use crate::test_utils::sample_tracking;
    use crate::transport::MemoryTransport;
    use crate::types::{ProtocolVersion, SubjectId};
    use std::time::Duration;

    fn pipeline(config: &BridgeConfig) -> Pipeline {
        let registry = SubjectRegistry::new(config, Instant::now());
        Pipeline::new(config, registry, Arc::new(IngestCounters::default()))
    }

    #[test]
    fn pipeline_counts_every_outcome() {
        let config = BridgeConfig { format: WireFormat::Envelope, ..BridgeConfig::default() };
        let mut pipeline = pipeline(&config);
        let counters = Arc::clone(&pipeline.counters);

        let mut bytes = vec![0x00, 0x13];
        bytes.extend_from_slice(&encode_envelope(&ProtocolMessage::Tracking(sample_tracking(SubjectId(2), 1)), ProtocolVersion::V1).unwrap());
        bytes.extend_from_slice(&encode_envelope_raw(ProtocolVersion::new(9, 0), 0x01, SubjectId(2), &[0; 4]).unwrap());
        bytes.extend_from_slice(&encode_envelope_raw(ProtocolVersion::V1, 0x42, SubjectId(2), &[]).unwrap());
        bytes.extend_from_slice(&encode_envelope_raw(ProtocolVersion::V1, 0x02, SubjectId(2), &[1, 2]).unwrap());

        let snapshots = pipeline.ingest(RawChunk::new(bytes, Instant::now(), None));
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].subject, SubjectId(2));

        let stats = counters.snapshot();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.version_errors, 1);
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.discarded_bytes, 2);
        assert_eq!(stats.resyncs, 1);
    }

    #[test]
    fn senders_get_their_own_framer() {
        let mut pipeline = pipeline(&BridgeConfig::default());
        let packet = encode_hf(&sample_tracking(SubjectId(1), 1)).unwrap();
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1".parse().unwrap();

        // Interleaved halves from two senders still reassemble.
        assert!(pipeline.ingest(RawChunk::new(packet.slice(..30), Instant::now(), Some(a))).is_empty());
        assert!(pipeline.ingest(RawChunk::new(packet.slice(..30), Instant::now(), Some(b))).is_empty());
        assert_eq!(pipeline.ingest(RawChunk::new(packet.slice(30..), Instant::now(), Some(a))).len(), 1);
        assert_eq!(pipeline.framers.len(), 2);

        for port in 0..(MAX_FRAMERS as u16 + 10) {
            let sender = SocketAddr::from(([10, 0, 1, 1], port));
            pipeline.ingest(RawChunk::new(packet.slice(..10), Instant::now(), Some(sender)));
        }
        assert_eq!(pipeline.framers.len(), MAX_FRAMERS);
    }

    #[tokio::test]
    async fn publishes_and_returns_registry_on_cancel() {
        let config = BridgeConfig::default();
        let shared = Shared::new();
        let (sink, transport) = MemoryTransport::channel(16);
        let mut reader = shared.publisher.reader();
        let handle = Driver::spawn(transport, false, &config, SubjectRegistry::new(&config, Instant::now()), shared.clone());

        sink.send(encode_hf(&sample_tracking(SubjectId(1), 5)).unwrap(), None).await.unwrap();
        let table = reader.changed().await.unwrap();
        assert_eq!(table.get(SubjectId(1)).unwrap().device_time.packet_number, 5);
        assert_eq!(*shared.status.borrow(), ConnectionState::Connected);

        handle.cancel.cancel();
        let registry = handle.task.await.unwrap().registry;
        assert_eq!(registry.subject(SubjectId(1)).unwrap().stats().accepted, 1);
    }

    #[tokio::test]
    async fn lost_link_faults_after_retry_cap() {
        let config = BridgeConfig {
            reconnect: ReconnectPolicy { initial_backoff_ms: 1, max_backoff_ms: 4, max_attempts: 3 },
            ..BridgeConfig::default()
        };
        let shared = Shared::new();
        let mut status = shared.status.subscribe();
        let (sink, transport) = MemoryTransport::channel(4);
        let handle = Driver::spawn(transport, false, &config, SubjectRegistry::new(&config, Instant::now()), shared.clone());

        status.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        drop(sink);
        let faulted = status.wait_for(|s| matches!(s, ConnectionState::Faulted(_))).await.unwrap().clone();
        assert!(faulted.to_string().contains("sink"));

        tokio::time::timeout(Duration::from_secs(5), handle.task).await.unwrap().unwrap();
        assert_eq!(shared.counters.snapshot().reconnects, 0);
    }
}
