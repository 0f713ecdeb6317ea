//! Latest-value snapshot hand-off
//!
//! The ingestion task publishes; any number of consumers read. State lives in
//! an immutable [`SnapshotTable`] behind a `tokio::sync::watch` channel: a
//! publication clones the table outside the lock, updates the copy and swaps
//! it in, so a reader holds the lock only long enough to clone an `Arc`.
//! Readers never wait on the writer and never see a half-written snapshot.
//!
//! This is latest-value only. A consumer sampling slower than the stream
//! misses intermediate snapshots by design of the hand-off.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

use crate::types::{Snapshot, SubjectId};

/// Immutable set of the latest snapshot per subject.
#[derive(Debug, Clone, Default)]
pub struct SnapshotTable {
    entries: BTreeMap<SubjectId, Arc<Snapshot>>,
    generation: u64,
}

impl SnapshotTable {
    /// Latest snapshot for a subject, stale or not.
    pub fn get(&self, subject: SubjectId) -> Option<Arc<Snapshot>> {
        self.entries.get(&subject).cloned()
    }

    /// Non-stale snapshots ordered by subject id.
    pub fn live(&self) -> Vec<Arc<Snapshot>> {
        self.entries.values().filter(|s| !s.stale).cloned().collect()
    }

    /// All snapshots ordered by subject id, including stale ones.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Snapshot>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of publications that produced this table.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Write side of the hand-off. Only the ingestion task publishes.
#[derive(Debug)]
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<SnapshotTable>>,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(SnapshotTable::default()));
        Self { tx }
    }

    /// Replace the subject's snapshot. The subject id comes from the snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        self.publish_all(std::iter::once(snapshot));
    }

    /// Replace several snapshots in one swap.
    pub fn publish_all(&self, snapshots: impl IntoIterator<Item = Snapshot>) {
        let mut snapshots = snapshots.into_iter().peekable();
        if snapshots.peek().is_none() {
            return;
        }

        let current = self.tx.borrow().clone();
        let mut next = SnapshotTable::clone(&current);
        for snapshot in snapshots {
            trace!(subject = %snapshot.subject, version = snapshot.version, stale = snapshot.stale, "publishing snapshot");
            next.entries.insert(snapshot.subject, Arc::new(snapshot));
        }
        next.generation += 1;
        self.tx.send_replace(Arc::new(next));
    }

    /// Latest snapshot for a subject, including a stale one.
    pub fn read(&self, subject: SubjectId) -> Option<Arc<Snapshot>> {
        self.tx.borrow().get(subject)
    }

    /// Non-stale snapshots ordered by subject id.
    pub fn read_all(&self) -> Vec<Arc<Snapshot>> {
        self.tx.borrow().live()
    }

    /// The whole current table.
    pub fn table(&self) -> Arc<SnapshotTable> {
        self.tx.borrow().clone()
    }

    /// Read handle for another thread or task.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader { rx: self.tx.subscribe() }
    }

    /// Push hook: the receiver is notified on every publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SnapshotTable>> {
        self.tx.subscribe()
    }
}

/// Cloneable read-only handle on a publisher.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<SnapshotTable>>,
}

impl SnapshotReader {
    pub fn read(&self, subject: SubjectId) -> Option<Arc<Snapshot>> {
        self.rx.borrow().get(subject)
    }

    pub fn read_all(&self) -> Vec<Arc<Snapshot>> {
        self.rx.borrow().live()
    }

    pub fn table(&self) -> Arc<SnapshotTable> {
        self.rx.borrow().clone()
    }

    /// Wait for the next publication. Errors once the publisher is gone.
    pub async fn changed(&mut self) -> Result<Arc<SnapshotTable>, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
