use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

use super::{MAX_DRAIN, Transport};
use crate::config::TransportMode;
use crate::types::RawChunk;
use crate::{Result, TrackingError};

/// In-process transport fed through a [`MemorySink`].
///
/// For hosts that already own a socket, and for tests. The link fails once
/// every sink is dropped, the same way a socket fails when its peer goes away.
#[derive(Debug)]
pub struct MemoryTransport {
    rx: mpsc::Receiver<(Bytes, Option<SocketAddr>)>,
    mode: TransportMode,
    open: bool,
}

/// Sending half of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemorySink {
    tx: mpsc::Sender<(Bytes, Option<SocketAddr>)>,
}

impl MemoryTransport {
    /// Create a transport and its sink, buffering up to `capacity` chunks.
    pub fn channel(capacity: usize) -> (MemorySink, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (MemorySink { tx }, Self { rx, mode: TransportMode::Udp, open: false })
    }

    /// Mode reported to the driver; defaults to datagram semantics.
    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }
}

impl MemorySink {
    /// Queue bytes as if received from `source`. Fails once the transport is gone.
    pub async fn send(&self, bytes: impl Into<Bytes>, source: Option<SocketAddr>) -> Result<()> {
        self.tx
            .send((bytes.into(), source))
            .await
            .map_err(|_| TrackingError::transport("send to dropped transport", "memory"))
    }

    /// Queue bytes without waiting. Fails when the buffer is full or the transport is gone.
    pub fn try_send(&self, bytes: impl Into<Bytes>, source: Option<SocketAddr>) -> Result<()> {
        self.tx
            .try_send((bytes.into(), source))
            .map_err(|e| TrackingError::transport(format!("queue chunk: {}", e), "memory"))
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<()> {
        if self.rx.is_closed() && self.rx.is_empty() {
            return Err(TrackingError::connection_failed("memory", "every sink was dropped"));
        }
        self.open = true;
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<RawChunk>> {
        if !self.open {
            return Err(TrackingError::transport("read on closed transport", "memory"));
        }
        let Some((bytes, source)) = self.rx.recv().await else {
            self.open = false;
            return Err(TrackingError::transport("every sink was dropped", "memory"));
        };

        let mut chunks = vec![RawChunk::new(bytes, Instant::now(), source)];
        while chunks.len() < MAX_DRAIN {
            match self.rx.try_recv() {
                Ok((bytes, source)) => chunks.push(RawChunk::new(bytes, Instant::now(), source)),
                Err(_) => break,
            }
        }
        Ok(chunks)
    }

    async fn close(&mut self) {
        if self.open {
            debug!("memory transport closed");
        }
        self.open = false;
    }

    fn mode(&self) -> TransportMode {
        self.mode
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}
