use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use super::{MAX_DRAIN, Transport};
use crate::config::{BridgeConfig, TransportMode};
use crate::types::RawChunk;
use crate::{Result, TrackingError};

/// Stream client. Reads are delivered as they arrive; frame boundaries are
/// the framer's business.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    endpoint: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    buffer: BytesMut,
    capacity: usize,
}

impl TcpTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            endpoint: config.endpoint(),
            connect_timeout: config.connect_timeout(),
            stream: None,
            peer: None,
            buffer: BytesMut::with_capacity(config.recv_buffer_size),
            capacity: config.recv_buffer_size,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        self.stream = None;
        self.peer = None;

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TrackingError::transport_io("connect", self.endpoint(), e)),
            Err(_) => return Err(TrackingError::Timeout { duration: self.connect_timeout }),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle on tracking stream");
        }

        self.peer = stream.peer_addr().ok();
        info!(peer = ?self.peer, endpoint = %self.endpoint(), "TCP connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<RawChunk>> {
        let endpoint = &self.endpoint;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TrackingError::transport("read on closed stream", endpoint.as_str()))?;

        self.buffer.clear();
        self.buffer.reserve(self.capacity);
        let read = stream
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| TrackingError::transport_io("read", endpoint.as_str(), e))?;
        if read == 0 {
            return Err(TrackingError::transport("connection closed by peer", endpoint.as_str()));
        }

        // Take whatever else is already queued without waiting.
        for _ in 1..MAX_DRAIN {
            if self.buffer.len() >= self.capacity {
                break;
            }
            match stream.try_read_buf(&mut self.buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TrackingError::transport_io("read", endpoint.as_str(), e)),
            }
        }

        trace!(bytes = self.buffer.len(), "stream read");
        let bytes = self.buffer.split().freeze();
        Ok(vec![RawChunk::new(bytes, Instant::now(), self.peer)])
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(endpoint = %self.endpoint(), "TCP stream closed");
        }
        self.peer = None;
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Tcp
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }
}
