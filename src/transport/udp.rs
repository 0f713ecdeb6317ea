use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use super::{MAX_DRAIN, Transport};
use crate::config::{BridgeConfig, TransportMode};
use crate::types::RawChunk;
use crate::{Result, TrackingError};

/// Datagram listener. Each datagram becomes one chunk tagged with its sender.
#[derive(Debug)]
pub struct UdpTransport {
    host: String,
    port: u16,
    sender_filter: Option<IpAddr>,
    socket: Option<UdpSocket>,
    /// Address actually bound; reused on reopen so an ephemeral port is kept
    bound: Option<SocketAddr>,
    recv_buffer: Vec<u8>,
    filtered: u64,
}

impl UdpTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            sender_filter: config.sender_filter,
            socket: None,
            bound: None,
            recv_buffer: vec![0; config.recv_buffer_size],
            filtered: 0,
        }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| TrackingError::transport("receive on closed socket", self.endpoint()))
    }

    fn accepts(&self, sender: SocketAddr) -> bool {
        self.sender_filter.is_none_or(|allowed| allowed == sender.ip())
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn open(&mut self) -> Result<()> {
        self.socket = None;
        let socket = match self.bound {
            Some(addr) => UdpSocket::bind(addr).await,
            None => UdpSocket::bind((self.host.as_str(), self.port)).await,
        }
        .map_err(|e| TrackingError::transport_io("bind", self.endpoint(), e))?;

        let local = socket
            .local_addr()
            .map_err(|e| TrackingError::transport_io("query local address", self.endpoint(), e))?;
        info!(local = %local, filter = ?self.sender_filter, "UDP socket bound");
        self.bound = Some(local);
        self.socket = Some(socket);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<RawChunk>> {
        self.socket()?
            .readable()
            .await
            .map_err(|e| TrackingError::transport_io("wait for datagrams", self.endpoint(), e))?;

        let mut chunks = Vec::new();
        let mut filtered = 0u64;
        {
            let socket = self
                .socket
                .as_ref()
                .ok_or_else(|| TrackingError::transport("receive on closed socket", self.endpoint()))?;
            while chunks.len() < MAX_DRAIN {
                match socket.try_recv_from(&mut self.recv_buffer) {
                    Ok((len, sender)) => {
                        if !self.accepts(sender) {
                            filtered += 1;
                            continue;
                        }
                        trace!(sender = %sender, len, "datagram");
                        chunks.push(RawChunk::new(
                            bytes::Bytes::copy_from_slice(&self.recv_buffer[..len]),
                            Instant::now(),
                            Some(sender),
                        ));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    // ICMP port unreachable from an earlier send surfaces here on some platforms.
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                        debug!(error = %e, "ignoring connection reset on UDP socket");
                    }
                    Err(e) => return Err(TrackingError::transport_io("receive", self.endpoint(), e)),
                }
            }
        }

        if filtered > 0 {
            debug!(filtered, "dropped datagrams from unexpected senders");
            self.filtered += filtered;
        }
        Ok(chunks)
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!(endpoint = %self.endpoint(), "UDP socket closed");
        }
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Udp
    }

    fn endpoint(&self) -> String {
        match self.bound {
            Some(addr) => addr.to_string(),
            None if self.host.contains(':') => format!("[{}]:{}", self.host, self.port),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and(self.bound)
    }

    fn filtered(&self) -> u64 {
        self.filtered
    }
}
