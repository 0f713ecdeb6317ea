//! Socket ownership and raw byte delivery
//!
//! A [`Transport`] produces [`RawChunk`]s and knows nothing about framing.
//! The driver owns exactly one transport and calls [`Transport::poll`] in its
//! select loop; `poll` waits until something is readable, then drains what is
//! pending without waiting again.

mod backoff;
mod memory;
mod tcp;
mod udp;

pub use backoff::Backoff;
pub use memory::{MemorySink, MemoryTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use std::net::SocketAddr;

use crate::Result;
use crate::config::{BridgeConfig, TransportMode};
use crate::types::RawChunk;

/// Upper bound on datagrams or reads drained by one `poll`.
pub(crate) const MAX_DRAIN: usize = 256;

/// Source of raw bytes for one endpoint.
///
/// Transports handle their own readiness. A failed `poll` means the link is
/// unusable until `open` succeeds again; the driver decides when to retry.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Bind (datagram) or connect (stream). Calling it on an open transport
    /// reopens it.
    async fn open(&mut self) -> Result<()>;

    /// Wait for data and return every chunk pending right now.
    ///
    /// Returns an empty vector on a spurious wakeup.
    async fn poll(&mut self) -> Result<Vec<RawChunk>>;

    /// Release the socket. Idempotent.
    async fn close(&mut self);

    fn mode(&self) -> TransportMode;

    /// `host:port` for logs and errors.
    fn endpoint(&self) -> String;

    /// Bound local address, once open.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Datagrams dropped by the sender filter since creation.
    fn filtered(&self) -> u64 {
        0
    }
}

#[async_trait::async_trait]
impl Transport for Box<dyn Transport> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn poll(&mut self) -> Result<Vec<RawChunk>> {
        (**self).poll().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    fn mode(&self) -> TransportMode {
        (**self).mode()
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn filtered(&self) -> u64 {
        (**self).filtered()
    }
}

/// Build the socket transport a configuration asks for. Nothing is opened.
pub fn from_config(config: &BridgeConfig) -> Box<dyn Transport> {
    match config.mode {
        TransportMode::Udp => Box::new(UdpTransport::new(config)),
        TransportMode::Tcp => Box::new(TcpTransport::new(config)),
    }
}
