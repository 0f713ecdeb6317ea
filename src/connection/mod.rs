//! Connection handle: lifecycle control and the consumer read surface
//!
//! A [`TrackingConnection`] owns one ingestion task. Control operations
//! (`connect`, `reconfigure`, `disconnect`) are async and take `&mut self`;
//! the read surface (`read`, `read_all`, `status`, `stats`) takes `&self`,
//! never awaits and never touches the network.

use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info};

use crate::Result;
use crate::config::{BridgeConfig, TransportMode};
use crate::driver::{Driver, DriverHandle, IngestStats, Shared};
use crate::publisher::SnapshotReader;
use crate::registry::SubjectRegistry;
use crate::stream::ThrottleExt;
use crate::transport::{self, Transport};
use crate::types::{ConnectionState, Snapshot, SubjectId, UpdateRate};

#[cfg(test)]
mod tests;

/// Live camera-tracking connection for one endpoint.
///
/// Several endpoints are served by several connections; each has its own
/// state, subjects and timeline.
pub struct TrackingConnection {
    config: BridgeConfig,
    shared: Shared,
    /// Time zero of the local timeline
    epoch: Instant,
    driver: Option<DriverHandle<Box<dyn Transport>>>,
    /// Registry held while no task runs
    registry: Option<SubjectRegistry>,
    /// Caller-supplied transport held while no task runs
    transport: Option<Box<dyn Transport>>,
    custom_transport: bool,
    local_addr: Option<SocketAddr>,
}

impl TrackingConnection {
    /// Validate `config`, open the socket it names and start ingesting.
    ///
    /// UDP binds before this returns, so a port in use or a permission
    /// problem is reported here. TCP connects in the background with
    /// backoff; watch [`status`](Self::status) for the outcome.
    pub async fn connect(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        info!(endpoint = %config.endpoint(), mode = ?config.mode, format = ?config.format, "connecting");

        let mut connection = Self::idle(config, None);
        connection.start().await?;
        Ok(connection)
    }

    /// Start ingesting from a caller-supplied transport, e.g. a
    /// [`MemoryTransport`](crate::transport::MemoryTransport). The transport is
    /// opened by the ingestion task; `mode`, `host` and `port` in `config` are
    /// not used for I/O.
    pub async fn with_transport<T: Transport>(config: BridgeConfig, transport: T) -> Result<Self> {
        config.validate()?;
        info!(endpoint = %transport.endpoint(), "connecting with supplied transport");

        let mut connection = Self::idle(config, Some(Box::new(transport)));
        connection.start().await?;
        Ok(connection)
    }

    fn idle(config: BridgeConfig, transport: Option<Box<dyn Transport>>) -> Self {
        let epoch = Instant::now();
        Self {
            registry: Some(SubjectRegistry::new(&config, epoch)),
            custom_transport: transport.is_some(),
            transport,
            config,
            shared: Shared::new(),
            epoch,
            driver: None,
            local_addr: None,
        }
    }

    async fn start(&mut self) -> Result<()> {
        let registry = match self.registry.take() {
            Some(registry) => registry,
            None => SubjectRegistry::new(&self.config, self.epoch),
        };

        let (transport, opened): (Box<dyn Transport>, bool) = match self.transport.take() {
            Some(transport) => (transport, false),
            None => {
                let mut transport = transport::from_config(&self.config);
                // UDP binds here so resource failures reach the caller.
                let bind_now = self.config.mode == TransportMode::Udp;
                if bind_now {
                    self.shared.set_state(ConnectionState::Connecting);
                    if let Err(e) = transport.open().await {
                        error!(error = %e, "cannot bind tracking socket");
                        self.shared.set_state(ConnectionState::Faulted(e.to_string()));
                        self.registry = Some(registry);
                        return Err(e);
                    }
                }
                (transport, bind_now)
            }
        };

        self.local_addr = transport.local_addr();
        self.driver = Some(Driver::spawn(transport, opened, &self.config, registry, self.shared.clone()));
        Ok(())
    }

    /// Cancel the task and wait until it has closed the socket.
    async fn stop(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        driver.cancel.cancel();
        match driver.task.await {
            Ok(stopped) => {
                self.registry = Some(stopped.registry);
                if self.custom_transport {
                    self.transport = Some(stopped.transport);
                }
            }
            Err(e) => error!(error = %e, "ingestion task did not shut down cleanly"),
        }
        self.local_addr = None;
    }

    /// Stop ingesting. On return the socket is closed and no snapshot is
    /// published any more; the last snapshots stay readable.
    pub async fn disconnect(&mut self) {
        self.stop().await;
        self.shared.set_state(ConnectionState::Disconnected);
        info!("disconnected");
    }

    /// Apply a new configuration.
    ///
    /// An invalid configuration is rejected before anything stops. Otherwise
    /// the task restarts with the new settings; subjects, counters and the
    /// timeline are kept.
    pub async fn reconfigure(&mut self, config: BridgeConfig) -> Result<()> {
        config.validate()?;
        info!(endpoint = %config.endpoint(), mode = ?config.mode, "reconfiguring");

        self.stop().await;
        if let Some(registry) = self.registry.as_mut() {
            registry.reconfigure(&config);
        }
        self.config = config;
        self.start().await
    }

    /// Latest snapshot for a subject, including one flagged stale. `None`
    /// until the subject first reports.
    pub fn read(&self, subject: SubjectId) -> Option<Arc<Snapshot>> {
        self.shared.publisher.read(subject)
    }

    /// Every non-stale subject, ordered by id.
    pub fn read_all(&self) -> Vec<Arc<Snapshot>> {
        self.shared.publisher.read_all()
    }

    /// Read handle usable from another thread after this connection moves.
    pub fn reader(&self) -> SnapshotReader {
        self.shared.publisher.reader()
    }

    pub fn status(&self) -> ConnectionState {
        self.shared.status.borrow().clone()
    }

    /// Current state, then every change.
    pub fn status_updates(&self) -> impl Stream<Item = ConnectionState> + 'static {
        WatchStream::new(self.shared.status.subscribe())
    }

    /// Live snapshots on every publication, or at most `rate` times a second
    /// (latest wins).
    pub fn subscribe(&self, rate: UpdateRate) -> impl Stream<Item = Vec<Arc<Snapshot>>> + 'static {
        let tables = WatchStream::from_changes(self.shared.publisher.subscribe());
        let source_hz = f64::from(self.config.default_frame_rate);

        match rate.throttle_interval(source_hz) {
            None => tables.map(|table| table.live()).boxed(),
            Some(interval) => {
                debug!(interval = ?interval, "throttled subscription");
                tables.throttle(interval).map(|table| table.live()).boxed()
            }
        }
    }

    /// Ingestion counters since the connection was created.
    pub fn stats(&self) -> IngestStats {
        self.shared.counters.snapshot()
    }

    /// Bound UDP address. `None` for TCP and while disconnected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Seconds on the local timeline that snapshot timestamps use.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl Drop for TrackingConnection {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            debug!("dropping tracking connection");
            driver.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for TrackingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingConnection")
            .field("endpoint", &self.config.endpoint())
            .field("status", &self.status())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
