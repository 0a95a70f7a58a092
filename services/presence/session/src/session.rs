//! Session facade: configuration, statistics and the driver task.
//!
//! A [`Session`] spawns one driver task that owns the
//! [`ConnectionManager`](crate::manager::ConnectionManager). `enable` and
//! `disable` only post commands to it, so they are safe to call from any
//! context and never block.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::activity::{ActivityLabels, ContextSource};
use crate::manager::{ClientId, ConnectionManager, ConnectionState, Event, PresenceEventHandler};
use crate::transport::Connector;

/// Configuration for a presence session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Time between connect attempts while disconnected
    pub reconnect_interval: Duration,
    /// Time between presence refreshes while connected
    pub update_interval: Duration,
    /// Upper bound on a single transport open
    pub connect_timeout: Duration,
    /// Fixed strings placed in every presence payload
    pub labels: ActivityLabels,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(15),
            update_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            labels: ActivityLabels::default(),
        }
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Transport opens attempted
    pub connect_attempts: u64,
    /// Handshakes written to a fresh transport
    pub handshakes_sent: u64,
    /// Presence frames sent
    pub frames_sent: u64,
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes queued for sending
    pub bytes_out: u64,
    /// Timestamp of last received data
    pub last_frame_in: Option<Instant>,
    /// Timestamp of last sent packet
    pub last_frame_out: Option<Instant>,
}

/// Handle to a running presence session
pub struct Session {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ConnectionState>,
    stats: watch::Receiver<SessionStats>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    /// Spawn a disabled session on the current runtime
    pub fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        context: Arc<dyn ContextSource>,
    ) -> Self {
        Self::spawn_with_handler(config, connector, context, None)
    }

    /// Spawn a disabled session that reports to `event_handler`
    pub fn spawn_with_handler(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        context: Arc<dyn ContextSource>,
        event_handler: Option<Arc<dyn PresenceEventHandler>>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(config, connector, context, events.clone());
        if let Some(handler) = event_handler {
            manager.set_event_handler(handler);
        }
        let state = manager.subscribe_state();
        let stats = manager.subscribe_stats();
        let driver = tokio::spawn(manager.run(rx));

        Self {
            events,
            state,
            stats,
            driver: Some(driver),
        }
    }

    /// Start connecting. No-op if already enabled.
    pub fn enable(&self, client_id: impl Into<ClientId>) {
        self.post(Event::Enable(client_id.into()));
    }

    /// Stop the session and drop any transport
    pub fn disable(&self) {
        self.post(Event::Disable);
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Snapshot of the session statistics
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Disable the session and wait for the driver to finish
    pub async fn shutdown(mut self) {
        self.post(Event::Shutdown);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Session driver is no longer running");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
