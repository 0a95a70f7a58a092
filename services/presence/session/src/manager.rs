//! Connection state machine for a presence session.
//!
//! The [`ConnectionManager`] owns the transport, the connection state and both
//! periodic cycles. Everything that can happen to a session (commands, timer
//! ticks, connect results, transport traffic) arrives as an [`Event`] on one
//! channel and is handled to completion before the next one is looked at.
//! Handlers never await; work that needs to wait (opening a socket, writing
//! bytes) runs in spawned tasks that report back through the same channel.

use bytes::{Bytes, BytesMut};
use presence_wire::{pack_json, Opcode, PacketDecoder};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::activity::{self, ContextSource, LastKnownSnapshot};
use crate::error::{ConfigWarning, SessionError};
use crate::handshake::build_handshake;
use crate::scheduler::{Cycle, Scheduler, TimerId};
use crate::session::{SessionConfig, SessionStats};
use crate::transport::{BoxedStream, Connector, IpcStream};

/// Identifies one adopted transport
pub type TransportId = u64;

/// Identifies one connect attempt
pub type AttemptId = u64;

/// Session-wide connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport
    #[default]
    Disconnected,
    /// Transport open, handshake sent, waiting for the peer
    Connecting,
    /// Handshake acknowledged, presence updates flowing
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Client identifier sent in the handshake
#[derive(Clone)]
pub enum ClientId {
    /// Fixed identifier
    Static(String),
    /// Resolved every time a handshake is built
    Resolver(Arc<dyn Fn() -> Option<String> + Send + Sync>),
}

impl ClientId {
    /// Identifier resolved by calling `resolver`
    pub fn from_fn<F>(resolver: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        ClientId::Resolver(Arc::new(resolver))
    }

    /// Current identifier, if any. Empty strings count as absent.
    pub fn resolve(&self) -> Option<String> {
        let id = match self {
            ClientId::Static(id) => Some(id.clone()),
            ClientId::Resolver(resolver) => resolver(),
        };
        id.filter(|id| !id.is_empty())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Static(id) => f.debug_tuple("Static").field(id).finish(),
            ClientId::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        ClientId::Static(id)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        ClientId::Static(id.to_string())
    }
}

/// Trait for observing session changes
pub trait PresenceEventHandler: Send + Sync + fmt::Debug {
    /// Notify that the connection state changed
    fn notify_state_changed(&self, state: ConnectionState);
    /// Notify about a non-fatal configuration problem
    fn notify_warning(&self, warning: ConfigWarning);
}

/// Everything the session driver reacts to
pub enum Event {
    /// Start the session
    Enable(ClientId),
    /// Stop the session and drop the transport
    Disable,
    /// Stop the driver
    Shutdown,
    /// Reconnect timer fired
    ReconnectTick(TimerId),
    /// Update timer fired
    UpdateTick(TimerId),
    /// A connect attempt finished
    Opened {
        /// Attempt that produced this result
        attempt: AttemptId,
        /// The stream, or why it could not be opened
        result: Result<BoxedStream, SessionError>,
    },
    /// Bytes arrived on a transport
    Data {
        /// Transport the bytes arrived on
        transport: TransportId,
        /// Number of bytes read
        len: usize,
    },
    /// A transport closed or failed
    Closed {
        /// Transport that closed
        transport: TransportId,
        /// What happened
        reason: String,
    },
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Enable(id) => f.debug_tuple("Enable").field(id).finish(),
            Event::Disable => f.write_str("Disable"),
            Event::Shutdown => f.write_str("Shutdown"),
            Event::ReconnectTick(id) => f.debug_tuple("ReconnectTick").field(id).finish(),
            Event::UpdateTick(id) => f.debug_tuple("UpdateTick").field(id).finish(),
            Event::Opened { attempt, result } => f
                .debug_struct("Opened")
                .field("attempt", attempt)
                .field("ok", &result.is_ok())
                .finish(),
            Event::Data { transport, len } => f
                .debug_struct("Data")
                .field("transport", transport)
                .field("len", len)
                .finish(),
            Event::Closed { transport, reason } => f
                .debug_struct("Closed")
                .field("transport", transport)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// The live transport: a reader task and a queue into a writer task
struct ActiveTransport {
    id: TransportId,
    writer: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

impl ActiveTransport {
    /// Split `stream` and spawn its reader and writer tasks
    fn spawn(id: TransportId, stream: BoxedStream, events: mpsc::UnboundedSender<Event>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, queue) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(id, read_half, events.clone()));
        tokio::spawn(write_loop(id, write_half, queue, events));

        Self { id, writer, reader }
    }

    /// Queue `bytes` for writing
    fn send(&self, bytes: Bytes) -> Result<(), SessionError> {
        self.writer.send(bytes).map_err(|_| SessionError::TransportSend)
    }
}

impl Drop for ActiveTransport {
    fn drop(&mut self) {
        // Dropping `writer` ends the write loop, which shuts the write half.
        self.reader.abort();
    }
}

async fn read_loop(
    id: TransportId,
    mut reader: ReadHalf<Box<dyn IpcStream>>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut decoder = PacketDecoder::new();

    let reason = loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break "peer closed the connection".to_string(),
            Ok(len) => {
                trace!("Read {} bytes on transport {}", len, id);
                // Decoding is for visibility only; the peer's replies are not acted on.
                loop {
                    match decoder.decode(&mut buffer) {
                        Ok(Some(packet)) => trace!(
                            "Peer sent opcode {} ({} bytes) on transport {}",
                            packet.opcode,
                            packet.length(),
                            id
                        ),
                        Ok(None) => break,
                        Err(e) => {
                            trace!("Discarding undecodable input on transport {}: {}", id, e);
                            buffer.clear();
                            break;
                        }
                    }
                }
                if events.send(Event::Data { transport: id, len }).is_err() {
                    return;
                }
            }
            Err(e) => break format!("read failed: {}", e),
        }
    };

    let _ = events.send(Event::Closed { transport: id, reason });
}

async fn write_loop(
    id: TransportId,
    mut writer: WriteHalf<Box<dyn IpcStream>>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            let _ = events.send(Event::Closed {
                transport: id,
                reason: format!("write failed: {}", e),
            });
            return;
        }
        trace!("Wrote {} bytes on transport {}", bytes.len(), id);
    }
    let _ = writer.shutdown().await;
}

/// State machine driving one presence session
pub struct ConnectionManager {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    context: Arc<dyn ContextSource>,
    events: mpsc::UnboundedSender<Event>,
    event_handler: Option<Arc<dyn PresenceEventHandler>>,

    enabled: bool,
    client_id: Option<ClientId>,
    state: ConnectionState,
    scheduler: Scheduler,
    reconnect: Cycle,
    update: Cycle,
    next_attempt: AttemptId,
    pending_attempt: Option<AttemptId>,
    next_transport: TransportId,
    transport: Option<ActiveTransport>,
    last_snapshot: Option<LastKnownSnapshot>,

    state_tx: watch::Sender<ConnectionState>,
    stats_tx: watch::Sender<SessionStats>,
}

impl ConnectionManager {
    /// Create a disabled, disconnected manager. Timers and tasks it spawns
    /// report back through `events`.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        context: Arc<dyn ContextSource>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (stats_tx, _) = watch::channel(SessionStats::default());
        Self {
            config,
            connector,
            context,
            events,
            event_handler: None,
            enabled: false,
            client_id: None,
            state: ConnectionState::Disconnected,
            scheduler: Scheduler::new(),
            reconnect: Cycle::new("reconnect"),
            update: Cycle::new("update"),
            next_attempt: 1,
            pending_attempt: None,
            next_transport: 1,
            transport: None,
            last_snapshot: None,
            state_tx,
            stats_tx,
        }
    }

    /// Set the event handler
    pub fn set_event_handler(&mut self, handler: Arc<dyn PresenceEventHandler>) {
        self.event_handler = Some(handler);
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the reconnect cycle is running
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.is_running()
    }

    /// Whether the update cycle is running
    pub fn is_updating(&self) -> bool {
        self.update.is_running()
    }

    /// Id of the transport currently held, if any
    pub fn transport_id(&self) -> Option<TransportId> {
        self.transport.as_ref().map(|t| t.id)
    }

    /// Observe state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Observe statistics
    pub fn subscribe_stats(&self) -> watch::Receiver<SessionStats> {
        self.stats_tx.subscribe()
    }

    /// Consume events until shutdown, then tear everything down
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.disable();
        debug!("Session driver stopped");
    }

    /// Handle one event. Returns `false` once the driver should stop.
    pub fn handle(&mut self, event: Event) -> bool {
        trace!("Handling {:?} in state {}", event, self.state);
        match event {
            Event::Enable(client_id) => self.enable(client_id),
            Event::Disable => self.disable(),
            Event::Shutdown => return false,
            Event::ReconnectTick(timer) => self.on_reconnect_tick(timer),
            Event::UpdateTick(timer) => self.on_update_tick(timer),
            Event::Opened { attempt, result } => self.on_opened(attempt, result),
            Event::Data { transport, len } => self.on_data(transport, len),
            Event::Closed { transport, reason } => self.on_closed(transport, reason),
        }
        debug_assert!(
            !(self.reconnect.is_running() && self.update.is_running()),
            "reconnect and update cycles running together"
        );
        true
    }

    /// Start the session. No-op if already enabled.
    pub fn enable(&mut self, client_id: ClientId) {
        if self.enabled {
            debug!("Session already enabled");
            return;
        }
        info!("Enabling presence session");
        self.enabled = true;

        if client_id.resolve().is_none() {
            self.warn(ConfigWarning::MissingClientId);
        }
        if !self.connector.is_supported() {
            self.warn(ConfigWarning::UnsupportedPlatform);
        }
        self.client_id = Some(client_id);

        self.start_reconnect_cycle();
    }

    /// Stop both cycles, drop the transport and return to Disconnected
    pub fn disable(&mut self) {
        if self.enabled {
            info!("Disabling presence session");
        }
        self.enabled = false;
        self.update.cancel(&self.scheduler);
        self.reconnect.cancel(&self.scheduler);
        // An attempt still in flight will find itself stale and be dropped.
        self.pending_attempt = None;
        self.transport = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_reconnect_tick(&mut self, timer: TimerId) {
        if !self.enabled || !self.reconnect.owns(timer) {
            trace!("Ignoring stale reconnect tick {}", timer);
            return;
        }

        match self.state {
            // A transport is held; only its close signal returns us to
            // Disconnected.
            ConnectionState::Connected | ConnectionState::Connecting => return,
            ConnectionState::Disconnected => {}
        }

        if self.pending_attempt.is_some() {
            trace!("Connect attempt still in flight");
            return;
        }
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.pending_attempt = Some(attempt);
        self.stats_tx.send_modify(|stats| stats.connect_attempts += 1);

        let connector = self.connector.clone();
        let events = self.events.clone();
        let timeout = self.config.connect_timeout;
        trace!("Starting connect attempt {}", attempt);

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::ConnectTimeout),
            };
            let _ = events.send(Event::Opened { attempt, result });
        });
    }

    fn on_opened(&mut self, attempt: AttemptId, result: Result<BoxedStream, SessionError>) {
        if self.pending_attempt != Some(attempt) {
            if result.is_ok() {
                debug!("Closing transport from stale connect attempt {}", attempt);
            }
            return;
        }
        self.pending_attempt = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Peer not reachable: {}", e);
                return;
            }
        };

        let id = self.next_transport;
        self.next_transport += 1;
        let transport = ActiveTransport::spawn(id, stream, self.events.clone());

        match self.send_handshake(&transport) {
            Ok(len) => {
                info!("Transport {} open, handshake sent", id);
                self.stats_tx.send_modify(|stats| {
                    stats.handshakes_sent += 1;
                    stats.bytes_out += len as u64;
                    stats.last_frame_out = Some(Instant::now());
                });
                self.transport = Some(transport);
                self.set_state(ConnectionState::Connecting);
            }
            Err(e) => {
                debug!("Handshake on transport {} failed: {}; closing", id, e);
            }
        }
    }

    fn send_handshake(&self, transport: &ActiveTransport) -> Result<usize, SessionError> {
        let client_id = self.client_id.as_ref().and_then(ClientId::resolve);
        let bytes = build_handshake(client_id.as_deref())?;
        let len = bytes.len();
        transport.send(bytes)?;
        Ok(len)
    }

    fn on_data(&mut self, transport: TransportId, len: usize) {
        if !self.is_current(transport) {
            trace!("Ignoring data on stale transport {}", transport);
            return;
        }
        self.stats_tx.send_modify(|stats| {
            stats.bytes_in += len as u64;
            stats.last_frame_in = Some(Instant::now());
        });

        if self.state != ConnectionState::Connecting {
            return;
        }

        // Any reply at all counts as the handshake acknowledgment.
        info!("Peer acknowledged handshake on transport {}", transport);
        self.reconnect.cancel(&self.scheduler);
        self.last_snapshot = None;
        self.set_state(ConnectionState::Connected);
        self.start_update_cycle();
    }

    fn on_closed(&mut self, transport: TransportId, reason: String) {
        if !self.is_current(transport) {
            trace!("Ignoring close of stale transport {}", transport);
            return;
        }
        self.transport_lost(&reason);
    }

    fn on_update_tick(&mut self, timer: TimerId) {
        if !self.update.owns(timer) || self.state != ConnectionState::Connected {
            trace!("Ignoring stale update tick {}", timer);
            return;
        }

        let context = self.context.current();
        if self
            .last_snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.matches(&context))
        {
            trace!("Presence unchanged; skipping update");
            return;
        }
        self.last_snapshot = Some(LastKnownSnapshot::of(&context));

        let command = activity::build(
            &context,
            &self.config.labels,
            std::process::id(),
            activity::now_nonce(),
        );

        let sent = pack_json(Opcode::Frame, &command)
            .map_err(SessionError::from)
            .and_then(|bytes| {
                let len = bytes.len();
                match &self.transport {
                    Some(transport) => transport.send(bytes).map(|_| len),
                    None => Err(SessionError::TransportSend),
                }
            });

        match sent {
            Ok(len) => {
                debug!("Sent presence update for {}", context.display_name);
                self.stats_tx.send_modify(|stats| {
                    stats.frames_sent += 1;
                    stats.bytes_out += len as u64;
                    stats.last_frame_out = Some(Instant::now());
                });
            }
            Err(e) => self.transport_lost(&e.to_string()),
        }
    }

    /// Collapse back to the reconnect cycle after any transport failure
    fn transport_lost(&mut self, reason: &str) {
        info!("Transport lost ({}); reconnecting", reason);
        self.update.cancel(&self.scheduler);
        self.transport = None;
        self.set_state(ConnectionState::Disconnected);
        if self.enabled {
            self.start_reconnect_cycle();
        }
    }

    fn start_reconnect_cycle(&mut self) {
        let events = self.events.clone();
        let period = self.config.reconnect_interval;
        self.reconnect.start(&mut self.scheduler, period, move |timer| {
            let _ = events.send(Event::ReconnectTick(timer));
        });
    }

    fn start_update_cycle(&mut self) {
        let events = self.events.clone();
        let period = self.config.update_interval;
        self.update.start(&mut self.scheduler, period, move |timer| {
            let _ = events.send(Event::UpdateTick(timer));
        });
    }

    fn is_current(&self, transport: TransportId) -> bool {
        self.transport.as_ref().map(|t| t.id) == Some(transport)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Connection state {} -> {}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        if let Some(handler) = &self.event_handler {
            handler.notify_state_changed(state);
        }
    }

    fn warn(&self, warning: ConfigWarning) {
        warn!("{}", warning);
        if let Some(handler) = &self.event_handler {
            handler.notify_warning(warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::PresenceContext;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    /// Always connects, handing the peer half to the test
    struct DuplexConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self) -> Result<BoxedStream, SessionError> {
            let (client, server) = tokio::io::duplex(4096);
            let _ = self.peers.send(server);
            Ok(Box::new(client))
        }
    }

    fn manager() -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<Event>,
        mpsc::UnboundedReceiver<DuplexStream>,
    ) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            SessionConfig::default(),
            Arc::new(DuplexConnector { peers: peers_tx }),
            Arc::new(PresenceContext::default),
            events_tx,
        );
        (manager, events, peers)
    }

    async fn drive_until<F>(
        manager: &mut ConnectionManager,
        events: &mut mpsc::UnboundedReceiver<Event>,
        done: F,
    ) where
        F: Fn(&ConnectionManager) -> bool,
    {
        while !done(manager) {
            let event = events.recv().await.unwrap();
            assert!(manager.handle(event));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_replaced_transport_are_ignored() {
        let (mut manager, mut events, mut peers) = manager();
        manager.enable(ClientId::from("123"));

        drive_until(&mut manager, &mut events, |m| m.transport_id() == Some(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        let _first = peers.recv().await.unwrap();

        manager.handle(Event::Closed {
            transport: 1,
            reason: "peer closed".to_string(),
        });
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        drive_until(&mut manager, &mut events, |m| m.transport_id() == Some(2)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        let mut second = peers.recv().await.unwrap();

        // Late traffic from transport 1 must not ack or tear down transport 2.
        manager.handle(Event::Data {
            transport: 1,
            len: 1,
        });
        manager.handle(Event::Closed {
            transport: 1,
            reason: "stale".to_string(),
        });
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.transport_id(), Some(2));
        assert!(manager.is_reconnecting());
        assert!(!manager.is_updating());
        assert_eq!(manager.subscribe_stats().borrow().bytes_in, 0);

        second.write_all(&[0]).await.unwrap();
        drive_until(&mut manager, &mut events, |m| {
            m.state() == ConnectionState::Connected
        })
        .await;
        assert!(manager.is_updating());
        assert!(!manager.is_reconnecting());

        manager.handle(Event::Closed {
            transport: 1,
            reason: "stale".to_string(),
        });
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.transport_id(), Some(2));
        assert!(manager.is_updating());
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_tick_leaves_pending_handshake_alone() {
        let (mut manager, mut events, mut peers) = manager();
        manager.enable(ClientId::from("123"));
        drive_until(&mut manager, &mut events, |m| m.transport_id() == Some(1)).await;
        let _peer = peers.recv().await.unwrap();

        // Let the next reconnect tick (t=15) arrive and be handled.
        tokio::time::sleep(std::time::Duration::from_secs(16)).await;
        while let Ok(event) = events.try_recv() {
            manager.handle(event);
        }
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.transport_id(), Some(1));
        assert_eq!(manager.subscribe_stats().borrow().connect_attempts, 1);
    }

    #[test]
    fn test_client_id_resolution() {
        assert_eq!(ClientId::from("42").resolve().as_deref(), Some("42"));
        assert_eq!(ClientId::from("").resolve(), None);
        assert_eq!(ClientId::from_fn(|| None).resolve(), None);
        assert_eq!(
            ClientId::from_fn(|| Some("7".to_string())).resolve().as_deref(),
            Some("7")
        );
        assert_eq!(format!("{:?}", ClientId::from_fn(|| None)), "Resolver(..)");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
