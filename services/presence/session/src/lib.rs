//! IPC transport, handshake, reconnect and update cycles for presence sessions.
//!
//! This crate keeps a presence session alive against a peer process listening
//! on a local socket. The peer may not be running, may go away at any time and
//! never answers in a request/response fashion, so the session is a small
//! state machine driven by two periodic cycles:
//!
//! - **Reconnect cycle**: while disconnected, try to open the transport every
//!   interval and send the handshake when it opens
//! - **Update cycle**: once the peer has replied, rebuild the presence payload
//!   every interval and send it when it changed
//!
//! Any transport failure drops back to the reconnect cycle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use presence_session::{
//!     Endpoint, LocalConnector, PresenceContext, Session, SessionConfig, DEFAULT_ENDPOINT_NAME,
//! };
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (context_tx, context_rx) = watch::channel(PresenceContext {
//!     display_name: "main.rs".to_string(),
//!     line_count: 120,
//!     detailed_display: true,
//!     ..PresenceContext::default()
//! });
//!
//! let connector = LocalConnector::new(Endpoint::discover(DEFAULT_ENDPOINT_NAME));
//! let session = Session::spawn(
//!     SessionConfig::default(),
//!     Arc::new(connector),
//!     Arc::new(context_rx),
//! );
//! session.enable("123456789012345678");
//!
//! // Later, as the user moves around
//! context_tx.send_modify(|context| context.line_number = 42);
//!
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod scheduler;
pub mod session;
pub mod transport;

// Re-export main types
pub use activity::{
    build, now_nonce, ActivityCommand, ActivityLabels, ContextSource, LastKnownSnapshot,
    PresenceContext,
};
pub use error::{ConfigWarning, SessionError};
pub use handshake::{build_handshake, Handshake, PROTOCOL_VERSION};
pub use manager::{ClientId, ConnectionManager, ConnectionState, Event, PresenceEventHandler};
pub use scheduler::{Cycle, Scheduler, TimerHandle, TimerId};
pub use session::{Session, SessionConfig, SessionStats};
pub use transport::{
    BoxedStream, Connector, Endpoint, IpcStream, LocalConnector, DEFAULT_ENDPOINT_NAME,
};
