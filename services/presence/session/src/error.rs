//! Session error and warning types.

use presence_wire::WireError;
use std::fmt;
use thiserror::Error;

/// Session errors.
///
/// None of these leave the session driver; each one is turned into a state
/// transition back to the reconnect cycle.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer endpoint absent or unreachable
    #[error("transport open failed: {0}")]
    TransportOpen(#[from] std::io::Error),

    /// Opening the transport took longer than the configured timeout
    #[error("transport open timed out")]
    ConnectTimeout,

    /// Write on an assumed-live transport failed
    #[error("transport send failed")]
    TransportSend,

    /// No client id could be resolved for the handshake
    #[error("no client id configured")]
    MissingClientId,

    /// This platform has no local IPC transport
    #[error("local IPC transport unsupported on this platform")]
    Unsupported,

    /// Packet encoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Non-fatal configuration problems reported when a session is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The client id resolver returned nothing
    MissingClientId,
    /// No native local socket support and no helper available
    UnsupportedPlatform,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::MissingClientId => {
                f.write_str("No client id configured; presence will not be shown until one is set")
            }
            ConfigWarning::UnsupportedPlatform => {
                f.write_str("Local IPC is not available on this platform; presence is disabled")
            }
        }
    }
}
