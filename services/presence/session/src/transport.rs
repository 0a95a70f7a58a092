//! Local IPC transport for presence sessions.
//!
//! On Unix the peer listens on a domain socket in the runtime directory; on
//! Windows it listens on a named pipe. Other platforms have no transport.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::SessionError;

/// Default endpoint name the peer listens on
pub const DEFAULT_ENDPOINT_NAME: &str = "discord-ipc-0";

/// Environment variables checked, in order, for the runtime directory
pub const RUNTIME_DIR_VARS: [&str; 4] = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"];

/// Directory used when none of [`RUNTIME_DIR_VARS`] is set
pub const FALLBACK_RUNTIME_DIR: &str = "/tmp";

/// Bidirectional byte stream to the peer
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed transport handed to the session
pub type BoxedStream = Box<dyn IpcStream>;

/// Opens transports to the peer
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport
    async fn connect(&self) -> Result<BoxedStream, SessionError>;

    /// Whether this connector can ever succeed on this platform
    fn is_supported(&self) -> bool {
        true
    }
}

/// Where the peer's endpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    /// Endpoint at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Discover the endpoint from the process environment
    pub fn discover(name: &str) -> Self {
        Self::discover_with(name, |var| std::env::var(var).ok())
    }

    /// Discover the endpoint using `lookup` for environment variables
    #[cfg(not(windows))]
    pub fn discover_with<F>(name: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let dir = RUNTIME_DIR_VARS
            .iter()
            .filter_map(|var| lookup(*var))
            .find(|value| !value.is_empty())
            .unwrap_or_else(|| FALLBACK_RUNTIME_DIR.to_string());
        Self {
            path: PathBuf::from(dir).join(name),
        }
    }

    /// Discover the endpoint using `lookup` for environment variables
    #[cfg(windows)]
    pub fn discover_with<F>(name: &str, _lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            path: PathBuf::from(format!(r"\\.\pipe\{}", name)),
        }
    }

    /// Filesystem path or pipe name
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Connector for the platform's native local socket
#[derive(Debug, Clone)]
pub struct LocalConnector {
    endpoint: Endpoint,
}

impl LocalConnector {
    /// Connect to `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Endpoint this connector opens
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for LocalConnector {
    #[cfg(unix)]
    async fn connect(&self) -> Result<BoxedStream, SessionError> {
        let stream = tokio::net::UnixStream::connect(self.endpoint.path()).await?;
        debug!("Opened unix socket {:?}", self.endpoint.path());
        Ok(Box::new(stream))
    }

    #[cfg(windows)]
    async fn connect(&self) -> Result<BoxedStream, SessionError> {
        let pipe = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(self.endpoint.path())?;
        debug!("Opened named pipe {:?}", self.endpoint.path());
        Ok(Box::new(pipe))
    }

    #[cfg(not(any(unix, windows)))]
    async fn connect(&self) -> Result<BoxedStream, SessionError> {
        debug!("No local transport for {:?}", self.endpoint.path());
        Err(SessionError::Unsupported)
    }

    fn is_supported(&self) -> bool {
        cfg!(any(unix, windows))
    }
}
