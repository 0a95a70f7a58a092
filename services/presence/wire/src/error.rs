//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Payload larger than the configured limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Payload is not valid UTF-8
    #[error("payload is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),

    /// JSON encoding or decoding failed
    #[error("json payload invalid: {0}")]
    Json(#[from] serde_json::Error),
}
