//! Error types for ezrpc.

use thiserror::Error;

/// Main error type for all ezrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on a TCP socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Conversion between JSON values and typed arguments/results failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed framing or a frame of the wrong kind.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The buffer does not hold a complete frame yet.
    #[error("Incomplete frame: {needed} more bytes needed")]
    Incomplete { needed: usize },

    /// Bad constructor input (port, empty backend pool, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Rejected registry mutation.
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    /// A registry operation was called without anything to operate on.
    #[error("Empty argument: {0}")]
    EmptyArgument(String),

    /// The remote side answered the call with an error message.
    #[error("{0}")]
    Remote(String),

    /// Connection closed before the call completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The call did not complete within the configured timeout.
    #[error("Call timed out")]
    Timeout,
}

impl RpcError {
    /// True for errors caused by undecodable wire data.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            RpcError::Protocol(_) | RpcError::MsgPackDecode(_) | RpcError::Json(_)
        )
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
