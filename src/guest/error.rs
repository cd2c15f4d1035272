// ABOUTME: Error type surfaced to guest database callers
// ABOUTME: Maps each failure to the short wire code carried in reply frames

use crate::store::StoreError;
use std::io;
use thiserror::Error;

/// Error returned by guest database operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Operation on a closed database.
    #[error("database is not open")]
    DatabaseNotOpen,

    /// The transport disconnected and retry is not enabled.
    #[error("connection to the host was lost")]
    ConnectionLost,

    /// Attaching after an explicit close.
    #[error("cannot reopen a database after close")]
    NotSupported,

    /// The forward target does not accept raw byte keys and values.
    #[error("store does not accept raw byte keys and values")]
    EncodingNotSupported,

    /// A second rpc stream was attached while one is live.
    #[error("only one rpc stream can be attached at a time")]
    StreamAlreadyAttached,

    /// The host rejected the operation; carries its short error code.
    #[error("host rejected the operation: {0}")]
    Remote(String),

    /// Transport-level I/O failure.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    /// Short error code, matching what travels in reply frames.
    pub fn code(&self) -> &str {
        match self {
            RpcError::DatabaseNotOpen => "LEVEL_DATABASE_NOT_OPEN",
            RpcError::ConnectionLost => "LEVEL_CONNECTION_LOST",
            RpcError::NotSupported => "LEVEL_NOT_SUPPORTED",
            RpcError::EncodingNotSupported => "LEVEL_ENCODING_NOT_SUPPORTED",
            RpcError::StreamAlreadyAttached => "LEVEL_RPC_STREAM",
            RpcError::Remote(code) => code,
            RpcError::Io(_) => "LEVEL_IO_ERROR",
        }
    }

    /// Rebuild an error from a reply frame's error code.
    pub(crate) fn from_code(code: String) -> RpcError {
        match code.as_str() {
            "LEVEL_DATABASE_NOT_OPEN" => RpcError::DatabaseNotOpen,
            "LEVEL_CONNECTION_LOST" => RpcError::ConnectionLost,
            "LEVEL_NOT_SUPPORTED" => RpcError::NotSupported,
            "LEVEL_ENCODING_NOT_SUPPORTED" => RpcError::EncodingNotSupported,
            _ => RpcError::Remote(code),
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> RpcError {
        match err {
            StoreError::NotOpen => RpcError::DatabaseNotOpen,
            other => RpcError::Remote(other.code().to_string()),
        }
    }
}

/// Result type alias for guest operations.
pub type RpcResult<T> = Result<T, RpcError>;
