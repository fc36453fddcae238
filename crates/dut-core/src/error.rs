//! Error types for dutlink.
//!
//! One taxonomy for the whole crate: schema conflicts, transport failures,
//! protocol desyncs, remote-side failures and timeouts. Remote failures carry
//! the operation name, its arguments and the raw reply so a failed run can be
//! debugged without re-running it.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the dutlink library.
#[derive(Debug, Error)]
pub enum DutError {
    /// A discovered checksum matches no surviving collection.
    #[error("Schema conflict: {message}")]
    SchemaConflict { message: String },

    /// The tunnel never became ready, dialing failed, or a low-level
    /// read/write failed mid-batch.
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The reply stream desynchronized: unexpected context, missing stream
    /// terminator, or a malformed/oversized frame.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The remote engine rejected an operation (nonzero retval).
    #[error("Remote operation {op}({args}) failed with retval {retval}; reply: {reply}")]
    RemoteOperation {
        op: String,
        args: String,
        retval: i64,
        reply: String,
    },

    /// No reply arrived within the bounded wait, retries included.
    #[error("Timed out: {message}")]
    Timeout { message: String },

    /// Caller misuse: double-registered endpoint, wrong batch arity,
    /// executor mode mismatch.
    #[error("Validation error: {message}")]
    Validation { message: String },

    // File system errors (schema files, temp directories)
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for dutlink operations.
pub type Result<T> = std::result::Result<T, DutError>;

// Bare IO errors in this crate come from the transport; schema and temp-dir
// IO always goes through `io_with_path` to keep the path context.
impl From<std::io::Error> for DutError {
    fn from(err: std::io::Error) -> Self {
        DutError::Connection {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for DutError {
    fn from(err: serde_json::Error) -> Self {
        DutError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl DutError {
    /// Create a schema conflict error.
    pub fn schema_conflict(message: impl Into<String>) -> Self {
        DutError::SchemaConflict {
            message: message.into(),
        }
    }

    /// Create a connection error without an IO cause.
    pub fn connection(message: impl Into<String>) -> Self {
        DutError::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        DutError::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        DutError::Timeout {
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        DutError::Validation {
            message: message.into(),
        }
    }

    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DutError::Io {
            message: err.to_string(),
            path: path.into(),
            source: err,
        }
    }

    /// Whether this is a transport-level failure eligible for the single
    /// transparent reconnect during a sync batch.
    pub fn is_connection(&self) -> bool {
        matches!(self, DutError::Connection { .. })
    }
}
