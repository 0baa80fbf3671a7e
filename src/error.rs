//! Error types for the Clustra cache client

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::lock::{ItemVersion, LockHandle};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the cache client.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Capability Errors
    // =========================================================================
    /// The active strategy does not implement this operation
    #[error("Operation '{operation}' is not supported by the {strategy} strategy")]
    Unsupported {
        operation: &'static str,
        strategy: &'static str,
    },

    /// The server rejected the client as incompatible
    #[error("Operation not supported by server: {0}")]
    OperationNotSupported(String),

    // =========================================================================
    // Transient Cluster-State Errors
    // =========================================================================
    /// Server is refusing new activity (node hand-off in progress)
    #[error("Activity blocked on server {server}")]
    ActivityBlocked { server: String },

    /// Cluster is transferring state; routing information is unreliable
    #[error("State transfer in progress on server {server}")]
    StateTransferInProgress { server: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Argument rejected before any network call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Both absolute and sliding expiration were set on one item
    #[error("Item '{key}' has both absolute and sliding expiration set")]
    ConflictingExpiration { key: String },

    /// Bulk call with parallel arrays of different length
    #[error("Bulk call has {keys} keys but {items} items")]
    LengthMismatch { keys: usize, items: usize },

    // =========================================================================
    // Lock Contention
    // =========================================================================
    /// Item is locked and the presented lock id does not match
    #[error("Item '{key}' is locked (lock id {lock})")]
    ItemLocked { key: String, lock: LockHandle },

    /// Optimistic concurrency check failed
    #[error("Version mismatch for '{key}': expected {expected}, current {actual}")]
    VersionMismatch {
        key: String,
        expected: ItemVersion,
        actual: ItemVersion,
    },

    // =========================================================================
    // Broker / Server Errors
    // =========================================================================
    /// Request did not complete within the operation timeout
    #[error("Operation {operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// Connection to a server was lost while the call was in flight
    #[error("Connection lost to server {server}")]
    ConnectionLost { server: String },

    /// No connected server is available for a dedicated request
    #[error("No server available")]
    NoServerAvailable,

    /// Server reported a failure for the command
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    // =========================================================================
    // Reader Errors
    // =========================================================================
    /// Reader was already closed
    #[error("Reader {0} is closed")]
    ReaderClosed(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Named cache is not open in this registry
    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    /// Cache handle was used after close
    #[error("Cache '{0}' has been disposed")]
    CacheDisposed(String),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// JSON (de)serialization of a payload failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration value rejected
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Compression failed
    #[error("Compression failed ({algorithm}): {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression failed ({algorithm}): {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fault classes with a dedicated routing reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    ActivityBlocked,
    StateTransferInProgress,
    OperationNotSupported,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::ActivityBlocked => write!(f, "activity-blocked"),
            FaultKind::StateTransferInProgress => write!(f, "state-transfer-in-progress"),
            FaultKind::OperationNotSupported => write!(f, "operation-not-supported"),
        }
    }
}

impl Error {
    /// Shorthand for a capability error.
    pub fn unsupported(operation: &'static str, strategy: &'static str) -> Self {
        Error::Unsupported {
            operation,
            strategy,
        }
    }

    /// Classify the error for the retry router.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Error::ActivityBlocked { .. } => Some(FaultKind::ActivityBlocked),
            Error::StateTransferInProgress { .. } => Some(FaultKind::StateTransferInProgress),
            Error::OperationNotSupported(_) => Some(FaultKind::OperationNotSupported),
            _ => None,
        }
    }

    /// True for lock and version conflicts.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::ItemLocked { .. } | Error::VersionMismatch { .. })
    }
}

// =============================================================================
// Server Faults
// =============================================================================

/// Failure reported inside a server response.
///
/// Responses are plain data and may be cloned or replayed, so the fault is
/// carried in this form and converted to [`Error`] when the response is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFault {
    StateTransferInProgress,
    ActivityBlocked,
    OperationNotSupported(String),
    ItemLocked {
        key: String,
        lock: LockHandle,
    },
    VersionMismatch {
        key: String,
        expected: ItemVersion,
        actual: ItemVersion,
    },
    Failed(String),
}

impl ServerFault {
    /// Convert into a client error, attributing it to `server`.
    pub fn into_error(self, server: &str) -> Error {
        match self {
            ServerFault::StateTransferInProgress => Error::StateTransferInProgress {
                server: server.to_string(),
            },
            ServerFault::ActivityBlocked => Error::ActivityBlocked {
                server: server.to_string(),
            },
            ServerFault::OperationNotSupported(msg) => Error::OperationNotSupported(msg),
            ServerFault::ItemLocked { key, lock } => Error::ItemLocked { key, lock },
            ServerFault::VersionMismatch {
                key,
                expected,
                actual,
            } => Error::VersionMismatch {
                key,
                expected,
                actual,
            },
            ServerFault::Failed(msg) => Error::OperationFailed(msg),
        }
    }
}

impl From<Error> for ServerFault {
    fn from(err: Error) -> Self {
        match err {
            Error::StateTransferInProgress { .. } => ServerFault::StateTransferInProgress,
            Error::ActivityBlocked { .. } => ServerFault::ActivityBlocked,
            Error::OperationNotSupported(msg) => ServerFault::OperationNotSupported(msg),
            Error::ItemLocked { key, lock } => ServerFault::ItemLocked { key, lock },
            Error::VersionMismatch {
                key,
                expected,
                actual,
            } => ServerFault::VersionMismatch {
                key,
                expected,
                actual,
            },
            other => ServerFault::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_classification() {
        let blocked = Error::ActivityBlocked {
            server: "10.0.0.1:9800".into(),
        };
        assert_eq!(blocked.fault_kind(), Some(FaultKind::ActivityBlocked));

        let transfer = ServerFault::StateTransferInProgress.into_error("10.0.0.2:9800");
        assert_eq!(transfer.fault_kind(), Some(FaultKind::StateTransferInProgress));

        let timeout = Error::Timeout {
            operation: "get".into(),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.fault_kind(), None);
    }

    #[test]
    fn test_lock_fault_keeps_holder() {
        let lock = LockHandle::new("lock-1", chrono::Utc::now());
        let err = ServerFault::ItemLocked {
            key: "k".into(),
            lock: lock.clone(),
        }
        .into_error("s1");

        assert!(err.is_contention());
        match err {
            Error::ItemLocked { lock: holder, .. } => assert_eq!(holder, lock),
            other => panic!("unexpected error: {other}"),
        }
    }
}
