//! Error types for clonifier.

use crate::protocol::{ArgKind, CallId, ObjectId, ObjectType};
use std::time::Duration;
use thiserror::Error;

/// A failure that ends all interaction with the worker.
///
/// Delivered once to the connection's fatal handler; every later request
/// fails with [`BridgeError::Fatal`] carrying the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("Worker failed to start ({primary}); fallback backend also failed ({fallback})")]
    Bootstrap { primary: String, fallback: String },

    #[error("Worker failed to start: {0}")]
    BootstrapNoFallback(String),

    #[error("Worker crashed: {0}")]
    Runtime(String),

    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),
}

/// Error surfaced to callers of the bridge.
///
/// `Clone` so that a memoized failure can be handed out on every read.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The worker-side operation rejected. Recoverable.
    #[error("{0}")]
    Call(String),

    #[error("Attempt to call method '{method}' on freed object")]
    UseAfterFree { method: String },

    #[error("Invalid handle: slot {0} is not live")]
    InvalidHandle(u32),

    #[error("Expected a {expected} object, worker returned {actual}")]
    UnexpectedType {
        expected: ObjectType,
        actual: ObjectType,
    },

    #[error("Expected a {expected} reply, worker returned {actual}")]
    ReturnKind { expected: ArgKind, actual: ArgKind },

    #[error("Could not decode reply: {0}")]
    Decode(String),

    #[error("Could not encode argument: {0}")]
    Encode(String),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("Call {call_id} abandoned: connection shut down before the worker answered")]
    Abandoned { call_id: CallId },

    #[error("Call {call_id} timed out after {after:?}")]
    Timeout { call_id: CallId, after: Duration },

    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Connection is shut down")]
    Closed,
}

impl BridgeError {
    /// Whether the error leaves the connection usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            BridgeError::Fatal(_) | BridgeError::Abandoned { .. } | BridgeError::Closed
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Encode(e.to_string())
    }
}

/// Fatal condition inside the worker host. Ends the worker.
#[derive(Error, Debug)]
pub enum WorkerFault {
    #[error("Request references unknown object id {0}")]
    UnknownObject(ObjectId),

    #[error("Function '{function}' produced a {actual} result, caller expected {expected}")]
    ReturnKind {
        function: String,
        expected: ArgKind,
        actual: ArgKind,
    },

    #[error("Response channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_use_after_free_message() {
        let err = BridgeError::UseAfterFree {
            method: "get_metadata".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("freed object"));
        assert!(msg.contains("get_metadata"));
    }

    #[test]
    fn test_call_error_passthrough() {
        let err = BridgeError::Call("Parsing failed: bad header".to_string());
        assert_eq!(err.to_string(), "Parsing failed: bad header");
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fatal_is_not_recoverable() {
        let err: BridgeError = FatalError::Runtime("panicked".to_string()).into();
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("crashed"));
    }

    #[test]
    fn test_bootstrap_message_names_both_backends() {
        let err = FatalError::Bootstrap {
            primary: "process exited with code 1".to_string(),
            fallback: "thread spawn failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exited with code 1"));
        assert!(msg.contains("thread spawn failed"));
    }

    #[test]
    fn test_unexpected_type_message() {
        let err = BridgeError::UnexpectedType {
            expected: ObjectType::Seq,
            actual: ObjectType::Pcrer,
        };
        let msg = err.to_string();
        assert!(msg.contains("Seq"));
        assert!(msg.contains("Pcrer"));
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err = BridgeError::Abandoned { call_id: 4 };
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_worker_fault_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: WorkerFault = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_becomes_encode() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: BridgeError = json_err.into();
        assert!(matches!(err, BridgeError::Encode(_)));
    }
}
