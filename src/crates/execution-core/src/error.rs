//! Error taxonomy for the execution core.
//!
//! One enum, one source of truth: every fallible operation on the public
//! API returns [`ExecutionError`]. Variants map 1:1 onto the error taxonomy
//! callers are expected to branch on (see crate-level docs).

use thiserror::Error;

/// Errors surfaced by the execution core's public operations.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Unknown `executionId` or `nodeId`.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation illegal in the execution's current status.
    #[error("bad state: {operation} is not valid from status {status}")]
    BadState {
        /// The operation that was attempted.
        operation: String,
        /// The status the execution was in when the operation was attempted.
        status: String,
    },

    /// A debug-only operation was attempted on a non-debug execution.
    #[error("no debugger attached to execution {execution_id}")]
    NoDebugger {
        /// The execution that has no debugger.
        execution_id: String,
    },

    /// Child creation would exceed `MAX_DEPTH`.
    #[error("cycle detected: execution depth would exceed {max_depth}")]
    CycleDetected {
        /// The configured maximum depth.
        max_depth: u32,
    },

    /// A durable store write or read failed. Non-fatal for in-memory live
    /// state; the execution continues.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Anything else, including engine panics surfaced as `FlowFailed`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Build a [`ExecutionError::BadState`] from a status's `Debug` text.
    pub fn bad_state(operation: impl Into<String>, status: impl std::fmt::Display) -> Self {
        Self::BadState {
            operation: operation.into(),
            status: status.to_string(),
        }
    }

    /// The human-readable message half of the `{message, nodeId?}` error
    /// shape callers see on the wire.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExecutionError>;
