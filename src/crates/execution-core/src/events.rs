//! The per-execution lifecycle event stream.
//!
//! Authoritative ordering is the monotonic `index` assigned at publish time;
//! timestamps are informational only and must never be used to order
//! events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One kind of lifecycle or observational event on an execution's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionEventType {
    FlowSubscribed,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    FlowCompleted,
    FlowFailed,
    FlowCancelled,
    FlowPaused,
    FlowResumed,
    ChildExecutionSpawned,
    ChildExecutionCompleted,
    ChildExecutionFailed,
}

/// One element in the per-execution event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Monotonically increasing within one execution; the authoritative
    /// order. Assigned by the [`crate::queue::EventQueue`] at publish time.
    pub index: i64,
    #[serde(rename = "type")]
    pub event_type: ExecutionEventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl ExecutionEvent {
    /// Construct an event with `index` left at zero — the queue assigns the
    /// real index when it is published. Callers that need a full event with
    /// an index already assigned should go through
    /// [`crate::queue::EventQueue::publish`], which stamps both `index` and
    /// `timestamp`.
    pub fn new(event_type: ExecutionEventType, data: serde_json::Value) -> Self {
        Self {
            index: 0,
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}
