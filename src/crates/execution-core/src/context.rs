//! Per-execution mutable scratchpad.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// In-flow data carried by a child execution, describing the event that
/// spawned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub event_name: String,
    pub payload: serde_json::Value,
    pub emitted_by: String,
}

/// An in-flow event produced by a node during execution. Drives child
/// spawning: the orchestrator walks `context.emitted_events` for
/// entries with `processed == false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
    pub emitted_by: String,
    pub processed: bool,
    pub child_execution_id: Option<String>,
}

impl EmittedEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value, emitted_by: impl Into<String>) -> Self {
        Self {
            id: crate::ids::event_id(),
            event_type: event_type.into(),
            data,
            emitted_at: Utc::now(),
            emitted_by: emitted_by.into(),
            processed: false,
            child_execution_id: None,
        }
    }
}

/// Opaque passthrough bag handed to nodes; the execution core never reads
/// its contents. Typically holds credentials, API clients, or other
/// collaborator handles supplied by the caller of `createExecution`.
pub type Integrations = serde_json::Value;

/// Per-execution mutable state threaded through the engine and every
/// node invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub flow_id: String,
    pub integrations: Integrations,
    /// Present only for child executions, and for container-mode runs
    /// between batches — the event(s) that caused this run to happen.
    event_data: Arc<Mutex<Option<EventData>>>,
    pub is_child_execution: bool,
    cancellation: CancellationToken,
    emitted_events: Arc<Mutex<Vec<EmittedEvent>>>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>, flow_id: impl Into<String>, integrations: Integrations) -> Self {
        Self {
            execution_id: execution_id.into(),
            flow_id: flow_id.into(),
            integrations,
            event_data: Arc::new(Mutex::new(None)),
            is_child_execution: false,
            cancellation: CancellationToken::new(),
            emitted_events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_event_data(self, event_data: EventData) -> Self {
        *self.event_data.lock() = Some(event_data);
        Self { is_child_execution: true, ..self }
    }

    pub fn event_data(&self) -> Option<EventData> {
        self.event_data.lock().clone()
    }

    pub fn set_event_data(&self, event_data: Option<EventData>) {
        *self.event_data.lock() = event_data;
    }

    /// The cancellation handle `stop` aborts and every long I/O node path
    /// and the engine observe at node boundaries.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Append an event produced by a node. Returns the event's id.
    pub fn emit_event(&self, event_type: impl Into<String>, data: serde_json::Value, emitted_by: impl Into<String>) -> String {
        let event = EmittedEvent::new(event_type, data, emitted_by);
        let id = event.id.clone();
        self.emitted_events.lock().push(event);
        id
    }

    /// Snapshot of all events emitted so far, in emission order.
    pub fn emitted_events(&self) -> Vec<EmittedEvent> {
        self.emitted_events.lock().clone()
    }

    /// Mark an emitted event as processed and record its spawned child id,
    /// if any. Called once a spawn has been scheduled, regardless of the
    /// child's eventual outcome.
    pub fn mark_processed(&self, event_id: &str, child_execution_id: Option<String>) {
        let mut events = self.emitted_events.lock();
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.processed = true;
            event.child_execution_id = child_execution_id;
        }
    }

    /// Unprocessed events, in emission order — what the orchestrator walks
    /// on each emission-callback firing.
    pub fn unprocessed_events(&self) -> Vec<EmittedEvent> {
        self.emitted_events
            .lock()
            .iter()
            .filter(|e| !e.processed)
            .cloned()
            .collect()
    }
}
