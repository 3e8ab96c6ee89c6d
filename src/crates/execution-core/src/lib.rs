//! Execution core for a visual dataflow platform.
//!
//! A [`flow`](flow::Flow) is a dataflow DAG of typed nodes. An
//! [`ExecutionService`](service::ExecutionService) runs one flow at a time
//! as an [`ExecutionInstance`](instance::ExecutionInstance), streaming
//! lifecycle and per-node events to subscribers through a bounded
//! [`EventQueue`](queue::EventQueue), persisting them durably via an
//! [`EventStore`](event_store::EventStore), and archiving the instance
//! itself to an [`ExecutionStore`](execution_store::ExecutionStore) once it
//! reaches a terminal status.
//!
//! Nodes can emit events mid-flow; the service spawns a child execution per
//! emitted event, gated by a maximum parent/child depth, and holds a
//! parent's own terminal outcome until every child it spawned has also
//! reached a terminal status. A [`CleanupService`](cleanup::CleanupService)
//! periodically reaps old archived executions so durable storage doesn't
//! grow without bound.
//!
//! Everything here follows the same layering throughout: a narrow async
//! trait in front of each durable concern, `dashmap` for concurrent
//! in-memory indices, `parking_lot` for synchronous locks, and `tracing`
//! for structured logging.

pub mod cleanup;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event_store;
pub mod events;
pub mod execution_store;
pub mod flow;
pub mod ids;
pub mod instance;
pub mod queue;
pub mod service;

pub use cleanup::{CleanupReport, CleanupService};
pub use config::ExecutionCoreConfig;
pub use context::{EventData, ExecutionContext};
pub use engine::{DefaultEngine, Debugger, Engine, EngineOptions, EngineOutcome, NodeRuntime};
pub use error::{ExecutionError, Result};
pub use event_store::{DurableEventSink, EventStore, InMemoryEventSink};
pub use events::{ExecutionEvent, ExecutionEventType};
pub use execution_store::{DurableExecutionSink, ExecutionStore, ExecutionView, InMemoryExecutionSink};
pub use flow::{Edge, Flow, Node};
pub use instance::{ExecutionFailure, ExecutionInstance, Status};
pub use queue::{EventIterator, EventQueue};
pub use service::{group_external_events, DebugOptions, ExecutionOptions, ExecutionService};
