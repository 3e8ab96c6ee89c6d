//! The execution instance — the unit of work.

use crate::context::ExecutionContext;
use crate::engine::{Engine, EngineOptions};
use crate::error::{ExecutionError, Result};
use crate::flow::Flow;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Execution status. Transitions form a DAG: `Created ->
/// Running -> (Paused <-> Running) -> {Completed, Failed, Stopped}`. Once in
/// a terminal status, no further transition is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Stopped)
    }

    /// Whether `self -> next` is one of the edges in the status DAG.
    fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Created, Running) | (Created, Stopped) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Stopped) => true,
            (Paused, Running) | (Paused, Stopped) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

/// A human-readable failure, with the node that caused it when known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
    pub node_id: Option<String>,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), node_id: None }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// The unit of work: one run of a [`Flow`] over a [`ExecutionContext`],
/// driven by an [`Engine`].
pub struct ExecutionInstance {
    pub id: String,
    pub flow_id: String,
    /// Read-only after creation — seeds any children.
    pub initial_state_flow: Flow,
    /// A static snapshot of the working flow's node ids, kept only so
    /// breakpoint validation (`addBreakpoint`) doesn't need engine access.
    working_flow_node_ids: HashSet<String>,
    pub context: ExecutionContext,
    pub engine: Arc<dyn Engine>,
    status: RwLock<Status>,
    pub created_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    error: RwLock<Option<ExecutionFailure>>,
    pub parent_execution_id: Option<String>,
    pub execution_depth: u32,
    /// Whether this execution was created with debugging enabled — gates
    /// the whole `pause`/`step`/breakpoint control surface at the service
    /// layer.
    pub debug_enabled: bool,
    external_events: RwLock<Vec<serde_json::Value>>,
    children: RwLock<HashSet<String>>,
}

impl ExecutionInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        flow_id: String,
        working_flow: &Flow,
        initial_state_flow: Flow,
        context: ExecutionContext,
        engine: Arc<dyn Engine>,
        parent_execution_id: Option<String>,
        execution_depth: u32,
        debug_enabled: bool,
    ) -> Self {
        Self {
            id,
            flow_id,
            working_flow_node_ids: working_flow.nodes.iter().map(|n| n.id.clone()).collect(),
            initial_state_flow,
            context,
            engine,
            status: RwLock::new(Status::Created),
            created_at: Utc::now(),
            started_at: RwLock::new(None),
            completed_at: RwLock::new(None),
            error: RwLock::new(None),
            parent_execution_id,
            execution_depth,
            debug_enabled,
            external_events: RwLock::new(Vec::new()),
            children: RwLock::new(HashSet::new()),
        }
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read()
    }

    pub fn error(&self) -> Option<ExecutionFailure> {
        self.error.read().clone()
    }

    pub fn external_events(&self) -> Vec<serde_json::Value> {
        self.external_events.read().clone()
    }

    pub fn set_external_events(&self, events: Vec<serde_json::Value>) {
        *self.external_events.write() = events;
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.working_flow_node_ids.contains(node_id)
    }

    pub fn options(&self) -> EngineOptions {
        self.engine.options()
    }

    /// Gate for the debugger control surface — `Err(NoDebugger)` unless
    /// this execution was created with `debug.enabled = true`.
    pub fn require_debug(&self) -> Result<()> {
        if self.debug_enabled {
            Ok(())
        } else {
            Err(ExecutionError::NoDebugger { execution_id: self.id.clone() })
        }
    }

    /// Attempt a status transition, validating it against the DAG and
    /// bookkeeping `startedAt`/`completedAt`.
    pub fn transition(&self, next: Status) -> Result<()> {
        let current = *self.status.read();
        if current == next {
            return Ok(()); // idempotent no-op, e.g. resume while already Running
        }
        if !current.can_transition_to(next) {
            return Err(ExecutionError::bad_state(format!("{current:?}->{next:?}"), current));
        }
        *self.status.write() = next;
        if next == Status::Running && self.started_at.read().is_none() {
            *self.started_at.write() = Some(Utc::now());
        }
        if next.is_terminal() {
            *self.completed_at.write() = Some(Utc::now());
        }
        Ok(())
    }

    pub fn set_failure(&self, failure: ExecutionFailure) {
        *self.error.write() = Some(failure);
    }

    pub fn add_child(&self, child_id: impl Into<String>) {
        self.children.write().insert(child_id.into());
    }

    pub fn children(&self) -> HashSet<String> {
        self.children.read().clone()
    }

    pub fn has_living_children(&self, living: impl Fn(&str) -> bool) -> bool {
        self.children.read().iter().any(|id| living(id))
    }
}
