//! C3 — Execution Store: live instances in memory, terminal instances
//! durable. Reads prefer memory and fall back to the durable backend.
//!
//! A narrow `DurableExecutionSink` trait in front of an in-memory backend,
//! with the concurrent live index kept as a `dashmap::DashMap`, the way a
//! long-lived orchestrator keeps its in-flight run registry.

use crate::error::Result;
use crate::flow::Flow;
use crate::instance::{ExecutionFailure, ExecutionInstance, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A durable, read-only snapshot of an execution, taken once it reaches a
/// terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub flow_id: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ExecutionFailure>,
    pub parent_execution_id: Option<String>,
    pub execution_depth: u32,
    pub initial_state_flow: Flow,
}

impl ExecutionRecord {
    pub fn snapshot(instance: &ExecutionInstance) -> Self {
        Self {
            id: instance.id.clone(),
            flow_id: instance.flow_id.clone(),
            status: instance.status(),
            created_at: instance.created_at,
            started_at: instance.started_at(),
            completed_at: instance.completed_at(),
            error: instance.error(),
            parent_execution_id: instance.parent_execution_id.clone(),
            execution_depth: instance.execution_depth,
            initial_state_flow: instance.initial_state_flow.clone(),
        }
    }
}

#[async_trait]
pub trait DurableExecutionSink: Send + Sync {
    async fn save(&self, record: ExecutionRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>>;
    async fn list(&self) -> Result<Vec<ExecutionRecord>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryExecutionSink {
    rows: DashMap<String, ExecutionRecord>,
}

impl InMemoryExecutionSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableExecutionSink for InMemoryExecutionSink {
    async fn save(&self, record: ExecutionRecord) -> Result<()> {
        self.rows.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn list(&self) -> Result<Vec<ExecutionRecord>> {
        Ok(self.rows.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.rows.remove(id);
        Ok(())
    }
}

/// Either a live, controllable instance or a read-only archived snapshot.
pub enum ExecutionView {
    Live(Arc<ExecutionInstance>),
    Archived(ExecutionRecord),
}

impl ExecutionView {
    pub fn id(&self) -> &str {
        match self {
            ExecutionView::Live(i) => &i.id,
            ExecutionView::Archived(r) => &r.id,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            ExecutionView::Live(i) => i.status(),
            ExecutionView::Archived(r) => r.status,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ExecutionView::Live(i) => i.created_at,
            ExecutionView::Archived(r) => r.created_at,
        }
    }

    pub fn initial_state_flow(&self) -> Flow {
        match self {
            ExecutionView::Live(i) => i.initial_state_flow.clone(),
            ExecutionView::Archived(r) => r.initial_state_flow.clone(),
        }
    }

    pub fn parent_execution_id(&self) -> Option<String> {
        match self {
            ExecutionView::Live(i) => i.parent_execution_id.clone(),
            ExecutionView::Archived(r) => r.parent_execution_id.clone(),
        }
    }
}

pub struct ExecutionStore {
    live: DashMap<String, Arc<ExecutionInstance>>,
    durable: Arc<dyn DurableExecutionSink>,
}

impl ExecutionStore {
    pub fn new(durable: Arc<dyn DurableExecutionSink>) -> Self {
        Self { live: DashMap::new(), durable }
    }

    pub fn insert_live(&self, instance: Arc<ExecutionInstance>) {
        self.live.insert(instance.id.clone(), instance);
    }

    pub fn get_live(&self, id: &str) -> Option<Arc<ExecutionInstance>> {
        self.live.get(id).map(|r| r.clone())
    }

    /// Memory-first, durable-fallback read.
    pub async fn get(&self, id: &str) -> Result<Option<ExecutionView>> {
        if let Some(instance) = self.get_live(id) {
            return Ok(Some(ExecutionView::Live(instance)));
        }
        Ok(self.durable.get(id).await?.map(ExecutionView::Archived))
    }

    /// Move a terminal instance's snapshot into durable storage and drop it
    /// from the live index. No-op (but still snapshots) if called on a
    /// non-terminal instance — callers are expected to call this only once
    /// an execution reaches a terminal status.
    pub async fn archive(&self, id: &str) -> Result<()> {
        if let Some((_, instance)) = self.live.remove(id) {
            self.durable.save(ExecutionRecord::snapshot(&instance)).await?;
        }
        Ok(())
    }

    /// Every execution known to this store, memory ∪ durable, memory
    /// winning ties, sorted by `createdAt` descending.
    pub async fn list(&self) -> Result<Vec<ExecutionView>> {
        let mut seen = std::collections::HashSet::new();
        let mut views: Vec<ExecutionView> = Vec::new();

        for entry in self.live.iter() {
            seen.insert(entry.key().clone());
            views.push(ExecutionView::Live(entry.value().clone()));
        }
        for record in self.durable.list().await? {
            if seen.insert(record.id.clone()) {
                views.push(ExecutionView::Archived(record));
            }
        }

        views.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(views)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.live.remove(id);
        self.durable.delete(id).await
    }

    /// Walk the `parentExecutionId` chain, up to `max_depth` hops, looking
    /// for the nearest ancestor with a non-empty flow to seed a new child.
    /// Falls back to an empty shell if none is found (e.g. the whole chain
    /// was reaped, or `parent_id` is `None`).
    pub async fn resolve_seed_flow(&self, parent_id: Option<&str>, max_depth: u32) -> Flow {
        let mut current = parent_id.map(|s| s.to_string());
        for _ in 0..max_depth {
            let Some(id) = current else { break };
            let Ok(Some(view)) = self.get(&id).await else { break };
            let flow = view.initial_state_flow();
            if !flow.nodes.is_empty() {
                return flow;
            }
            current = view.parent_execution_id();
        }
        Flow::shell("unknown", "unknown")
    }
}
