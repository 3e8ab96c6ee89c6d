//! C5 — Execution Service: the orchestrator. Owns the event queue and
//! engine wiring for every execution, dispatches engine events to the
//! event store and the execution store, spawns children for in-flow
//! emitted events, and exposes the debugger control surface.
//!
//! A long-lived service owning per-run state and dispatching callbacks
//! into storage, combined with depth-gated spawn logic for parent/child
//! executions built fresh for this crate.

use crate::config::ExecutionCoreConfig;
use crate::context::{EventData, ExecutionContext};
use crate::engine::{DefaultEngine, Engine, EngineOptions, NodeRuntime};
use crate::error::{ExecutionError, Result};
use crate::events::{ExecutionEvent, ExecutionEventType};
use crate::execution_store::{DurableExecutionSink, ExecutionStore};
use crate::event_store::{DurableEventSink, EventStore};
use crate::flow::Flow;
use crate::ids;
use crate::instance::{ExecutionInstance, Status};
use crate::queue::{EventIterator, EventQueue};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Partition a flat external-event list the way the orchestrator replays
/// them to a flow: split into runs where no event type repeats within a
/// run. `[A,B,A,A,C,B]` becomes `[[A,B],[A],[A,C,B]]` — each run is a set
/// of events a flow can reasonably see "at once" without one type
/// shadowing an earlier occurrence of itself.
pub fn group_external_events(events: Vec<serde_json::Value>) -> Vec<Vec<serde_json::Value>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut seen_types = std::collections::HashSet::new();

    for event in events {
        let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
        if seen_types.contains(&event_type) {
            groups.push(std::mem::take(&mut current));
            seen_types.clear();
        }
        seen_types.insert(event_type);
        current.push(event);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Per-execution engine overrides passed to `createExecution`. Any field
/// left `None` falls back to the service-wide config default.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub max_concurrency: Option<usize>,
    pub node_timeout_ms: Option<u64>,
    pub flow_timeout_ms: Option<u64>,
}

/// Debugger opt-in for one execution — `pause`/`step`/breakpoint calls on
/// an execution created with `enabled = false` fail `NoDebugger`.
#[derive(Debug, Clone, Default)]
pub struct DebugOptions {
    pub enabled: bool,
    pub breakpoints: Vec<String>,
}

struct ServiceInner {
    config: ExecutionCoreConfig,
    execution_store: Arc<ExecutionStore>,
    event_store: EventStore,
    queues: DashMap<String, EventQueue>,
    node_runtime: Arc<dyn NodeRuntime>,
    /// Terminal outcome an execution's engine already reported, held back
    /// because the execution still had living children when it arrived.
    pending_parent_completion: DashMap<String, (ExecutionEventType, serde_json::Value)>,
}

/// The orchestrator. Cheap to clone — every clone shares the same
/// underlying state, which is what lets the event dispatcher recursively
/// call back into execution creation from inside a spawned task.
#[derive(Clone)]
pub struct ExecutionService {
    inner: Arc<ServiceInner>,
}

impl ExecutionService {
    pub fn new(
        config: ExecutionCoreConfig,
        event_sink: Arc<dyn DurableEventSink>,
        execution_sink: Arc<dyn DurableExecutionSink>,
        node_runtime: Arc<dyn NodeRuntime>,
    ) -> Self {
        let event_store = EventStore::new(
            event_sink,
            config.event_store.batch_size,
            Duration::from_millis(config.event_store.batch_timeout_ms),
        );
        Self {
            inner: Arc::new(ServiceInner {
                execution_store: Arc::new(ExecutionStore::new(execution_sink)),
                event_store,
                queues: DashMap::new(),
                node_runtime,
                pending_parent_completion: DashMap::new(),
                config,
            }),
        }
    }

    pub fn execution_store(&self) -> Arc<ExecutionStore> {
        self.inner.execution_store.clone()
    }

    pub fn event_store(&self) -> &EventStore {
        &self.inner.event_store
    }

    fn get_live_or_not_found(&self, id: &str) -> Result<Arc<ExecutionInstance>> {
        self.inner
            .execution_store
            .get_live(id)
            .ok_or_else(|| ExecutionError::NotFound(id.to_string()))
    }

    /// Create (but do not start) a new execution. `parent_execution_id` and
    /// `event_data` are set together when spawning a child from an
    /// in-flow emitted event. `options` overrides the service-wide engine
    /// defaults for this execution only; `debug` opts this execution into
    /// the pause/step/breakpoint control surface and seeds its initial
    /// breakpoint set.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_execution(
        &self,
        flow: Flow,
        integrations: serde_json::Value,
        parent_execution_id: Option<String>,
        event_data: Option<EventData>,
        options: ExecutionOptions,
        debug: DebugOptions,
    ) -> Result<String> {
        // A root execution starts at depth 1; MAX_DEPTH only guards the
        // parent/child chain, so root creation is never gated by it.
        let depth = match &parent_execution_id {
            Some(parent_id) => {
                let parent = self.get_live_or_not_found(parent_id)?;
                let depth = parent.execution_depth + 1;
                if depth > self.inner.config.max_depth {
                    return Err(ExecutionError::CycleDetected { max_depth: self.inner.config.max_depth });
                }
                depth
            }
            None => 1,
        };

        let id = ids::execution_id();
        let mut ctx = ExecutionContext::new(id.clone(), flow.id.clone(), integrations);
        if let Some(data) = event_data {
            ctx = ctx.with_event_data(data);
        }

        let engine_options = EngineOptions {
            max_concurrency: options.max_concurrency.unwrap_or(self.inner.config.max_concurrency),
            node_timeout_ms: options.node_timeout_ms,
            flow_timeout_ms: options.flow_timeout_ms,
        };
        let engine: Arc<dyn Engine> =
            Arc::new(DefaultEngine::new(flow.clone_deep(), ctx.clone(), self.inner.node_runtime.clone(), engine_options));

        if debug.enabled {
            for node_id in &debug.breakpoints {
                engine.debugger().add_breakpoint(node_id);
            }
        }

        let instance = Arc::new(ExecutionInstance::new(
            id.clone(),
            flow.id.clone(),
            &flow,
            flow.clone_deep(),
            ctx,
            engine.clone(),
            parent_execution_id,
            depth,
            debug.enabled,
        ));

        let queue = EventQueue::new(self.inner.config.queue.subscriber_capacity);
        self.inner.queues.insert(id.clone(), queue.clone());
        self.inner.execution_store.insert_live(instance.clone());

        let svc = self.clone();
        let instance_for_cb = instance.clone();
        let queue_for_cb = queue.clone();
        engine.set_event_callback(Arc::new(move |event_type, data| {
            let svc = svc.clone();
            let instance = instance_for_cb.clone();
            let queue = queue_for_cb.clone();
            tokio::spawn(async move {
                svc.handle_engine_event(instance, queue, event_type, data).await;
            });
        }));

        Ok(id)
    }

    /// Start a created execution. Returns once the engine run (or, in
    /// container mode, every spawned child) has been scheduled — callers
    /// observe progress via [`Self::subscribe`].
    pub async fn start_execution(&self, id: &str, external_events: Vec<serde_json::Value>, container_mode: bool) -> Result<()> {
        let instance = self.get_live_or_not_found(id)?;
        if instance.status() != Status::Created {
            return Err(ExecutionError::bad_state("start", instance.status()));
        }
        instance.set_external_events(external_events.clone());

        if container_mode && !external_events.is_empty() {
            let queue = self
                .inner
                .queues
                .get(id)
                .map(|q| q.clone())
                .ok_or_else(|| ExecutionError::NotFound(id.to_string()))?;
            instance.transition(Status::Running)?;

            // The instance is a pure spawning shell here: it runs no graph
            // of its own. Every event, in input order regardless of how
            // `group_external_events` partitions them, becomes one child.
            for group in group_external_events(external_events) {
                for event in group {
                    let event_name = event.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let event_data = EventData { event_name, payload: event, emitted_by: "external".to_string() };
                    self.spawn_child(&instance, &queue, event_data, None).await;
                }
            }

            // Reuse the same stash-and-replay mechanism in-flow spawns use
            // to defer a parent's completion behind its living children:
            // feed this container's own completion through it too.
            self.handle_engine_event(instance, queue, ExecutionEventType::FlowCompleted, serde_json::json!({})).await;
            return Ok(());
        }

        instance.transition(Status::Running)?;
        let engine = instance.engine.clone();
        tokio::spawn(async move {
            engine.execute().await;
        });
        Ok(())
    }

    /// Soft-cancel a running or paused execution, or directly stop one
    /// that was never started, then cascade the stop to every descendant
    /// best-effort — a child that fails to stop is logged, not raised.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let instance = self.get_live_or_not_found(id)?;
        self.stop_one(&instance).await?;
        self.stop_children_best_effort(&instance).await;
        Ok(())
    }

    async fn stop_one(&self, instance: &Arc<ExecutionInstance>) -> Result<()> {
        match instance.status() {
            Status::Created => {
                instance.transition(Status::Stopped)?;
                self.inner.execution_store.archive(&instance.id).await?;
                if let Some(queue) = self.inner.queues.get(&instance.id) {
                    queue.close();
                }
                Ok(())
            }
            Status::Running | Status::Paused => {
                instance.context.cancel();
                instance.engine.debugger().continue_();
                Ok(())
            }
            other => Err(ExecutionError::bad_state("stop", other)),
        }
    }

    /// Iterative (not recursive) breadth-first walk of the child tree,
    /// stopping every still-live descendant. Avoids the recursive-async-fn
    /// trap of a `stop` that calls itself.
    async fn stop_children_best_effort(&self, instance: &Arc<ExecutionInstance>) {
        let mut frontier: Vec<String> = instance.children().into_iter().collect();
        let mut visited = std::collections::HashSet::new();
        while let Some(child_id) = frontier.pop() {
            if !visited.insert(child_id.clone()) {
                continue;
            }
            let Some(child) = self.inner.execution_store.get_live(&child_id) else {
                continue;
            };
            frontier.extend(child.children());
            if let Err(err) = self.stop_one(&child).await {
                tracing::warn!(execution_id = %child_id, error = %err, "failed to stop child execution");
            }
        }
    }

    pub fn pause(&self, id: &str) -> Result<()> {
        let instance = self.get_live_or_not_found(id)?;
        if instance.status() != Status::Running {
            return Err(ExecutionError::bad_state("pause", instance.status()));
        }
        instance.require_debug()?;
        instance.engine.debugger().pause();
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        let instance = self.get_live_or_not_found(id)?;
        match instance.status() {
            Status::Running => Ok(()), // no-op: already running
            Status::Paused => {
                instance.require_debug()?;
                instance.engine.debugger().continue_();
                Ok(())
            }
            other => Err(ExecutionError::bad_state("resume", other)),
        }
    }

    pub fn step(&self, id: &str) -> Result<()> {
        let instance = self.get_live_or_not_found(id)?;
        if instance.status() != Status::Paused {
            return Err(ExecutionError::bad_state("step", instance.status()));
        }
        instance.require_debug()?;
        instance.engine.debugger().step();
        Ok(())
    }

    pub fn add_breakpoint(&self, id: &str, node_id: &str) -> Result<()> {
        let instance = self.get_live_or_not_found(id)?;
        instance.require_debug()?;
        if !instance.has_node(node_id) {
            return Err(ExecutionError::NotFound(node_id.to_string()));
        }
        instance.engine.debugger().add_breakpoint(node_id);
        Ok(())
    }

    pub fn remove_breakpoint(&self, id: &str, node_id: &str) -> Result<()> {
        let instance = self.get_live_or_not_found(id)?;
        instance.require_debug()?;
        instance.engine.debugger().remove_breakpoint(node_id);
        Ok(())
    }

    /// Subscribe to an execution's event stream. Publishes a
    /// `FlowSubscribed` event, carrying the flow snapshot, visible to this
    /// and every other subscriber.
    pub async fn subscribe(&self, id: &str) -> Result<EventIterator> {
        let queue = self
            .inner
            .queues
            .get(id)
            .map(|q| q.clone())
            .ok_or_else(|| ExecutionError::NotFound(id.to_string()))?;
        let flow = self
            .inner
            .execution_store
            .get(id)
            .await?
            .map(|view| view.initial_state_flow())
            .ok_or_else(|| ExecutionError::NotFound(id.to_string()))?;
        let iterator = queue.subscribe();
        let event = queue.publish(ExecutionEvent::new(
            ExecutionEventType::FlowSubscribed,
            serde_json::json!({"flow": flow}),
        ));
        self.inner.event_store.add_event(id, event).await;
        Ok(iterator)
    }

    /// Tear down a terminal execution entirely: close its queue, drop it
    /// from the live queue index, clear any deferred parent-completion
    /// entry, and delete its durable record. The reaper's only write path.
    pub async fn dispose(&self, id: &str) -> Result<()> {
        if let Some((_, queue)) = self.inner.queues.remove(id) {
            queue.close();
        }
        self.inner.pending_parent_completion.remove(id);
        self.inner.execution_store.delete(id).await
    }

    async fn publish_and_persist(&self, queue: &EventQueue, execution_id: &str, event_type: ExecutionEventType, data: serde_json::Value) {
        let event = queue.publish(ExecutionEvent::new(event_type, data));
        self.inner.event_store.add_event(execution_id, event).await;
    }

    fn child_is_living(&self, child_id: &str) -> bool {
        self.inner
            .execution_store
            .get_live(child_id)
            .map(|child| !child.status().is_terminal())
            .unwrap_or(false)
    }

    async fn handle_engine_event(&self, instance: Arc<ExecutionInstance>, queue: EventQueue, event_type: ExecutionEventType, data: serde_json::Value) {
        let is_terminal = matches!(
            event_type,
            ExecutionEventType::FlowCompleted | ExecutionEventType::FlowFailed | ExecutionEventType::FlowCancelled
        );

        if is_terminal && instance.has_living_children(|id| self.child_is_living(id)) {
            self.inner.pending_parent_completion.insert(instance.id.clone(), (event_type, data));
            return;
        }

        self.publish_and_persist(&queue, &instance.id, event_type, data.clone()).await;

        match event_type {
            ExecutionEventType::FlowPaused => {
                let _ = instance.transition(Status::Paused);
            }
            ExecutionEventType::FlowResumed => {
                let _ = instance.transition(Status::Running);
            }
            _ => {}
        }

        self.spawn_children_for_unprocessed(&instance, &queue).await;

        if is_terminal {
            self.finalize_terminal(&instance, event_type).await;
        }
    }

    async fn finalize_terminal(&self, instance: &Arc<ExecutionInstance>, event_type: ExecutionEventType) {
        let status = match event_type {
            ExecutionEventType::FlowCompleted => Status::Completed,
            ExecutionEventType::FlowFailed => Status::Failed,
            ExecutionEventType::FlowCancelled => Status::Stopped,
            _ => return,
        };
        if let Err(err) = instance.transition(status) {
            tracing::warn!(execution_id = %instance.id, error = %err, "terminal transition rejected");
        }
        if let Err(err) = self.inner.execution_store.archive(&instance.id).await {
            tracing::warn!(execution_id = %instance.id, error = %err, "failed to archive execution");
        }
        if let Some(queue) = self.inner.queues.get(&instance.id) {
            queue.close();
        }

        if let Some(parent_id) = instance.parent_execution_id.clone() {
            if let Some(parent_queue) = self.inner.queues.get(&parent_id).map(|q| q.clone()) {
                let child_event_type = if status == Status::Completed {
                    ExecutionEventType::ChildExecutionCompleted
                } else {
                    ExecutionEventType::ChildExecutionFailed
                };
                self.publish_and_persist(
                    &parent_queue,
                    &parent_id,
                    child_event_type,
                    serde_json::json!({"childExecutionId": instance.id}),
                )
                .await;
            }
            self.check_parent_completion(&parent_id).await;
        }
    }

    /// Re-evaluate a parent whose own terminal outcome was deferred while
    /// it had living children. Called after each child's terminal
    /// transition; finalizes the parent once none remain.
    async fn check_parent_completion(&self, parent_id: &str) {
        let Some(parent) = self.inner.execution_store.get_live(parent_id) else {
            return;
        };
        if parent.has_living_children(|id| self.child_is_living(id)) {
            return;
        }
        let Some((_, (event_type, data))) = self.inner.pending_parent_completion.remove(parent_id) else {
            return;
        };
        let Some(queue) = self.inner.queues.get(parent_id).map(|q| q.clone()) else {
            return;
        };
        self.publish_and_persist(&queue, parent_id, event_type, data).await;
        self.finalize_terminal(&parent, event_type).await;
    }

    /// Walk `context.unprocessed_events()`, spawning (and auto-starting) a
    /// child execution for each. Depth-limit violations become a
    /// synthetic `ChildExecutionFailed` on the parent's own stream instead
    /// of failing the parent.
    async fn spawn_children_for_unprocessed(&self, instance: &Arc<ExecutionInstance>, queue: &EventQueue) {
        for emitted in instance.context.unprocessed_events() {
            let event_data = EventData {
                event_name: emitted.event_type.clone(),
                payload: emitted.data.clone(),
                emitted_by: emitted.emitted_by.clone(),
            };
            let child_id = self.spawn_child(instance, queue, event_data, Some(&emitted.id)).await;
            instance.context.mark_processed(&emitted.id, child_id);
        }
    }

    /// Spawn one child execution seeded with `event_data`, inheriting the
    /// parent's `initialStateFlow`, integrations, and engine options.
    /// Depth-limit violations publish a synthetic `ChildExecutionFailed`
    /// on the parent's stream and return `None` without touching the
    /// parent's own status. Used both for in-flow emitted events and for
    /// container-mode external events.
    async fn spawn_child(
        &self,
        instance: &Arc<ExecutionInstance>,
        queue: &EventQueue,
        event_data: EventData,
        emitted_event_id: Option<&str>,
    ) -> Option<String> {
        if instance.execution_depth + 1 > self.inner.config.max_depth {
            let mut failure = serde_json::json!({"reason": "max execution depth exceeded"});
            if let Some(event_id) = emitted_event_id {
                failure["emittedEventId"] = serde_json::json!(event_id);
            }
            self.publish_and_persist(queue, &instance.id, ExecutionEventType::ChildExecutionFailed, failure).await;
            return None;
        }

        let seed_flow = instance.initial_state_flow.clone_deep();
        let integrations = instance.context.integrations.clone();
        let parent_options = instance.options();
        let options = ExecutionOptions {
            max_concurrency: Some(parent_options.max_concurrency),
            node_timeout_ms: parent_options.node_timeout_ms,
            flow_timeout_ms: parent_options.flow_timeout_ms,
        };

        match self
            .create_execution(seed_flow, integrations, Some(instance.id.clone()), Some(event_data), options, DebugOptions::default())
            .await
        {
            Ok(child_id) => {
                instance.add_child(child_id.clone());
                self.publish_and_persist(
                    queue,
                    &instance.id,
                    ExecutionEventType::ChildExecutionSpawned,
                    serde_json::json!({"childExecutionId": child_id}),
                )
                .await;

                let svc = self.clone();
                let start_id = child_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = svc.start_execution(&start_id, vec![], false).await {
                        tracing::warn!(child_id = %start_id, error = %err, "failed to start spawned child execution");
                    }
                });
                Some(child_id)
            }
            Err(err) => {
                tracing::warn!(execution_id = %instance.id, error = %err, "failed to spawn child execution");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventSink;
    use crate::execution_store::InMemoryExecutionSink;
    use crate::flow::Node;
    use async_trait::async_trait;
    use tokio::time::{sleep, timeout};

    fn test_config() -> ExecutionCoreConfig {
        let mut config = ExecutionCoreConfig::default();
        config.queue.subscriber_capacity = 50;
        config
    }

    fn service_with_runtime(runtime: Arc<dyn NodeRuntime>) -> ExecutionService {
        ExecutionService::new(
            test_config(),
            Arc::new(InMemoryEventSink::new()),
            Arc::new(InMemoryExecutionSink::new()),
            runtime,
        )
    }

    struct EchoRuntime;
    #[async_trait]
    impl NodeRuntime for EchoRuntime {
        async fn execute(&self, node: &Node, _ctx: &ExecutionContext, _inputs: serde_json::Value) -> Result<serde_json::Value> {
            Ok(serde_json::json!({"node": node.id}))
        }
    }

    fn single_node_flow() -> Flow {
        Flow {
            id: "flow-1".into(),
            name: "single".into(),
            nodes: vec![Node { id: "a".into(), kind: "set".into(), config: serde_json::json!({}) }],
            edges: vec![],
            initial_state: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_then_start_runs_to_completion() {
        let svc = service_with_runtime(Arc::new(EchoRuntime));
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let mut events = svc.subscribe(&id).await.unwrap();
        svc.start_execution(&id, vec![], false).await.unwrap();

        let mut saw_completed = false;
        while let Some(event) = timeout(Duration::from_secs(2), events.next()).await.unwrap() {
            if event.event_type == ExecutionEventType::FlowCompleted {
                saw_completed = true;
                break;
            }
        }
        assert!(saw_completed);

        sleep(Duration::from_millis(20)).await;
        let view = svc.execution_store().get(&id).await.unwrap().unwrap();
        assert_eq!(view.status(), Status::Completed);
    }

    #[tokio::test]
    async fn stop_before_start_transitions_directly_to_stopped() {
        let svc = service_with_runtime(Arc::new(EchoRuntime));
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        svc.stop(&id).await.unwrap();

        let view = svc.execution_store().get(&id).await.unwrap().unwrap();
        assert_eq!(view.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn pause_while_created_is_bad_state() {
        let svc = service_with_runtime(Arc::new(EchoRuntime));
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let err = svc.pause(&id).unwrap_err();
        assert!(matches!(err, ExecutionError::BadState { .. }));
    }

    struct EmittingRuntime;
    #[async_trait]
    impl NodeRuntime for EmittingRuntime {
        async fn execute(&self, node: &Node, ctx: &ExecutionContext, _inputs: serde_json::Value) -> Result<serde_json::Value> {
            if node.id == "a" {
                ctx.emit_event("spawn-child", serde_json::json!({"n": 1}), "a");
            }
            Ok(serde_json::json!({}))
        }
    }

    #[tokio::test]
    async fn node_emitted_event_spawns_and_starts_a_child() {
        let svc = service_with_runtime(Arc::new(EmittingRuntime));
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let mut events = svc.subscribe(&id).await.unwrap();
        svc.start_execution(&id, vec![], false).await.unwrap();

        let mut spawned_child_id = None;
        while let Some(event) = timeout(Duration::from_secs(2), events.next()).await.unwrap() {
            if event.event_type == ExecutionEventType::ChildExecutionSpawned {
                spawned_child_id = event.data.get("childExecutionId").and_then(|v| v.as_str()).map(String::from);
            }
            if event.event_type == ExecutionEventType::FlowCompleted {
                break;
            }
        }
        let child_id = spawned_child_id.expect("a child should have been spawned");

        // Give the child a moment to run to completion on its own.
        sleep(Duration::from_millis(50)).await;
        let child_view = svc.execution_store().get(&child_id).await.unwrap().unwrap();
        assert_eq!(child_view.status(), Status::Completed);
    }

    #[tokio::test]
    async fn depth_exceeding_max_becomes_synthetic_child_failure_not_a_parent_failure() {
        let mut config = test_config();
        config.max_depth = 0;
        let svc = ExecutionService::new(
            config,
            Arc::new(InMemoryEventSink::new()),
            Arc::new(InMemoryExecutionSink::new()),
            Arc::new(EmittingRuntime) as Arc<dyn NodeRuntime>,
        );
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let mut events = svc.subscribe(&id).await.unwrap();
        svc.start_execution(&id, vec![], false).await.unwrap();

        let mut saw_child_failed = false;
        let mut saw_flow_completed = false;
        while let Some(event) = timeout(Duration::from_secs(2), events.next()).await.unwrap() {
            match event.event_type {
                ExecutionEventType::ChildExecutionFailed => saw_child_failed = true,
                ExecutionEventType::FlowCompleted => {
                    saw_flow_completed = true;
                    break;
                }
                ExecutionEventType::FlowFailed => panic!("parent must not fail due to a depth-limited child"),
                _ => {}
            }
        }
        assert!(saw_child_failed);
        assert!(saw_flow_completed);
    }

    struct HangingRuntime;
    #[async_trait]
    impl NodeRuntime for HangingRuntime {
        async fn execute(&self, _node: &Node, ctx: &ExecutionContext, _inputs: serde_json::Value) -> Result<serde_json::Value> {
            ctx.cancellation().cancelled().await;
            Err(ExecutionError::Internal("node observed cancellation".into()))
        }
    }

    #[tokio::test]
    async fn container_mode_spawns_one_child_per_external_event_and_waits_for_all() {
        let svc = service_with_runtime(Arc::new(EchoRuntime));
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let mut events = svc.subscribe(&id).await.unwrap();
        let external_events = vec![
            serde_json::json!({"type": "A"}),
            serde_json::json!({"type": "B"}),
            serde_json::json!({"type": "A"}),
            serde_json::json!({"type": "A"}),
            serde_json::json!({"type": "C"}),
            serde_json::json!({"type": "B"}),
        ];
        svc.start_execution(&id, external_events, true).await.unwrap();

        let mut spawned = Vec::new();
        let mut saw_completed = false;
        while let Some(event) = timeout(Duration::from_secs(2), events.next()).await.unwrap() {
            match event.event_type {
                ExecutionEventType::ChildExecutionSpawned => {
                    spawned.push(event.data.get("childExecutionId").and_then(|v| v.as_str()).unwrap().to_string());
                }
                ExecutionEventType::FlowCompleted => {
                    saw_completed = true;
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(spawned.len(), 6, "one child per external event");
        let unique: std::collections::HashSet<_> = spawned.iter().collect();
        assert_eq!(unique.len(), 6, "each event gets its own distinct child");
        assert!(saw_completed, "the container itself must still report FlowCompleted");

        sleep(Duration::from_millis(50)).await;
        for child_id in &spawned {
            let view = svc.execution_store().get(child_id).await.unwrap().unwrap();
            assert_eq!(view.status(), Status::Completed);
        }
    }

    #[tokio::test]
    async fn stop_cascades_best_effort_to_every_live_child() {
        let svc = service_with_runtime(Arc::new(HangingRuntime));
        let parent_id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let mut parent_events = svc.subscribe(&parent_id).await.unwrap();
        svc.start_execution(&parent_id, vec![], false).await.unwrap();
        let parent = svc.execution_store().get_live(&parent_id).unwrap();

        let mut child_ids = Vec::new();
        let mut child_events = Vec::new();
        for _ in 0..3 {
            let child_id = svc
                .create_execution(single_node_flow(), serde_json::json!({}), Some(parent_id.clone()), None, ExecutionOptions::default(), DebugOptions::default())
                .await
                .unwrap();
            parent.add_child(child_id.clone());
            child_events.push(svc.subscribe(&child_id).await.unwrap());
            svc.start_execution(&child_id, vec![], false).await.unwrap();
            child_ids.push(child_id);
        }

        // Give every node a moment to actually start (and hang) before stopping.
        sleep(Duration::from_millis(30)).await;
        svc.stop(&parent_id).await.unwrap();

        async fn wait_for_cancelled(events: &mut EventIterator) {
            while let Some(event) = timeout(Duration::from_secs(2), events.next()).await.unwrap() {
                if event.event_type == ExecutionEventType::FlowCancelled {
                    return;
                }
            }
            panic!("stream ended before FlowCancelled");
        }

        wait_for_cancelled(&mut parent_events).await;
        for events in &mut child_events {
            wait_for_cancelled(events).await;
        }

        sleep(Duration::from_millis(20)).await;
        assert_eq!(svc.execution_store().get(&parent_id).await.unwrap().unwrap().status(), Status::Stopped);
        for child_id in &child_ids {
            assert_eq!(svc.execution_store().get(child_id).await.unwrap().unwrap().status(), Status::Stopped, "every child must also be stopped");
        }
    }

    #[tokio::test]
    async fn depth_guard_stops_a_self_spawning_chain_at_max_depth() {
        let mut config = test_config();
        config.max_depth = 3;
        let svc = ExecutionService::new(
            config,
            Arc::new(InMemoryEventSink::new()),
            Arc::new(InMemoryExecutionSink::new()),
            Arc::new(EmittingRuntime) as Arc<dyn NodeRuntime>,
        );
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        svc.start_execution(&id, vec![], false).await.unwrap();

        // Poll until the self-spawning chain stops growing.
        let mut views = Vec::new();
        for _ in 0..100 {
            views = svc.execution_store().list().await.unwrap();
            if views.len() >= 3 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        // Give a would-be fourth generation time to show up if the guard failed.
        sleep(Duration::from_millis(100)).await;
        views = svc.execution_store().list().await.unwrap();

        assert_eq!(views.len(), 3, "chain must halt at root + 2 descendants under max_depth=3");
        for view in &views {
            let mut chain_len: u32 = 1;
            let mut current = view.parent_execution_id();
            while let Some(parent_id) = current {
                chain_len += 1;
                current = views.iter().find(|v| v.id() == parent_id).and_then(|v| v.parent_execution_id());
            }
            assert!(chain_len <= 3, "no execution may exceed max_depth");
        }
    }

    #[tokio::test]
    async fn spawn_child_past_max_depth_emits_synthetic_failure_with_emitted_event_id() {
        let mut config = test_config();
        config.max_depth = 1;
        let svc = ExecutionService::new(
            config,
            Arc::new(InMemoryEventSink::new()),
            Arc::new(InMemoryExecutionSink::new()),
            Arc::new(EchoRuntime) as Arc<dyn NodeRuntime>,
        );
        let id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let mut events = svc.subscribe(&id).await.unwrap();
        let subscribed = timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(subscribed.event_type, ExecutionEventType::FlowSubscribed);

        let instance = svc.execution_store().get_live(&id).unwrap();
        let queue = svc.inner.queues.get(&id).map(|q| q.clone()).unwrap();
        let event_data = EventData { event_name: "spawn".into(), payload: serde_json::json!({}), emitted_by: "test".into() };
        let child_id = svc.spawn_child(&instance, &queue, event_data, Some("evt-1")).await;
        assert!(child_id.is_none(), "a spawn past max_depth must not produce a child");

        let failure_event = timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(failure_event.event_type, ExecutionEventType::ChildExecutionFailed);
        assert_eq!(failure_event.data.get("emittedEventId").and_then(|v| v.as_str()), Some("evt-1"));
    }

    #[tokio::test]
    async fn parent_terminal_event_is_deferred_while_a_child_is_still_live() {
        let svc = service_with_runtime(Arc::new(EchoRuntime));
        let parent_id = svc.create_execution(single_node_flow(), serde_json::json!({}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();
        let mut events = svc.subscribe(&parent_id).await.unwrap();
        let subscribed = timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(subscribed.event_type, ExecutionEventType::FlowSubscribed);

        let parent = svc.execution_store().get_live(&parent_id).unwrap();
        parent.transition(Status::Running).unwrap();
        let queue = svc.inner.queues.get(&parent_id).map(|q| q.clone()).unwrap();
        let child_id = svc
            .create_execution(single_node_flow(), serde_json::json!({}), Some(parent_id.clone()), None, ExecutionOptions::default(), DebugOptions::default())
            .await
            .unwrap();
        parent.add_child(child_id.clone());

        svc.handle_engine_event(parent.clone(), queue.clone(), ExecutionEventType::FlowCompleted, serde_json::json!({})).await;

        let deferred = timeout(Duration::from_millis(100), events.next()).await;
        assert!(deferred.is_err(), "FlowCompleted must not reach subscribers while a child is still live");
        assert_ne!(parent.status(), Status::Completed);

        let child = svc.execution_store().get_live(&child_id).unwrap();
        child.transition(Status::Running).unwrap();
        child.transition(Status::Completed).unwrap();
        svc.check_parent_completion(&parent_id).await;

        let released = timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(released.event_type, ExecutionEventType::FlowCompleted);
        assert_eq!(parent.status(), Status::Completed);
    }

    #[tokio::test]
    async fn sibling_children_do_not_share_emitted_event_state() {
        let svc = service_with_runtime(Arc::new(EchoRuntime));
        let parent_id = svc.create_execution(single_node_flow(), serde_json::json!({"shared": "value"}), None, None, ExecutionOptions::default(), DebugOptions::default()).await.unwrap();

        let child_a_id = svc
            .create_execution(single_node_flow(), serde_json::json!({"shared": "value"}), Some(parent_id.clone()), None, ExecutionOptions::default(), DebugOptions::default())
            .await
            .unwrap();
        let child_b_id = svc
            .create_execution(single_node_flow(), serde_json::json!({"shared": "value"}), Some(parent_id.clone()), None, ExecutionOptions::default(), DebugOptions::default())
            .await
            .unwrap();

        let child_a = svc.execution_store().get_live(&child_a_id).unwrap();
        let child_b = svc.execution_store().get_live(&child_b_id).unwrap();

        child_a.context.emit_event("only-in-a", serde_json::json!({}), "test");
        assert_eq!(child_a.context.emitted_events().len(), 1);
        assert!(child_b.context.emitted_events().is_empty(), "siblings must not share emitted-event state");
    }

    #[tokio::test]
    async fn group_external_events_partitions_on_repeated_types() {
        let events = vec![
            serde_json::json!({"type": "A"}),
            serde_json::json!({"type": "B"}),
            serde_json::json!({"type": "A"}),
            serde_json::json!({"type": "A"}),
            serde_json::json!({"type": "C"}),
            serde_json::json!({"type": "B"}),
        ];
        let groups = group_external_events(events);
        let type_groups: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|e| e.get("type").unwrap().as_str().unwrap()).collect())
            .collect();
        assert_eq!(type_groups, vec![vec!["A", "B"], vec!["A"], vec!["A", "C", "B"]]);
    }
}
