//! C4 — Execution Engine: runs one flow over one context to completion.
//!
//! The engine's job stops at "run the graph" — it never touches the event
//! store, the execution store, or child spawning; it only reports what
//! happened through the event callback and its return value. That boundary,
//! and the debugger surface below it, follow a Pregel-style scheduler
//! (indegree-tracked, join-set-driven concurrent dispatch) for the
//! scheduling/retry shape, and an `InterruptConfig`/`InterruptTracker` split
//! for pause/step/breakpoint semantics.

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, Result};
use crate::events::ExecutionEventType;
use crate::flow::{Flow, Node};
use crate::instance::ExecutionFailure;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

/// What a node actually does. Business logic lives entirely behind this
/// trait — the engine only knows how to schedule and time it out.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext, inputs: serde_json::Value) -> Result<serde_json::Value>;
}

/// Tunables for one engine run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_concurrency: usize,
    pub node_timeout_ms: Option<u64>,
    pub flow_timeout_ms: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { max_concurrency: 8, node_timeout_ms: None, flow_timeout_ms: None }
    }
}

/// How one `execute()` call ended.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    Completed,
    Failed(ExecutionFailure),
    Cancelled,
}

/// Lifecycle/per-node event sink. The engine calls this for every event it
/// raises; the orchestrator wires it to the event queue and store.
pub type EventCallback = Arc<dyn Fn(ExecutionEventType, serde_json::Value) + Send + Sync>;

/// Pause/step/breakpoint control surface for one running execution.
pub trait Debugger: Send + Sync {
    fn add_breakpoint(&self, node_id: &str);
    fn remove_breakpoint(&self, node_id: &str);
    fn breakpoints(&self) -> Vec<String>;
    /// Request a pause at the next node boundary.
    fn pause(&self);
    fn continue_(&self);
    fn step(&self);
    fn is_paused(&self) -> bool;
}

/// Breakpoint/pause tracking for one execution: a single current pause
/// state plus the ability to resume, either freely (`continue_`) or one
/// node at a time (`step`).
#[derive(Default)]
pub struct DebuggerState {
    breakpoints: Mutex<HashSet<String>>,
    paused: AtomicBool,
    force_pause_next: AtomicBool,
    notify: Notify,
}

impl DebuggerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called by the engine before running `node_id`. Returns `true` if this
    /// node boundary is a pause point; the engine must then emit `FlowPaused`
    /// and call [`Self::wait_for_resume`].
    fn should_pause_before(&self, node_id: &str) -> bool {
        let hit_breakpoint = self.breakpoints.lock().contains(node_id);
        let should_pause = hit_breakpoint || self.paused.load(Ordering::SeqCst) || self.force_pause_next.swap(false, Ordering::SeqCst);
        if should_pause {
            self.paused.store(true, Ordering::SeqCst);
        }
        should_pause
    }

    async fn wait_for_resume(&self) {
        while self.paused.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }
}

impl Debugger for DebuggerState {
    fn add_breakpoint(&self, node_id: &str) {
        self.breakpoints.lock().insert(node_id.to_string());
    }

    fn remove_breakpoint(&self, node_id: &str) {
        self.breakpoints.lock().remove(node_id);
    }

    fn breakpoints(&self) -> Vec<String> {
        self.breakpoints.lock().iter().cloned().collect()
    }

    fn pause(&self) {
        self.force_pause_next.store(true, Ordering::SeqCst);
    }

    fn continue_(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn step(&self) {
        self.force_pause_next.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Runs one flow over one context, dispatching ready nodes concurrently as
/// their dependencies complete, bounded by `max_concurrency`.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn execute(&self) -> EngineOutcome;
    fn set_event_callback(&self, callback: EventCallback);
    fn debugger(&self) -> Arc<dyn Debugger>;
    fn options(&self) -> EngineOptions;
}

async fn run_node(
    node: Node,
    ctx: ExecutionContext,
    runtime: Arc<dyn NodeRuntime>,
    semaphore: Arc<Semaphore>,
    timeout_ms: Option<u64>,
) -> (String, Result<serde_json::Value>) {
    let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
    let fut = runtime.execute(&node, &ctx, serde_json::json!({}));
    let result = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
            Ok(r) => r,
            Err(_) => Err(ExecutionError::Internal(format!("node {} timed out", node.id))),
        },
        None => fut.await,
    };
    (node.id, result)
}

/// The default, dependency-ordered concurrent engine.
pub struct DefaultEngine {
    flow: Flow,
    context: ExecutionContext,
    node_runtime: Arc<dyn NodeRuntime>,
    options: EngineOptions,
    on_event: Mutex<Option<EventCallback>>,
    debugger: Arc<DebuggerState>,
}

impl DefaultEngine {
    pub fn new(flow: Flow, context: ExecutionContext, node_runtime: Arc<dyn NodeRuntime>, options: EngineOptions) -> Self {
        Self {
            flow,
            context,
            node_runtime,
            options,
            on_event: Mutex::new(None),
            debugger: DebuggerState::new(),
        }
    }

    fn emit(&self, event_type: ExecutionEventType, data: serde_json::Value) {
        if let Some(callback) = self.on_event.lock().as_ref() {
            callback(event_type, data);
        }
    }

    async fn run_inner(&self) -> EngineOutcome {
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for node in &self.flow.nodes {
            indegree.entry(node.id.clone()).or_insert(0);
        }
        for edge in &self.flow.edges {
            *indegree.entry(edge.to.clone()).or_insert(0) += 1;
            adjacency.entry(edge.from.clone()).or_default().push(edge.to.clone());
        }

        let node_by_id: HashMap<String, Node> =
            self.flow.nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();

        let mut ready: Vec<String> = indegree.iter().filter(|(_, &d)| d == 0).map(|(k, _)| k.clone()).collect();
        ready.sort();

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut join_set: JoinSet<(String, Result<serde_json::Value>)> = JoinSet::new();
        let total = self.flow.nodes.len();
        let mut finished = 0usize;
        let mut failure: Option<ExecutionFailure> = None;

        macro_rules! dispatch {
            ($node_id:expr) => {{
                if self.context.is_cancelled() {
                    // leave unscheduled; the cancellation check below ends the run
                } else {
                    if self.debugger.should_pause_before(&$node_id) {
                        self.emit(ExecutionEventType::FlowPaused, serde_json::json!({"nodeId": $node_id}));
                        self.debugger.wait_for_resume().await;
                        self.emit(ExecutionEventType::FlowResumed, serde_json::json!({"nodeId": $node_id}));
                    }
                    if self.context.is_cancelled() {
                        // cancelled while paused
                    } else {
                        let node = node_by_id.get(&$node_id).cloned().expect("ready node exists in flow");
                        self.emit(ExecutionEventType::NodeStarted, serde_json::json!({"nodeId": $node_id}));
                        join_set.spawn(run_node(node, self.context.clone(), self.node_runtime.clone(), semaphore.clone(), self.options.node_timeout_ms));
                    }
                }
            }};
        }

        for node_id in ready.drain(..) {
            dispatch!(node_id);
        }

        while finished < total {
            if self.context.is_cancelled() {
                join_set.abort_all();
                self.emit(ExecutionEventType::FlowCancelled, serde_json::json!({}));
                return EngineOutcome::Cancelled;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (node_id, result) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        continue;
                    }
                    (String::new(), Err(ExecutionError::Internal(join_err.to_string())))
                }
            };

            // A node can observe cancellation mid-execute and return its own
            // error in response; cancellation still wins over that error.
            if self.context.is_cancelled() {
                join_set.abort_all();
                self.emit(ExecutionEventType::FlowCancelled, serde_json::json!({}));
                return EngineOutcome::Cancelled;
            }
            finished += 1;

            match result {
                Ok(value) => {
                    self.emit(ExecutionEventType::NodeCompleted, serde_json::json!({"nodeId": node_id, "output": value}));
                    if let Some(next) = adjacency.get(&node_id) {
                        let mut newly_ready = Vec::new();
                        for succ in next {
                            let deg = indegree.get_mut(succ).expect("successor tracked");
                            *deg -= 1;
                            if *deg == 0 {
                                newly_ready.push(succ.clone());
                            }
                        }
                        newly_ready.sort();
                        for id in newly_ready {
                            dispatch!(id);
                        }
                    }
                }
                Err(err) => {
                    let node_failure = ExecutionFailure::new(err.to_string()).with_node(node_id.clone());
                    self.emit(
                        ExecutionEventType::NodeFailed,
                        serde_json::json!({"nodeId": node_id, "error": err.to_string()}),
                    );
                    failure = Some(node_failure);
                    join_set.abort_all();
                    break;
                }
            }
        }

        if let Some(failure) = failure {
            self.emit(ExecutionEventType::FlowFailed, serde_json::json!({"error": failure.message}));
            return EngineOutcome::Failed(failure);
        }

        if finished < total {
            // Graph had a cycle: some nodes never became ready.
            let failure = ExecutionFailure::new("cycle detected in flow graph");
            self.emit(ExecutionEventType::FlowFailed, serde_json::json!({"error": failure.message}));
            return EngineOutcome::Failed(failure);
        }

        self.emit(ExecutionEventType::FlowCompleted, serde_json::json!({}));
        EngineOutcome::Completed
    }
}

#[async_trait]
impl Engine for DefaultEngine {
    async fn execute(&self) -> EngineOutcome {
        match self.options.flow_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), self.run_inner()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let failure = ExecutionFailure::new("flow timed out");
                    self.emit(ExecutionEventType::FlowFailed, serde_json::json!({"error": failure.message}));
                    EngineOutcome::Failed(failure)
                }
            },
            None => self.run_inner().await,
        }
    }

    fn set_event_callback(&self, callback: EventCallback) {
        *self.on_event.lock() = Some(callback);
    }

    fn debugger(&self) -> Arc<dyn Debugger> {
        self.debugger.clone()
    }

    fn options(&self) -> EngineOptions {
        self.options.clone()
    }
}
