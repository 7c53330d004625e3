//! Definition builders and an in-memory engine harness shared by unit tests.

use crate::config::{EngineConfig, RetryPolicy};
use crate::definition::{DefinitionStore, Edge, Node, NodeKind, ProcessDefinitionSource};
use crate::engine::{Engine, TaskRegistry};
use crate::events::{EventStore, ExecutionEvent};
use crate::storage::{
    BlobStore, CheckpointStore, InMemoryBlobStore, InMemoryEventLog, InMemoryIndexStore, IndexStore,
};
use crate::types::{DefinitionId, InstanceId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn source(key: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> ProcessDefinitionSource {
    ProcessDefinitionSource {
        key: key.to_string(),
        name: None,
        nodes,
        edges,
    }
}

/// start -> task -> end
pub(crate) fn linear_source(key: &str) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("task", NodeKind::Task),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("start_to_task", "start", "task"),
            Edge::new("task_to_end", "task", "end"),
        ],
    )
}

fn assign(path: &str) -> NodeKind {
    NodeKind::ServiceTask {
        handler: "assign".to_string(),
        parameters: serde_json::json!({ "path": path }),
    }
}

/// start -> gateway -(amount > 100)-> approve | -(default)-> standard -> end.
/// Each branch records its name in the `path` variable.
pub(crate) fn exclusive_source(key: &str) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("gateway", NodeKind::ExclusiveGateway),
            Node::new("approve", assign("approve")),
            Node::new("standard", assign("standard")),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_gateway", "start", "gateway"),
            Edge::new("high", "gateway", "approve").with_condition("amount > 100"),
            Edge::new("low", "gateway", "standard").as_default(),
            Edge::new("approve_done", "approve", "end"),
            Edge::new("standard_done", "standard", "end"),
        ],
    )
}

/// start -> fork -> branch_0..branch_n -> join -> end
pub(crate) fn fork_join_source(key: &str, branches: usize) -> ProcessDefinitionSource {
    let mut nodes = vec![
        Node::new("start", NodeKind::StartEvent),
        Node::new("fork", NodeKind::ParallelGateway),
        Node::new("join", NodeKind::ParallelGateway),
        Node::new("end", NodeKind::EndEvent),
    ];
    let mut edges = vec![
        Edge::new("to_fork", "start", "fork"),
        Edge::new("join_to_end", "join", "end"),
    ];
    for i in 0..branches {
        let branch = format!("branch_{i}");
        nodes.push(Node::new(branch.clone(), NodeKind::Task));
        edges.push(Edge::new(format!("fork_{i}"), "fork", branch.clone()));
        edges.push(Edge::new(format!("to_join_{i}"), branch, "join"));
    }
    source(key, nodes, edges)
}

fn user_task(timeout_ms: Option<u64>) -> NodeKind {
    NodeKind::UserTask {
        assignee: None,
        timeout_ms,
    }
}

/// start -> review (user task) -> end
pub(crate) fn user_task_source(key: &str, timeout_ms: Option<u64>) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("review", user_task(timeout_ms)),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_review", "start", "review"),
            Edge::new("review_done", "review", "end"),
        ],
    )
}

/// start -> review (user task) -> notify (service task) -> end
pub(crate) fn review_then_notify_source(key: &str) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("review", user_task(None)),
            Node::new(
                "notify",
                NodeKind::ServiceTask {
                    handler: "notify".to_string(),
                    parameters: serde_json::Value::Null,
                },
            ),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_review", "start", "review"),
            Edge::new("to_notify", "review", "notify"),
            Edge::new("notify_done", "notify", "end"),
        ],
    )
}

/// start -> call (service task) -> end
pub(crate) fn service_source(key: &str, handler: &str, parameters: serde_json::Value) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new(
                "call",
                NodeKind::ServiceTask {
                    handler: handler.to_string(),
                    parameters,
                },
            ),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_call", "start", "call"),
            Edge::new("call_done", "call", "end"),
        ],
    )
}

/// start -> wait (timer) -> end
pub(crate) fn timer_source(key: &str, duration_ms: u64) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("wait", NodeKind::TimerEvent { duration_ms }),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_wait", "start", "wait"),
            Edge::new("wait_done", "wait", "end"),
        ],
    )
}

/// start -> fork -> left, right (user tasks) -> join -> end
pub(crate) fn parallel_review_source(key: &str) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("fork", NodeKind::ParallelGateway),
            Node::new("left", user_task(None)),
            Node::new("right", user_task(None)),
            Node::new("join", NodeKind::ParallelGateway),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_fork", "start", "fork"),
            Edge::new("fork_left", "fork", "left"),
            Edge::new("fork_right", "fork", "right"),
            Edge::new("left_done", "left", "join"),
            Edge::new("right_done", "right", "join"),
            Edge::new("join_to_end", "join", "end"),
        ],
    )
}

fn receive_task(message: &str, timeout_ms: Option<u64>) -> NodeKind {
    NodeKind::ReceiveTask {
        message: message.to_string(),
        timeout_ms,
    }
}

/// Two parallel receive tasks: `payment` waits for "payment_received",
/// `shipping` for "shipped" with an optional timeout
pub(crate) fn receive_source(key: &str, shipping_timeout_ms: Option<u64>) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("fork", NodeKind::ParallelGateway),
            Node::new("payment", receive_task("payment_received", None)),
            Node::new("shipping", receive_task("shipped", shipping_timeout_ms)),
            Node::new("join", NodeKind::ParallelGateway),
            Node::new("end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_fork", "start", "fork"),
            Edge::new("fork_payment", "fork", "payment"),
            Edge::new("fork_shipping", "fork", "shipping"),
            Edge::new("payment_done", "payment", "join"),
            Edge::new("shipping_done", "shipping", "join"),
            Edge::new("join_to_end", "join", "end"),
        ],
    )
}

/// A fork whose second branch only reaches the join when `go` is set;
/// otherwise it ends on its own and the join can never fill.
pub(crate) fn partial_join_source(key: &str) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("fork", NodeKind::ParallelGateway),
            Node::new("a", NodeKind::Task),
            Node::new("decide", NodeKind::ExclusiveGateway),
            Node::new("join", NodeKind::ParallelGateway),
            Node::new("end", NodeKind::EndEvent),
            Node::new("early_end", NodeKind::EndEvent),
        ],
        vec![
            Edge::new("to_fork", "start", "fork"),
            Edge::new("fork_a", "fork", "a"),
            Edge::new("fork_decide", "fork", "decide"),
            Edge::new("a_to_join", "a", "join"),
            Edge::new("decide_to_join", "decide", "join").with_condition("go"),
            Edge::new("decide_to_end", "decide", "early_end").as_default(),
            Edge::new("join_to_end", "join", "end"),
        ],
    )
}

/// Like [`partial_join_source`], but the default branch hits a terminate end
/// event while the other branch waits on a user task with a timeout.
pub(crate) fn terminate_source(key: &str) -> ProcessDefinitionSource {
    source(
        key,
        vec![
            Node::new("start", NodeKind::StartEvent),
            Node::new("fork", NodeKind::ParallelGateway),
            Node::new("left", user_task(Some(60_000))),
            Node::new("right", NodeKind::Task),
            Node::new("decide", NodeKind::ExclusiveGateway),
            Node::new("join", NodeKind::ParallelGateway),
            Node::new("end", NodeKind::EndEvent),
            Node::new("kill", NodeKind::TerminateEndEvent),
        ],
        vec![
            Edge::new("to_fork", "start", "fork"),
            Edge::new("fork_left", "fork", "left"),
            Edge::new("fork_right", "fork", "right"),
            Edge::new("left_done", "left", "join"),
            Edge::new("right_done", "right", "decide"),
            Edge::new("decide_to_join", "decide", "join").with_condition("never"),
            Edge::new("decide_to_kill", "decide", "kill").as_default(),
            Edge::new("join_to_end", "join", "end"),
        ],
    )
}

/// Event store that can be switched into failing every append
pub(crate) struct FlakyEventStore {
    inner: InMemoryEventLog,
    pub fail: AtomicBool,
    pub attempts: AtomicUsize,
}

impl FlakyEventStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryEventLog::new(),
            fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl EventStore for FlakyEventStore {
    async fn append(&self, instance_id: InstanceId, event: &ExecutionEvent) -> anyhow::Result<u64> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("disk unavailable");
        }
        self.inner.append(instance_id, event).await
    }

    async fn read_from(&self, instance_id: InstanceId, from_seq: u64) -> anyhow::Result<Vec<ExecutionEvent>> {
        self.inner.read_from(instance_id, from_seq).await
    }

    async fn instances(&self) -> anyhow::Result<Vec<InstanceId>> {
        self.inner.instances().await
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        checkpoint_interval: 64,
        storage_retry: RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
        },
    }
}

/// Engine over in-memory stores that can be "restarted" on the same stores
pub(crate) struct TestHarness {
    pub engine: Engine,
    pub events: Arc<dyn EventStore>,
    pub index: Arc<dyn IndexStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub flaky: Option<Arc<FlakyEventStore>>,
    config: EngineConfig,
    registry: Arc<TaskRegistry>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(test_config(), TaskRegistry::with_builtins(), None)
    }

    pub fn with_registry(registry: TaskRegistry) -> Self {
        Self::build(test_config(), registry, None)
    }

    pub fn with_checkpoint_interval(interval: u64) -> Self {
        let mut config = test_config();
        config.checkpoint_interval = interval;
        Self::build(config, TaskRegistry::with_builtins(), None)
    }

    pub fn with_flaky_store() -> Self {
        Self::build(
            test_config(),
            TaskRegistry::with_builtins(),
            Some(Arc::new(FlakyEventStore::new())),
        )
    }

    fn build(config: EngineConfig, registry: TaskRegistry, flaky: Option<Arc<FlakyEventStore>>) -> Self {
        let events: Arc<dyn EventStore> = match &flaky {
            Some(flaky) => flaky.clone(),
            None => Arc::new(InMemoryEventLog::new()),
        };
        let index: Arc<dyn IndexStore> = Arc::new(InMemoryIndexStore::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let registry = Arc::new(registry);

        let engine = Engine::new(
            config.clone(),
            Arc::new(DefinitionStore::new(index.clone())),
            events.clone(),
            CheckpointStore::new(blobs.clone(), index.clone()),
            registry.clone(),
        );

        Self {
            engine,
            events,
            index,
            blobs,
            flaky,
            config,
            registry,
        }
    }

    pub fn deploy(&self, source: ProcessDefinitionSource) -> DefinitionId {
        self.engine.definitions().deploy(source).unwrap()
    }

    /// A fresh engine over the same stores, with definitions reloaded but
    /// nothing recovered yet
    pub fn restart(&self) -> Engine {
        let definitions = Arc::new(DefinitionStore::new(self.index.clone()));
        definitions.load_persisted().unwrap();
        Engine::new(
            self.config.clone(),
            definitions,
            self.events.clone(),
            CheckpointStore::new(self.blobs.clone(), self.index.clone()),
            self.registry.clone(),
        )
    }
}
