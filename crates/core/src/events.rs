use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed state transition of a process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub instance_id: InstanceId,
    /// Per-instance sequence number, assigned by the event store on append
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl ExecutionEvent {
    /// Build an event that has not been appended yet
    pub fn new(instance_id: InstanceId, event_type: EventType) -> Self {
        Self {
            instance_id,
            seq: 0,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// One branch created by a parallel fork
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkBranch {
    pub token_id: TokenId,
    pub edge_id: EdgeId,
    pub node_id: NodeId,
}

/// Types of transitions recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Instance lifecycle events
    InstanceStarted {
        definition_id: DefinitionId,
        variables: Variables,
    },
    InstanceSuspended,
    InstanceResumed,
    InstanceCompleted,
    InstanceFailed {
        error: String,
    },
    InstanceTerminated {
        reason: String,
    },

    // Token lifecycle events
    TokenCreated {
        token_id: TokenId,
        node_id: NodeId,
    },
    TokenDispatched {
        token_id: TokenId,
    },
    TokenRequeued {
        token_id: TokenId,
    },
    TokenMoved {
        token_id: TokenId,
        edge_id: EdgeId,
        node_id: NodeId,
    },
    TokenWaiting {
        token_id: TokenId,
        wait: WaitKind,
    },
    /// A waiting token was released; `payload` is merged into the variables
    TokenSignalled {
        token_id: TokenId,
        timed_out: bool,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        payload: Variables,
    },
    TokenForked {
        token_id: TokenId,
        branches: Vec<ForkBranch>,
    },
    JoinReleased {
        join_id: NodeId,
        consumed: Vec<TokenId>,
        token_id: TokenId,
        edge_id: EdgeId,
        node_id: NodeId,
    },
    TokenConsumed {
        token_id: TokenId,
    },
    TokensVoided {
        tokens: Vec<TokenId>,
    },

    // Data events
    VariablesSet {
        values: Variables,
    },
}

/// Durable append-only log of execution events.
///
/// Ordering is only guaranteed within one instance; the engine is the single
/// writer for each instance.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, returning the sequence number assigned to it
    async fn append(&self, instance_id: InstanceId, event: &ExecutionEvent) -> anyhow::Result<u64>;

    /// Read all events of an instance with `seq >= from_seq`, in order
    async fn read_from(
        &self,
        instance_id: InstanceId,
        from_seq: u64,
    ) -> anyhow::Result<Vec<ExecutionEvent>>;

    /// All instances that have at least one event
    async fn instances(&self) -> anyhow::Result<Vec<InstanceId>>;
}
