use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Variable bindings of a process instance
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a token (one thread of control inside an instance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub Uuid);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TokenId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a node inside a process definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a sequence flow inside a process definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Versioned identifier of a deployed process definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DefinitionId {
    pub key: String,
    pub version: u32,
}

impl DefinitionId {
    pub fn new(key: impl Into<String>, version: u32) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.version)
    }
}

/// Status of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    /// Terminal instances never make further progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Terminated
        )
    }
}

/// Lifecycle state of a live token. Completed tokens leave the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Waiting,
    Ready,
    Running,
}

/// What a waiting token is blocked on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitKind {
    /// External signal (user task, receive task), optionally bounded by a deadline
    Signal { deadline: Option<DateTime<Utc>> },
    /// Intermediate timer event
    Timer { deadline: DateTime<Utc> },
    /// Parked at a parallel join until its siblings arrive
    Join,
}

impl WaitKind {
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            WaitKind::Signal { deadline } => *deadline,
            WaitKind::Timer { deadline } => Some(*deadline),
            WaitKind::Join => None,
        }
    }
}

/// A position marker inside an instance's execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub node_id: NodeId,
    pub state: TokenState,
    pub wait: Option<WaitKind>,
    /// Edge the token travelled to reach its current node
    pub arrived_via: Option<EdgeId>,
    /// Set once a waiting activity has been signalled; the next dispatch leaves the node
    pub resumed: bool,
}

/// Point-in-time view of an instance returned by queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub definition_id: DefinitionId,
    pub status: InstanceStatus,
    pub variables: Variables,
    pub tokens: Vec<Token>,
    pub last_seq: u64,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl InstanceSnapshot {
    /// Tokens currently waiting on an external signal
    pub fn waiting_tokens(&self) -> Vec<&Token> {
        self.tokens
            .iter()
            .filter(|t| matches!(t.wait, Some(WaitKind::Signal { .. })))
            .collect()
    }

    /// First token positioned at the given node
    pub fn token_at(&self, node: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.node_id.0 == node)
    }
}
