use super::condition::Condition;
use super::validate::{validate, Topology};
use crate::error::EngineResult;
use crate::types::{DefinitionId, EdgeId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployable description of a process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinitionSource {
    /// Stable key; redeploying the same key creates a new version
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A node of the process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            name: None,
            kind,
        }
    }
}

/// Behaviour of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    /// Ends the whole instance, voiding every other token
    TerminateEndEvent,
    /// Pass-through activity
    Task,
    /// Invokes a registered task handler
    ServiceTask {
        handler: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
    /// Waits for a human to complete it via a signal
    UserTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Waits for a named message delivered as a signal
    ReceiveTask {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Intermediate timer catch event
    TimerEvent { duration_ms: u64 },
    ExclusiveGateway,
    ParallelGateway,
}

impl NodeKind {
    /// Activities that park the token until something external happens
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeKind::Task
                | NodeKind::ServiceTask { .. }
                | NodeKind::UserTask { .. }
                | NodeKind::ReceiveTask { .. }
                | NodeKind::TimerEvent { .. }
        )
    }

    pub fn is_end(&self) -> bool {
        matches!(self, NodeKind::EndEvent | NodeKind::TerminateEndEvent)
    }
}

/// A sequence flow between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Taken by an exclusive gateway when no other edge matches
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: EdgeId::new(id),
            source: NodeId::new(source),
            target: NodeId::new(target),
            condition: None,
            default: false,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

/// Role a parallel gateway plays in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRole {
    Fork,
    Join,
    PassThrough,
}

/// An immutable, validated, deployed process graph
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub id: DefinitionId,
    pub name: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub deployed_at: DateTime<Utc>,
    topology: Topology,
}

impl ProcessDefinition {
    /// Validate a source and compile it into a definition with the given id
    pub fn compile(id: DefinitionId, source: ProcessDefinitionSource) -> EngineResult<Self> {
        let topology = validate(&source)?;
        Ok(Self {
            id,
            name: source.name,
            nodes: source.nodes,
            edges: source.edges,
            deployed_at: Utc::now(),
            topology,
        })
    }

    /// Reconstruct the deployable source (structurally equal to what was deployed)
    pub fn to_source(&self) -> ProcessDefinitionSource {
        ProcessDefinitionSource {
            key: self.id.key.clone(),
            name: self.name.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    pub fn start_node(&self) -> &Node {
        &self.nodes[self.topology.start]
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.topology.node_index.get(id).map(|&i| &self.nodes[i])
    }

    /// Outgoing edges of a node, in definition order
    pub fn outgoing(&self, id: &NodeId) -> Vec<&Edge> {
        self.topology
            .node_index
            .get(id)
            .map(|&i| self.topology.outgoing[i].iter().map(|&e| &self.edges[e]).collect())
            .unwrap_or_default()
    }

    pub fn incoming_count(&self, id: &NodeId) -> usize {
        self.topology
            .node_index
            .get(id)
            .map(|&i| self.topology.incoming[i].len())
            .unwrap_or(0)
    }

    /// Parsed condition of an edge, if it carries one
    pub fn condition(&self, edge: &EdgeId) -> Option<&Condition> {
        self.topology.conditions.get(edge)
    }

    pub fn gateway_role(&self, id: &NodeId) -> GatewayRole {
        let outgoing = self.outgoing(id).len();
        let incoming = self.incoming_count(id);
        if outgoing > 1 {
            GatewayRole::Fork
        } else if incoming > 1 {
            GatewayRole::Join
        } else {
            GatewayRole::PassThrough
        }
    }
}

/// Summary of a deployed definition returned by listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSummary {
    pub id: DefinitionId,
    pub name: Option<String>,
    pub nodes: usize,
    pub edges: usize,
    pub deployed_at: DateTime<Utc>,
}

impl From<&ProcessDefinition> for DefinitionSummary {
    fn from(def: &ProcessDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            nodes: def.nodes.len(),
            edges: def.edges.len(),
            deployed_at: def.deployed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_json_shape() {
        let source: ProcessDefinitionSource = serde_json::from_value(json!({
            "key": "approval",
            "nodes": [
                {"id": "start", "type": "start_event"},
                {"id": "review", "type": "user_task", "assignee": "ops", "timeout_ms": 5000},
                {"id": "notify", "type": "service_task", "handler": "log"},
                {"id": "end", "type": "end_event"}
            ],
            "edges": [
                {"id": "f1", "source": "start", "target": "review"},
                {"id": "f2", "source": "review", "target": "notify"},
                {"id": "f3", "source": "notify", "target": "end"}
            ]
        }))
        .unwrap();

        assert_eq!(source.nodes.len(), 4);
        assert_eq!(
            source.nodes[1].kind,
            NodeKind::UserTask {
                assignee: Some("ops".to_string()),
                timeout_ms: Some(5000)
            }
        );
        assert_eq!(
            source.nodes[2].kind,
            NodeKind::ServiceTask {
                handler: "log".to_string(),
                parameters: serde_json::Value::Null
            }
        );

        let round_trip: ProcessDefinitionSource =
            serde_json::from_str(&serde_json::to_string(&source).unwrap()).unwrap();
        assert_eq!(round_trip, source);
    }

    #[test]
    fn test_source_toml_shape() {
        let source: ProcessDefinitionSource = toml::from_str(
            r#"
            key = "timer"

            [[nodes]]
            id = "start"
            type = "start_event"

            [[nodes]]
            id = "wait"
            type = "timer_event"
            duration_ms = 250

            [[nodes]]
            id = "end"
            type = "end_event"

            [[edges]]
            id = "f1"
            source = "start"
            target = "wait"

            [[edges]]
            id = "f2"
            source = "wait"
            target = "end"
            "#,
        )
        .unwrap();

        assert_eq!(source.nodes[1].kind, NodeKind::TimerEvent { duration_ms: 250 });
        assert_eq!(source.edges[1].target, NodeId::new("end"));
    }
}
