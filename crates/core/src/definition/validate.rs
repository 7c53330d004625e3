use super::condition::Condition;
use super::model::{NodeKind, ProcessDefinitionSource};
use crate::error::{EngineError, EngineResult};
use crate::types::{EdgeId, NodeId};
use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Derived indexes of a validated graph
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub start: usize,
    pub node_index: HashMap<NodeId, usize>,
    /// Edge indices leaving each node, in definition order
    pub outgoing: Vec<Vec<usize>>,
    pub incoming: Vec<Vec<usize>>,
    pub conditions: HashMap<EdgeId, Condition>,
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

/// Check a definition source and build its topology.
///
/// Cycles are only allowed when they pass through an exclusive gateway that
/// can leave the loop. Parallel joins must be immediately dominated by a
/// parallel fork with the same number of branches.
pub(crate) fn validate(source: &ProcessDefinitionSource) -> EngineResult<Topology> {
    if source.key.trim().is_empty() {
        return Err(invalid("definition key must not be empty"));
    }
    if source.nodes.is_empty() {
        return Err(invalid("definition has no nodes"));
    }

    let mut node_index = HashMap::new();
    for (i, node) in source.nodes.iter().enumerate() {
        if node.id.0.trim().is_empty() {
            return Err(invalid("node id must not be empty"));
        }
        if node_index.insert(node.id.clone(), i).is_some() {
            return Err(invalid(format!("duplicate node id {}", node.id)));
        }
    }

    let mut graph: DiGraph<usize, usize> = DiGraph::new();
    let indices: Vec<NodeIndex> = (0..source.nodes.len()).map(|i| graph.add_node(i)).collect();
    let mut outgoing = vec![Vec::new(); source.nodes.len()];
    let mut incoming = vec![Vec::new(); source.nodes.len()];
    let mut edge_ids = HashSet::new();
    let mut conditions = HashMap::new();

    for (e, edge) in source.edges.iter().enumerate() {
        if edge.id.0.trim().is_empty() {
            return Err(invalid(format!("edge from {} has an empty id", edge.source)));
        }
        if !edge_ids.insert(edge.id.clone()) {
            return Err(invalid(format!("duplicate edge id {}", edge.id)));
        }
        let from = *node_index
            .get(&edge.source)
            .ok_or_else(|| invalid(format!("edge {} references unknown source {}", edge.id, edge.source)))?;
        let to = *node_index
            .get(&edge.target)
            .ok_or_else(|| invalid(format!("edge {} references unknown target {}", edge.id, edge.target)))?;

        if let Some(expr) = &edge.condition {
            let condition = Condition::parse(expr)
                .map_err(|e| invalid(format!("edge {} has an invalid condition: {}", edge.id, e)))?;
            conditions.insert(edge.id.clone(), condition);
        }

        graph.add_edge(indices[from], indices[to], e);
        outgoing[from].push(e);
        incoming[to].push(e);
    }

    let starts: Vec<usize> = source
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.kind == NodeKind::StartEvent)
        .map(|(i, _)| i)
        .collect();
    let start = match starts.as_slice() {
        [single] => *single,
        [] => return Err(invalid("definition has no start event")),
        _ => return Err(invalid("definition has more than one start event")),
    };
    let ends: Vec<usize> = source
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.kind.is_end())
        .map(|(i, _)| i)
        .collect();
    if ends.is_empty() {
        return Err(invalid("definition has no end event"));
    }

    // Per-node degree rules
    for (i, node) in source.nodes.iter().enumerate() {
        let out = outgoing[i].len();
        let inc = incoming[i].len();
        match &node.kind {
            NodeKind::StartEvent if inc > 0 => {
                return Err(invalid(format!("start event {} has incoming edges", node.id)))
            }
            kind if kind.is_end() && out > 0 => {
                return Err(invalid(format!("end event {} has outgoing edges", node.id)))
            }
            kind if !kind.is_end() && out == 0 => {
                return Err(invalid(format!("node {} has no outgoing edge", node.id)))
            }
            kind if (kind.is_activity() || *kind == NodeKind::StartEvent) && out > 1 => {
                return Err(invalid(format!(
                    "node {} has {} outgoing edges; use a gateway to branch",
                    node.id, out
                )))
            }
            NodeKind::ParallelGateway if out > 1 && inc > 1 => {
                return Err(invalid(format!(
                    "parallel gateway {} cannot both fork and join",
                    node.id
                )))
            }
            _ => {}
        }
    }

    // Conditions and default flags only make sense on exclusive decisions
    for (i, node) in source.nodes.iter().enumerate() {
        let is_decision = node.kind == NodeKind::ExclusiveGateway;
        let defaults = outgoing[i].iter().filter(|&&e| source.edges[e].default).count();
        for &e in &outgoing[i] {
            let edge = &source.edges[e];
            if !is_decision && (edge.condition.is_some() || edge.default) {
                return Err(invalid(format!(
                    "edge {} carries a condition or default flag but does not leave an exclusive gateway",
                    edge.id
                )));
            }
            if edge.default && edge.condition.is_some() {
                return Err(invalid(format!("default edge {} must not have a condition", edge.id)));
            }
        }
        if defaults > 1 {
            return Err(invalid(format!("exclusive gateway {} has more than one default edge", node.id)));
        }
    }

    // Reachability from the start event
    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, indices[start]);
    while let Some(nx) = dfs.next(&graph) {
        reachable.insert(graph[nx]);
    }
    if let Some(node) = source.nodes.iter().enumerate().find(|(i, _)| !reachable.contains(i)) {
        return Err(invalid(format!("node {} is unreachable from the start event", node.1.id)));
    }

    // Every node must be able to reach an end event
    let mut reaches_end: HashSet<usize> = ends.iter().copied().collect();
    let mut queue: VecDeque<NodeIndex> = ends.iter().map(|&i| indices[i]).collect();
    while let Some(nx) = queue.pop_front() {
        for pred in graph.neighbors_directed(nx, Direction::Incoming) {
            if reaches_end.insert(graph[pred]) {
                queue.push_back(pred);
            }
        }
    }
    if let Some((_, node)) = source.nodes.iter().enumerate().find(|(i, _)| !reaches_end.contains(i)) {
        return Err(invalid(format!("node {} cannot reach an end event", node.id)));
    }

    // Cycles must pass through an exclusive decision
    let mut acyclic_view: DiGraph<usize, ()> = DiGraph::new();
    let view_indices: Vec<NodeIndex> = (0..source.nodes.len()).map(|i| acyclic_view.add_node(i)).collect();
    for edge in &source.edges {
        let from = node_index[&edge.source];
        let to = node_index[&edge.target];
        let from_decision =
            source.nodes[from].kind == NodeKind::ExclusiveGateway && outgoing[from].len() > 1;
        if !from_decision {
            acyclic_view.add_edge(view_indices[from], view_indices[to], ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&acyclic_view) {
        return Err(invalid(
            "definition contains a cycle that does not pass through an exclusive gateway",
        ));
    }

    // Fork/join pairing
    let dominators = simple_fast(&graph, indices[start]);
    let mut matched_forks = HashSet::new();
    for (i, node) in source.nodes.iter().enumerate() {
        if node.kind != NodeKind::ParallelGateway || incoming[i].len() < 2 {
            continue;
        }
        let fork = dominators
            .immediate_dominator(indices[i])
            .map(|nx| graph[nx])
            .filter(|&f| source.nodes[f].kind == NodeKind::ParallelGateway && outgoing[f].len() > 1)
            .ok_or_else(|| invalid(format!("parallel join {} has no matching fork", node.id)))?;
        if outgoing[fork].len() != incoming[i].len() {
            return Err(invalid(format!(
                "parallel join {} expects {} branches but fork {} creates {}",
                node.id,
                incoming[i].len(),
                source.nodes[fork].id,
                outgoing[fork].len()
            )));
        }
        if !matched_forks.insert(fork) {
            return Err(invalid(format!(
                "fork {} is matched by more than one join",
                source.nodes[fork].id
            )));
        }
    }
    for (i, node) in source.nodes.iter().enumerate() {
        if node.kind == NodeKind::ParallelGateway && outgoing[i].len() > 1 && !matched_forks.contains(&i) {
            return Err(invalid(format!("parallel fork {} has no matching join", node.id)));
        }
    }

    Ok(Topology {
        start,
        node_index,
        outgoing,
        incoming,
        conditions,
    })
}
