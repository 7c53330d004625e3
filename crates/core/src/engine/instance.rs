use crate::events::{EventType, ExecutionEvent};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// In-memory state of a process instance.
///
/// Only ever changed through [`InstanceState::apply`], which is also what
/// replays the log during recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: InstanceId,
    pub definition_id: DefinitionId,
    pub status: InstanceStatus,
    pub variables: Variables,
    /// Active tokens
    pub tokens: BTreeMap<TokenId, Token>,
    /// Tokens parked at each parallel join, keyed by the edge they arrived on
    pub joins: BTreeMap<NodeId, BTreeMap<EdgeId, TokenId>>,
    /// Ids of tokens that completed, were merged or were voided
    pub consumed: BTreeSet<TokenId>,
    pub last_seq: u64,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Failed in memory only; the log still resumes this instance on restart
    #[serde(skip)]
    pub unlogged_failure: bool,
}

impl InstanceState {
    /// Create the state described by an `InstanceStarted` event
    pub fn init(event: &ExecutionEvent) -> Option<Self> {
        let EventType::InstanceStarted {
            definition_id,
            variables,
        } = &event.event_type
        else {
            return None;
        };

        Some(Self {
            id: event.instance_id,
            definition_id: definition_id.clone(),
            status: InstanceStatus::Running,
            variables: variables.clone(),
            tokens: BTreeMap::new(),
            joins: BTreeMap::new(),
            consumed: BTreeSet::new(),
            last_seq: event.seq,
            failure: None,
            started_at: event.timestamp,
            ended_at: None,
            unlogged_failure: false,
        })
    }

    /// Rebuild a state from its ordered log, optionally on top of a snapshot
    pub fn replay<'a>(
        base: Option<Self>,
        events: impl IntoIterator<Item = &'a ExecutionEvent>,
    ) -> Option<Self> {
        let mut state = base;
        for event in events {
            match state.as_mut() {
                Some(state) => {
                    state.apply(event);
                }
                None => state = Self::init(event),
            }
        }
        state
    }

    /// Fold one event into the state. Events at or below `last_seq` are
    /// ignored, so replaying an overlapping log is harmless. Returns whether
    /// the event was applied.
    pub fn apply(&mut self, event: &ExecutionEvent) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }
        self.last_seq = event.seq;

        match &event.event_type {
            EventType::InstanceStarted { .. } => {}
            EventType::InstanceSuspended => self.status = InstanceStatus::Suspended,
            EventType::InstanceResumed => self.status = InstanceStatus::Running,
            EventType::InstanceCompleted => {
                self.void_all();
                self.status = InstanceStatus::Completed;
                self.ended_at = Some(event.timestamp);
            }
            EventType::InstanceFailed { error } => {
                self.status = InstanceStatus::Failed;
                self.failure = Some(error.clone());
                self.ended_at = Some(event.timestamp);
            }
            EventType::InstanceTerminated { reason } => {
                self.void_all();
                self.status = InstanceStatus::Terminated;
                self.failure = Some(reason.clone());
                self.ended_at = Some(event.timestamp);
            }
            EventType::TokenCreated { token_id, node_id } => {
                self.tokens.insert(
                    *token_id,
                    Token {
                        id: *token_id,
                        node_id: node_id.clone(),
                        state: TokenState::Ready,
                        wait: None,
                        arrived_via: None,
                        resumed: false,
                    },
                );
            }
            EventType::TokenDispatched { token_id } => {
                if let Some(token) = self.tokens.get_mut(token_id) {
                    token.state = TokenState::Running;
                }
            }
            EventType::TokenRequeued { token_id } => {
                if let Some(token) = self.tokens.get_mut(token_id) {
                    token.state = TokenState::Ready;
                }
            }
            EventType::TokenMoved {
                token_id,
                edge_id,
                node_id,
            } => {
                if let Some(token) = self.tokens.get_mut(token_id) {
                    token.node_id = node_id.clone();
                    token.arrived_via = Some(edge_id.clone());
                    token.state = TokenState::Ready;
                    token.wait = None;
                    token.resumed = false;
                }
            }
            EventType::TokenWaiting { token_id, wait } => {
                if let Some(token) = self.tokens.get_mut(token_id) {
                    token.state = TokenState::Waiting;
                    token.wait = Some(wait.clone());
                    if *wait == WaitKind::Join {
                        if let Some(edge) = &token.arrived_via {
                            self.joins
                                .entry(token.node_id.clone())
                                .or_default()
                                .insert(edge.clone(), *token_id);
                        }
                    }
                }
            }
            EventType::TokenSignalled {
                token_id,
                timed_out,
                payload,
            } => {
                self.merge_variables(payload);
                if let Some(token) = self.tokens.get_mut(token_id) {
                    if *timed_out {
                        self.variables.insert(
                            format!("{}_timed_out", token.node_id),
                            serde_json::Value::Bool(true),
                        );
                    }
                    token.state = TokenState::Ready;
                    token.wait = None;
                    token.resumed = true;
                }
            }
            EventType::TokenForked { token_id, branches } => {
                self.consume(*token_id);
                for branch in branches {
                    self.tokens.insert(
                        branch.token_id,
                        Token {
                            id: branch.token_id,
                            node_id: branch.node_id.clone(),
                            state: TokenState::Ready,
                            wait: None,
                            arrived_via: Some(branch.edge_id.clone()),
                            resumed: false,
                        },
                    );
                }
            }
            EventType::JoinReleased {
                join_id,
                consumed,
                token_id,
                edge_id,
                node_id,
            } => {
                self.joins.remove(join_id);
                for id in consumed {
                    self.consume(*id);
                }
                self.tokens.insert(
                    *token_id,
                    Token {
                        id: *token_id,
                        node_id: node_id.clone(),
                        state: TokenState::Ready,
                        wait: None,
                        arrived_via: Some(edge_id.clone()),
                        resumed: false,
                    },
                );
            }
            EventType::TokenConsumed { token_id } => self.consume(*token_id),
            EventType::TokensVoided { tokens } => {
                for id in tokens {
                    self.consume(*id);
                }
            }
            EventType::VariablesSet { values } => self.merge_variables(values),
        }

        true
    }

    fn consume(&mut self, token_id: TokenId) {
        if self.tokens.remove(&token_id).is_some() {
            self.consumed.insert(token_id);
        }
        for arrivals in self.joins.values_mut() {
            arrivals.retain(|_, id| *id != token_id);
        }
        self.joins.retain(|_, arrivals| !arrivals.is_empty());
    }

    fn void_all(&mut self) {
        let ids: Vec<TokenId> = self.tokens.keys().copied().collect();
        for id in ids {
            self.consume(id);
        }
        self.joins.clear();
    }

    fn merge_variables(&mut self, values: &Variables) {
        for (key, value) in values {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    /// Record a failure that could not be written to the log. The sequence
    /// number is left alone so a later replay is unaffected.
    pub(crate) fn fail_unlogged(&mut self, reason: String) {
        self.status = InstanceStatus::Failed;
        self.failure = Some(reason);
        self.ended_at = Some(Utc::now());
        self.unlogged_failure = true;
    }

    /// Terminal according to the log, not just in memory
    pub fn is_durably_terminal(&self) -> bool {
        self.status.is_terminal() && !self.unlogged_failure
    }

    /// No token can make progress on its own, yet some are parked at a join
    pub fn is_deadlocked(&self) -> bool {
        let mut parked = false;
        for token in self.tokens.values() {
            if token.state == TokenState::Waiting && token.wait == Some(WaitKind::Join) {
                parked = true;
            } else {
                return false;
            }
        }
        parked
    }

    /// Tokens at the given join, keyed by arrival edge
    pub fn join_arrivals(&self, join: &NodeId) -> Option<&BTreeMap<EdgeId, TokenId>> {
        self.joins.get(join)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            definition_id: self.definition_id.clone(),
            status: self.status,
            variables: self.variables.clone(),
            tokens: self.tokens.values().cloned().collect(),
            last_seq: self.last_seq,
            failure: self.failure.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ForkBranch;
    use serde_json::json;

    struct Log {
        id: InstanceId,
        events: Vec<ExecutionEvent>,
    }

    impl Log {
        fn new() -> Self {
            let id = InstanceId::new();
            let mut log = Self {
                id,
                events: Vec::new(),
            };
            log.push(EventType::InstanceStarted {
                definition_id: DefinitionId::new("order", 1),
                variables: json!({"amount": 10}).as_object().cloned().unwrap(),
            });
            log
        }

        fn push(&mut self, event_type: EventType) {
            let mut event = ExecutionEvent::new(self.id, event_type);
            event.seq = self.events.len() as u64 + 1;
            self.events.push(event);
        }
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn edge(id: &str) -> EdgeId {
        EdgeId::new(id)
    }

    fn fork_join_log() -> (Log, TokenId, TokenId, TokenId) {
        let mut log = Log::new();
        let root = TokenId::new();
        let (a, b) = (TokenId::new(), TokenId::new());
        log.push(EventType::TokenCreated {
            token_id: root,
            node_id: node("fork"),
        });
        log.push(EventType::TokenDispatched { token_id: root });
        log.push(EventType::TokenForked {
            token_id: root,
            branches: vec![
                ForkBranch {
                    token_id: a,
                    edge_id: edge("fa"),
                    node_id: node("join"),
                },
                ForkBranch {
                    token_id: b,
                    edge_id: edge("fb"),
                    node_id: node("join"),
                },
            ],
        });
        log.push(EventType::TokenDispatched { token_id: a });
        log.push(EventType::TokenWaiting {
            token_id: a,
            wait: WaitKind::Join,
        });
        (log, root, a, b)
    }

    #[test]
    fn test_fork_and_join_release() {
        let (mut log, root, a, b) = fork_join_log();
        let merged = TokenId::new();
        log.push(EventType::TokenDispatched { token_id: b });
        log.push(EventType::JoinReleased {
            join_id: node("join"),
            consumed: vec![a, b],
            token_id: merged,
            edge_id: edge("out"),
            node_id: node("end"),
        });

        let state = InstanceState::replay(None, &log.events).unwrap();
        assert_eq!(state.tokens.len(), 1);
        assert_eq!(state.tokens[&merged].node_id, node("end"));
        assert_eq!(state.tokens[&merged].arrived_via, Some(edge("out")));
        assert!(state.consumed.contains(&root));
        assert!(state.consumed.contains(&a));
        assert!(state.consumed.contains(&b));
        assert!(state.joins.is_empty());
    }

    #[test]
    fn test_join_arrivals_and_deadlock() {
        let (mut log, _, a, b) = fork_join_log();
        let state = InstanceState::replay(None, &log.events).unwrap();
        assert_eq!(state.join_arrivals(&node("join")).unwrap()[&edge("fa")], a);
        // b is still ready, so progress is possible
        assert!(!state.is_deadlocked());

        log.push(EventType::TokenDispatched { token_id: b });
        log.push(EventType::TokenConsumed { token_id: b });
        let state = InstanceState::replay(None, &log.events).unwrap();
        assert!(state.is_deadlocked());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (mut log, _, _, b) = fork_join_log();
        log.push(EventType::VariablesSet {
            values: json!({"approved": true}).as_object().cloned().unwrap(),
        });
        log.push(EventType::TokenDispatched { token_id: b });

        let once = InstanceState::replay(None, &log.events).unwrap();

        let mut twice = once.clone();
        for event in &log.events {
            assert!(!twice.apply(event));
        }
        assert_eq!(twice, once);

        // Checkpoint halfway, then replay the whole log over it
        let half = InstanceState::replay(None, &log.events[..4]).unwrap();
        let resumed = InstanceState::replay(Some(half), &log.events).unwrap();
        assert_eq!(resumed, once);
    }

    #[test]
    fn test_signal_merges_payload_and_marks_timeout() {
        let mut log = Log::new();
        let token = TokenId::new();
        log.push(EventType::TokenCreated {
            token_id: token,
            node_id: node("review"),
        });
        log.push(EventType::TokenWaiting {
            token_id: token,
            wait: WaitKind::Signal { deadline: None },
        });
        log.push(EventType::TokenSignalled {
            token_id: token,
            timed_out: true,
            payload: json!({"note": "late"}).as_object().cloned().unwrap(),
        });

        let state = InstanceState::replay(None, &log.events).unwrap();
        let token = &state.tokens[&token];
        assert_eq!(token.state, TokenState::Ready);
        assert!(token.resumed);
        assert!(token.wait.is_none());
        assert_eq!(state.variables["review_timed_out"], json!(true));
        assert_eq!(state.variables["note"], json!("late"));
        assert_eq!(state.variables["amount"], json!(10));
    }

    #[test]
    fn test_terminate_voids_tokens() {
        let (mut log, _, a, b) = fork_join_log();
        log.push(EventType::InstanceTerminated {
            reason: "operator".to_string(),
        });

        let state = InstanceState::replay(None, &log.events).unwrap();
        assert_eq!(state.status, InstanceStatus::Terminated);
        assert!(state.tokens.is_empty());
        assert!(state.joins.is_empty());
        assert!(state.consumed.contains(&a) && state.consumed.contains(&b));
        assert!(state.ended_at.is_some());
    }

    #[test]
    fn test_state_survives_serialization() {
        let (log, _, _, _) = fork_join_log();
        let state = InstanceState::replay(None, &log.events).unwrap();
        let json = serde_json::to_vec(&state).unwrap();
        let restored: InstanceState = serde_json::from_slice(&json).unwrap();
        assert_eq!(restored, state);
    }
}
