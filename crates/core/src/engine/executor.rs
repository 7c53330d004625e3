use super::handlers::{TaskContext, TaskRegistry};
use super::instance::InstanceState;
use crate::config::EngineConfig;
use crate::definition::{DefinitionStore, Edge, GatewayRole, Node, NodeKind, ProcessDefinition};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventStore, EventType, ExecutionEvent, ForkBranch};
use crate::scheduler::{TimerEntry, TimerIndex, TimerKind, WorkQueue};
use crate::storage::CheckpointStore;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// An instance plus the bookkeeping that lives next to it
pub(crate) struct InstanceSlot {
    pub state: InstanceState,
    /// Sequence number of the newest checkpoint
    pub last_checkpoint: u64,
}

/// How a waiting token is being released
#[derive(Debug, Clone)]
enum Wakeup {
    External(Variables),
    Timer,
    Timeout,
}

/// Token state machine over deployed definitions.
///
/// Every transition is appended to the event store before it is applied to
/// the in-memory instance, and all work on one instance happens under that
/// instance's lock.
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) definitions: Arc<DefinitionStore>,
    pub(super) events: Arc<dyn EventStore>,
    pub(super) checkpoints: CheckpointStore,
    pub(super) handlers: Arc<TaskRegistry>,
    pub(super) instances: RwLock<HashMap<InstanceId, Arc<Mutex<InstanceSlot>>>>,
    pub(super) queue: Arc<WorkQueue>,
    pub(super) timers: Arc<TimerIndex>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        definitions: Arc<DefinitionStore>,
        events: Arc<dyn EventStore>,
        checkpoints: CheckpointStore,
        handlers: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            definitions,
            events,
            checkpoints,
            handlers,
            instances: RwLock::new(HashMap::new()),
            queue: Arc::new(WorkQueue::new()),
            timers: Arc::new(TimerIndex::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.definitions
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn timers(&self) -> &Arc<TimerIndex> {
        &self.timers
    }

    /// Create an instance of a deployed definition and queue its start token
    pub async fn start_instance(
        &self,
        definition_id: &DefinitionId,
        variables: Variables,
    ) -> EngineResult<InstanceId> {
        let definition = self.definitions.get(definition_id)?;
        let instance_id = InstanceId::new();

        let mut started = ExecutionEvent::new(
            instance_id,
            EventType::InstanceStarted {
                definition_id: definition.id.clone(),
                variables,
            },
        );
        started.seq = self
            .append(&started)
            .await
            .map_err(EngineError::storage)?;
        let state = InstanceState::init(&started)
            .ok_or_else(|| EngineError::InvalidState("instance start event rejected".to_string()))?;

        let slot = Arc::new(Mutex::new(InstanceSlot {
            state,
            last_checkpoint: 0,
        }));
        self.instances.write().await.insert(instance_id, slot.clone());

        let mut slot = slot.lock().await;
        let token_id = TokenId::new();
        self.commit(
            &mut slot,
            EventType::TokenCreated {
                token_id,
                node_id: definition.start_node().id.clone(),
            },
        )
        .await?;
        self.queue.push(instance_id, token_id);

        tracing::info!("Started instance {} of {}", instance_id, definition.id);
        Ok(instance_id)
    }

    /// Start the newest version of a definition key
    pub async fn start_latest(&self, key: &str, variables: Variables) -> EngineResult<InstanceId> {
        let definition = self.definitions.latest(key)?;
        self.start_instance(&definition.id, variables).await
    }

    /// Resume a token waiting on an external signal, merging `payload` into
    /// the instance variables
    pub async fn signal(
        &self,
        instance_id: InstanceId,
        token_id: TokenId,
        payload: Variables,
    ) -> EngineResult<()> {
        self.wake(instance_id, token_id, Wakeup::External(payload)).await
    }

    /// Resume the token waiting at a receive task for `message`. Returns the
    /// token that was resumed.
    pub async fn signal_message(
        &self,
        instance_id: InstanceId,
        message: &str,
        payload: Variables,
    ) -> EngineResult<TokenId> {
        let token_id = {
            let slot = self.require_slot(instance_id).await?;
            let slot = slot.lock().await;
            let definition = self.definitions.get(&slot.state.definition_id)?;
            slot.state
                .tokens
                .values()
                .filter(|token| matches!(token.wait, Some(WaitKind::Signal { .. })))
                .find(|token| {
                    matches!(
                        definition.node(&token.node_id).map(|node| &node.kind),
                        Some(NodeKind::ReceiveTask { message: expected, .. }) if expected == message
                    )
                })
                .map(|token| token.id)
                .ok_or_else(|| {
                    EngineError::StaleSignal(format!(
                        "no token of instance {instance_id} is waiting for message '{message}'"
                    ))
                })?
        };

        self.wake(instance_id, token_id, Wakeup::External(payload)).await?;
        Ok(token_id)
    }

    /// Deliver a due timer entry
    pub async fn fire_timer(&self, entry: &TimerEntry) -> EngineResult<()> {
        let wakeup = match entry.kind {
            TimerKind::Timer => Wakeup::Timer,
            TimerKind::Timeout => Wakeup::Timeout,
        };
        self.wake(entry.instance_id, entry.token_id, wakeup).await
    }

    /// Deliver every timer due at `now`; returns how many were accepted
    pub async fn fire_due_timers(&self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for entry in self.timers.take_due(now) {
            match self.fire_timer(&entry).await {
                Ok(()) => fired += 1,
                Err(err) if err.is_stale() => {
                    tracing::debug!("Dropped timer for token {}: {}", entry.token_id, err)
                }
                Err(err) => tracing::warn!(
                    "Timer for token {} of instance {} not delivered: {}",
                    entry.token_id,
                    entry.instance_id,
                    err
                ),
            }
        }
        fired
    }

    async fn wake(&self, instance_id: InstanceId, token_id: TokenId, wakeup: Wakeup) -> EngineResult<()> {
        let slot = self.require_slot(instance_id).await?;
        let mut slot = slot.lock().await;

        let Some(token) = slot.state.tokens.get(&token_id) else {
            let reason = if slot.state.consumed.contains(&token_id) {
                format!("token {token_id} of instance {instance_id} was already consumed")
            } else {
                format!("token {token_id} is unknown to instance {instance_id}")
            };
            tracing::debug!("Ignoring stale signal: {}", reason);
            return Err(EngineError::StaleSignal(reason));
        };

        if slot.state.status != InstanceStatus::Running {
            return Err(EngineError::InvalidState(format!(
                "instance {} is {:?}, not running",
                instance_id, slot.state.status
            )));
        }

        match (&token.wait, &wakeup) {
            (Some(WaitKind::Signal { .. }), Wakeup::External(_))
            | (Some(WaitKind::Signal { deadline: Some(_) }), Wakeup::Timeout)
            | (Some(WaitKind::Timer { .. }), Wakeup::Timer) => {}
            (_, Wakeup::External(_)) => {
                return Err(EngineError::InvalidState(format!(
                    "token {} at {} is not waiting for a signal",
                    token_id, token.node_id
                )))
            }
            _ => {
                return Err(EngineError::StaleSignal(format!(
                    "timer for token {token_id} no longer applies"
                )))
            }
        }

        let (timed_out, payload) = match wakeup {
            Wakeup::External(payload) => (false, payload),
            Wakeup::Timeout => (true, Variables::new()),
            Wakeup::Timer => (false, Variables::new()),
        };
        self.commit(
            &mut slot,
            EventType::TokenSignalled {
                token_id,
                timed_out,
                payload,
            },
        )
        .await?;
        self.timers.cancel_token(instance_id, token_id);
        self.queue.push(instance_id, token_id);

        tracing::debug!("Token {} of instance {} resumed", token_id, instance_id);
        Ok(())
    }

    pub async fn get_state(&self, instance_id: InstanceId) -> EngineResult<InstanceSnapshot> {
        let slot = self.require_slot(instance_id).await?;
        let snapshot = slot.lock().await.state.snapshot();
        Ok(snapshot)
    }

    /// Snapshots of every known instance, oldest first
    pub async fn list_instances(&self) -> Vec<InstanceSnapshot> {
        let slots: Vec<Arc<Mutex<InstanceSlot>>> =
            self.instances.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            snapshots.push(slot.lock().await.state.snapshot());
        }
        snapshots.sort_by_key(|s| s.started_at);
        snapshots
    }

    /// Full committed event history of an instance
    pub async fn events(&self, instance_id: InstanceId) -> EngineResult<Vec<ExecutionEvent>> {
        self.require_slot(instance_id).await?;
        self.events
            .read_from(instance_id, 1)
            .await
            .map_err(EngineError::storage)
    }

    /// Stop an instance for good, voiding all of its tokens
    pub async fn terminate(&self, instance_id: InstanceId, reason: impl Into<String>) -> EngineResult<()> {
        let slot = self.require_slot(instance_id).await?;
        let mut slot = slot.lock().await;
        if slot.state.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "instance {} is already {:?}",
                instance_id, slot.state.status
            )));
        }

        let reason = reason.into();
        self.commit(&mut slot, EventType::InstanceTerminated { reason: reason.clone() })
            .await?;
        self.release(instance_id);

        tracing::info!("Terminated instance {}: {}", instance_id, reason);
        Ok(())
    }

    /// Park a running instance. Its tokens stay where they are; timers are
    /// disarmed until `resume`.
    pub async fn suspend(&self, instance_id: InstanceId) -> EngineResult<()> {
        let slot = self.require_slot(instance_id).await?;
        let mut slot = slot.lock().await;
        if slot.state.status != InstanceStatus::Running {
            return Err(EngineError::InvalidState(format!(
                "only running instances can be suspended, {} is {:?}",
                instance_id, slot.state.status
            )));
        }

        self.commit(&mut slot, EventType::InstanceSuspended).await?;
        self.release(instance_id);
        tracing::info!("Suspended instance {}", instance_id);
        Ok(())
    }

    pub async fn resume(&self, instance_id: InstanceId) -> EngineResult<()> {
        let slot = self.require_slot(instance_id).await?;
        let mut slot = slot.lock().await;
        if slot.state.status != InstanceStatus::Suspended {
            return Err(EngineError::InvalidState(format!(
                "only suspended instances can be resumed, {} is {:?}",
                instance_id, slot.state.status
            )));
        }

        self.commit(&mut slot, EventType::InstanceResumed).await?;
        for token in slot.state.tokens.values() {
            if token.state == TokenState::Ready {
                self.queue.push(instance_id, token.id);
            }
        }
        self.arm_timers(&slot.state);
        tracing::info!("Resumed instance {}", instance_id);
        Ok(())
    }

    /// Definitions referenced by instances that can still make progress,
    /// including ones that will resume from the log after a restart
    pub async fn referenced_definitions(&self) -> HashSet<DefinitionId> {
        let slots: Vec<Arc<Mutex<InstanceSlot>>> =
            self.instances.read().await.values().cloned().collect();

        let mut referenced = HashSet::new();
        for slot in slots {
            let slot = slot.lock().await;
            if !slot.state.is_durably_terminal() {
                referenced.insert(slot.state.definition_id.clone());
            }
        }
        referenced
    }

    /// Drop superseded definition versions no live instance uses
    pub async fn prune_definitions(&self) -> EngineResult<Vec<DefinitionId>> {
        let referenced = self.referenced_definitions().await;
        self.definitions.prune(&referenced)
    }

    /// Drain the work queue on the calling task; returns the number of
    /// dispatches performed
    pub async fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while let Some((instance_id, token_id)) = self.queue.pop() {
            executed += 1;
            if let Err(err) = self.execute_token(instance_id, token_id).await {
                tracing::debug!("Token {} of instance {} failed: {}", token_id, instance_id, err);
            }
        }
        executed
    }

    /// Run one READY token until it moves, waits or is consumed
    pub async fn execute_token(&self, instance_id: InstanceId, token_id: TokenId) -> EngineResult<()> {
        let Some(slot) = self.slot(instance_id).await else {
            tracing::debug!("Dropping work for unknown instance {}", instance_id);
            return Ok(());
        };
        let mut slot = slot.lock().await;

        if slot.state.status != InstanceStatus::Running {
            tracing::debug!(
                "Skipping token {} of instance {} ({:?})",
                token_id,
                instance_id,
                slot.state.status
            );
            return Ok(());
        }
        let token = match slot.state.tokens.get(&token_id) {
            Some(token) if token.state == TokenState::Ready => token.clone(),
            _ => {
                tracing::debug!("Token {} of instance {} is no longer ready", token_id, instance_id);
                return Ok(());
            }
        };

        let definition = self.definitions.get(&slot.state.definition_id)?;
        let result = match self.step(&mut slot, &definition, token).await {
            Ok(()) if slot.state.status == InstanceStatus::Running && slot.state.is_deadlocked() => {
                let parked: Vec<String> = slot.state.joins.keys().map(|j| j.to_string()).collect();
                Err(EngineError::Synchronization(format!(
                    "instance cannot make progress: tokens wait at join(s) {} whose remaining branches ended",
                    parked.join(", ")
                )))
            }
            other => other,
        };

        if let Err(err) = &result {
            if err.fails_instance() {
                self.fail(&mut slot, err).await;
            }
        }
        result
    }

    async fn step(
        &self,
        slot: &mut InstanceSlot,
        definition: &ProcessDefinition,
        token: Token,
    ) -> EngineResult<()> {
        let instance_id = slot.state.id;
        self.commit(slot, EventType::TokenDispatched { token_id: token.id })
            .await?;

        let node = definition.node(&token.node_id).ok_or_else(|| {
            EngineError::NotFound(format!("node {} in definition {}", token.node_id, definition.id))
        })?;
        tracing::debug!("Executing token {} at {} in instance {}", token.id, node.id, instance_id);

        match &node.kind {
            NodeKind::StartEvent | NodeKind::Task => self.advance(slot, definition, &token).await,
            NodeKind::EndEvent => {
                self.commit(slot, EventType::TokenConsumed { token_id: token.id })
                    .await?;
                if slot.state.tokens.is_empty() {
                    self.complete(slot).await?;
                }
                Ok(())
            }
            NodeKind::TerminateEndEvent => {
                self.commit(slot, EventType::TokenConsumed { token_id: token.id })
                    .await?;
                let rest: Vec<TokenId> = slot.state.tokens.keys().copied().collect();
                if !rest.is_empty() {
                    self.commit(slot, EventType::TokensVoided { tokens: rest }).await?;
                }
                self.complete(slot).await
            }
            NodeKind::ServiceTask {
                handler,
                parameters,
            } => {
                let task = self.handlers.get(handler).ok_or_else(|| {
                    EngineError::TaskFailed(format!(
                        "no handler registered for '{}' (node {})",
                        handler, node.id
                    ))
                })?;
                let ctx = TaskContext {
                    instance_id,
                    token_id: token.id,
                    node_id: node.id.clone(),
                    parameters: parameters.clone(),
                    variables: slot.state.variables.clone(),
                };
                let output = task.execute(ctx).await.map_err(|e| {
                    EngineError::TaskFailed(format!("handler '{}' failed at {}: {:#}", handler, node.id, e))
                })?;
                if !output.is_empty() {
                    self.commit(slot, EventType::VariablesSet { values: output }).await?;
                }
                self.advance(slot, definition, &token).await
            }
            NodeKind::UserTask { timeout_ms, .. } | NodeKind::ReceiveTask { timeout_ms, .. } => {
                if token.resumed {
                    return self.advance(slot, definition, &token).await;
                }
                let deadline = timeout_ms.map(deadline_after);
                self.commit(
                    slot,
                    EventType::TokenWaiting {
                        token_id: token.id,
                        wait: WaitKind::Signal { deadline },
                    },
                )
                .await?;
                if let Some(deadline) = deadline {
                    self.timers
                        .schedule(deadline, instance_id, token.id, TimerKind::Timeout);
                }
                Ok(())
            }
            NodeKind::TimerEvent { duration_ms } => {
                if token.resumed {
                    return self.advance(slot, definition, &token).await;
                }
                let deadline = deadline_after(*duration_ms);
                self.commit(
                    slot,
                    EventType::TokenWaiting {
                        token_id: token.id,
                        wait: WaitKind::Timer { deadline },
                    },
                )
                .await?;
                self.timers
                    .schedule(deadline, instance_id, token.id, TimerKind::Timer);
                Ok(())
            }
            NodeKind::ExclusiveGateway => {
                let edge = choose_path(definition, node, &slot.state.variables)?;
                self.move_token(slot, &token, edge).await
            }
            NodeKind::ParallelGateway => match definition.gateway_role(&node.id) {
                GatewayRole::Fork => self.fork(slot, definition, &token).await,
                GatewayRole::Join => self.arrive_at_join(slot, definition, &token).await,
                GatewayRole::PassThrough => self.advance(slot, definition, &token).await,
            },
        }
    }

    /// Follow the single outgoing edge of the token's node
    async fn advance(
        &self,
        slot: &mut InstanceSlot,
        definition: &ProcessDefinition,
        token: &Token,
    ) -> EngineResult<()> {
        let edge = single_outgoing(definition, &token.node_id)?;
        self.move_token(slot, token, edge).await
    }

    async fn move_token(&self, slot: &mut InstanceSlot, token: &Token, edge: &Edge) -> EngineResult<()> {
        self.commit(
            slot,
            EventType::TokenMoved {
                token_id: token.id,
                edge_id: edge.id.clone(),
                node_id: edge.target.clone(),
            },
        )
        .await?;
        self.queue.push(slot.state.id, token.id);
        Ok(())
    }

    async fn fork(
        &self,
        slot: &mut InstanceSlot,
        definition: &ProcessDefinition,
        token: &Token,
    ) -> EngineResult<()> {
        let branches: Vec<ForkBranch> = definition
            .outgoing(&token.node_id)
            .into_iter()
            .map(|edge| ForkBranch {
                token_id: TokenId::new(),
                edge_id: edge.id.clone(),
                node_id: edge.target.clone(),
            })
            .collect();
        let spawned: Vec<TokenId> = branches.iter().map(|b| b.token_id).collect();

        self.commit(
            slot,
            EventType::TokenForked {
                token_id: token.id,
                branches,
            },
        )
        .await?;
        for token_id in spawned {
            self.queue.push(slot.state.id, token_id);
        }
        Ok(())
    }

    /// Park the token at a join, or release the join once every incoming
    /// edge has delivered exactly one token
    async fn arrive_at_join(
        &self,
        slot: &mut InstanceSlot,
        definition: &ProcessDefinition,
        token: &Token,
    ) -> EngineResult<()> {
        let join_id = token.node_id.clone();
        let edge = token.arrived_via.clone().ok_or_else(|| {
            EngineError::Synchronization(format!(
                "token {} reached join {} without an incoming edge",
                token.id, join_id
            ))
        })?;
        let arrivals = slot
            .state
            .join_arrivals(&join_id)
            .cloned()
            .unwrap_or_default();

        if let Some(existing) = arrivals.get(&edge) {
            return Err(EngineError::Synchronization(format!(
                "join {} already holds token {} from edge {}, token {} arrived on the same edge",
                join_id, existing, edge, token.id
            )));
        }

        let expected = definition.incoming_count(&join_id);
        if arrivals.len() + 1 < expected {
            return self
                .commit(
                    slot,
                    EventType::TokenWaiting {
                        token_id: token.id,
                        wait: WaitKind::Join,
                    },
                )
                .await;
        }

        let out = single_outgoing(definition, &join_id)?;
        let mut consumed: Vec<TokenId> = arrivals.values().copied().collect();
        consumed.push(token.id);
        let merged = TokenId::new();
        self.commit(
            slot,
            EventType::JoinReleased {
                join_id: join_id.clone(),
                consumed,
                token_id: merged,
                edge_id: out.id.clone(),
                node_id: out.target.clone(),
            },
        )
        .await?;
        self.queue.push(slot.state.id, merged);

        tracing::debug!("Join {} released in instance {}", join_id, slot.state.id);
        Ok(())
    }

    pub(super) async fn complete(&self, slot: &mut InstanceSlot) -> EngineResult<()> {
        self.commit(slot, EventType::InstanceCompleted).await?;
        self.release(slot.state.id);
        tracing::info!("Instance {} completed", slot.state.id);
        Ok(())
    }

    async fn fail(&self, slot: &mut InstanceSlot, error: &EngineError) {
        let instance_id = slot.state.id;
        self.release(instance_id);
        // Storage failures have already failed the instance in memory
        if slot.state.status.is_terminal() {
            return;
        }

        tracing::error!("Instance {} failed: {}", instance_id, error);
        if let Err(err) = self
            .commit(slot, EventType::InstanceFailed { error: error.to_string() })
            .await
        {
            tracing::error!("Could not record failure of instance {}: {}", instance_id, err);
        }
    }

    /// Append a transition, then apply it. On append failure the instance is
    /// failed in memory and the storage error is returned.
    pub(super) async fn commit(&self, slot: &mut InstanceSlot, event_type: EventType) -> EngineResult<()> {
        let instance_id = slot.state.id;
        let mut event = ExecutionEvent::new(instance_id, event_type);

        event.seq = match self.append(&event).await {
            Ok(seq) => seq,
            Err(err) => {
                let error = EngineError::storage(err);
                tracing::error!(
                    "Failed to persist event for instance {}, marking it failed: {}",
                    instance_id,
                    error
                );
                slot.state.fail_unlogged(error.to_string());
                self.release(instance_id);
                return Err(error);
            }
        };
        if event.seq != slot.state.last_seq + 1 {
            tracing::warn!(
                "Instance {} expected seq {} but the log assigned {}",
                instance_id,
                slot.state.last_seq + 1,
                event.seq
            );
        }

        slot.state.apply(&event);
        self.maybe_checkpoint(slot).await;
        Ok(())
    }

    pub(super) async fn append(&self, event: &ExecutionEvent) -> anyhow::Result<u64> {
        let policy = &self.config.storage_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.events.append(event.instance_id, event).await {
                Ok(seq) => return Ok(seq),
                Err(err) if attempt < max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        "Event append for instance {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                        event.instance_id,
                        attempt,
                        max_attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err.context(format!("event append failed after {attempt} attempts")))
                }
            }
        }
    }

    async fn maybe_checkpoint(&self, slot: &mut InstanceSlot) {
        let interval = self.config.checkpoint_interval;
        if interval == 0 || slot.state.last_seq < slot.last_checkpoint + interval {
            return;
        }

        let instance_id = slot.state.id;
        match self
            .checkpoints
            .save(instance_id, slot.state.last_seq, &slot.state)
            .await
        {
            Ok(checkpoint) => {
                tracing::debug!("Checkpointed instance {} at seq {}", instance_id, checkpoint.seq)
            }
            Err(err) => tracing::warn!("Checkpoint of instance {} failed: {:#}", instance_id, err),
        }
        // A failed checkpoint is retried at the next interval, not on every event
        slot.last_checkpoint = slot.state.last_seq;
    }

    /// Re-register deadlines of waiting tokens
    pub(super) fn arm_timers(&self, state: &InstanceState) -> usize {
        let mut armed = 0;
        for token in state.tokens.values() {
            let kind = match &token.wait {
                Some(WaitKind::Timer { .. }) => TimerKind::Timer,
                Some(WaitKind::Signal { deadline: Some(_) }) => TimerKind::Timeout,
                _ => continue,
            };
            if let Some(deadline) = token.wait.as_ref().and_then(WaitKind::deadline) {
                self.timers.schedule(deadline, state.id, token.id, kind);
                armed += 1;
            }
        }
        armed
    }

    /// Forget pending work and timers of an instance
    fn release(&self, instance_id: InstanceId) {
        self.timers.cancel_instance(instance_id);
        self.queue.remove_instance(instance_id);
    }

    pub(super) async fn slot(&self, instance_id: InstanceId) -> Option<Arc<Mutex<InstanceSlot>>> {
        self.instances.read().await.get(&instance_id).cloned()
    }

    async fn require_slot(&self, instance_id: InstanceId) -> EngineResult<Arc<Mutex<InstanceSlot>>> {
        self.slot(instance_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("instance {instance_id}")))
    }
}

/// First matching edge in definition order, falling back to the default edge
fn choose_path<'d>(
    definition: &'d ProcessDefinition,
    node: &Node,
    variables: &Variables,
) -> EngineResult<&'d Edge> {
    let mut default = None;
    for edge in definition.outgoing(&node.id) {
        if edge.default {
            default = Some(edge);
            continue;
        }
        match definition.condition(&edge.id) {
            Some(condition) if !condition.evaluate(variables) => continue,
            _ => return Ok(edge),
        }
    }
    default.ok_or_else(|| {
        EngineError::NoMatchingPath(format!(
            "no outgoing edge of exclusive gateway {} matched and it has no default",
            node.id
        ))
    })
}

fn single_outgoing<'d>(definition: &'d ProcessDefinition, node: &NodeId) -> EngineResult<&'d Edge> {
    match definition.outgoing(node).as_slice() {
        [edge] => Ok(*edge),
        edges => Err(EngineError::InvalidState(format!(
            "node {} has {} outgoing edges where one is required",
            node,
            edges.len()
        ))),
    }
}

fn deadline_after(ms: u64) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(std::time::Duration::from_millis(ms))
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
