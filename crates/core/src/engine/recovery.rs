use super::executor::{Engine, InstanceSlot};
use super::instance::InstanceState;
use crate::error::{EngineError, EngineResult};
use crate::events::EventType;
use crate::types::{InstanceId, InstanceStatus, TokenId, TokenState};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of rebuilding instances from the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Instances found in the log
    pub instances: usize,
    /// Instances that are neither completed, failed nor terminated
    pub active: usize,
    /// Tokens put back on the work queue
    pub requeued: usize,
    /// Deadlines re-registered with the timer index
    pub timers: usize,
    /// Instances that could not be rebuilt or resumed
    pub failed: usize,
}

impl Engine {
    /// Rebuild every instance in the event store and reschedule its work.
    ///
    /// Tokens that were RUNNING when the process stopped are put back to
    /// READY, so a service task interrupted before its result was committed
    /// runs again.
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let ids = self.events.instances().await.map_err(EngineError::storage)?;
        let mut report = RecoveryReport::default();

        for instance_id in ids {
            if let Err(err) = self.recover_instance(instance_id, &mut report).await {
                report.failed += 1;
                tracing::error!("Failed to recover instance {}: {}", instance_id, err);
            }
        }

        tracing::info!(
            "Recovered {} instances ({} active, {} tokens requeued, {} timers re-armed)",
            report.instances,
            report.active,
            report.requeued,
            report.timers
        );
        Ok(report)
    }

    async fn recover_instance(&self, instance_id: InstanceId, report: &mut RecoveryReport) -> EngineResult<()> {
        let (state, last_checkpoint) = self.rebuild(instance_id).await?.ok_or_else(|| {
            EngineError::InvalidState(format!("log of instance {instance_id} does not start with InstanceStarted"))
        })?;
        report.instances += 1;

        let slot = Arc::new(Mutex::new(InstanceSlot {
            state,
            last_checkpoint,
        }));
        self.instances.write().await.insert(instance_id, slot.clone());

        let mut slot = slot.lock().await;
        if slot.state.status.is_terminal() {
            return Ok(());
        }
        report.active += 1;
        if slot.state.status == InstanceStatus::Suspended {
            return Ok(());
        }
        let definition = self.definitions.get(&slot.state.definition_id)?;

        if slot.state.tokens.is_empty() {
            if slot.state.consumed.is_empty() {
                // Stopped between InstanceStarted and the first token
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
                report.requeued += 1;
            } else {
                // Stopped between the last consumption and completion
                self.complete(&mut slot).await?;
            }
            return Ok(());
        }

        let tokens: Vec<(TokenId, TokenState)> = slot
            .state
            .tokens
            .values()
            .map(|t| (t.id, t.state))
            .collect();
        for (token_id, state) in tokens {
            match state {
                TokenState::Running => {
                    self.commit(&mut slot, EventType::TokenRequeued { token_id })
                        .await?;
                    self.queue.push(instance_id, token_id);
                    report.requeued += 1;
                }
                TokenState::Ready => {
                    self.queue.push(instance_id, token_id);
                    report.requeued += 1;
                }
                TokenState::Waiting => {}
            }
        }
        report.timers += self.arm_timers(&slot.state);

        tracing::debug!(
            "Instance {} resumed at seq {}",
            instance_id,
            slot.state.last_seq
        );
        Ok(())
    }

    /// State of an instance from its newest checkpoint plus the events after
    /// it, along with the sequence number of that checkpoint
    pub(crate) async fn rebuild(&self, instance_id: InstanceId) -> EngineResult<Option<(InstanceState, u64)>> {
        let base = match self.checkpoints.load::<InstanceState>(instance_id).await {
            Ok(Some((checkpoint, state))) if state.last_seq == checkpoint.seq => Some(state),
            Ok(Some((checkpoint, _))) => {
                tracing::warn!(
                    "Checkpoint of instance {} does not match seq {}, replaying full log",
                    instance_id,
                    checkpoint.seq
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("Ignoring unreadable checkpoint of instance {}: {:#}", instance_id, err);
                None
            }
        };

        let checkpoint_seq = base.as_ref().map(|s| s.last_seq).unwrap_or(0);
        let events = self
            .events
            .read_from(instance_id, checkpoint_seq + 1)
            .await
            .map_err(EngineError::storage)?;

        Ok(InstanceState::replay(base, &events).map(|state| (state, checkpoint_seq)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{TaskContext, TaskHandler, TaskRegistry};
    use crate::events::ExecutionEvent;
    use crate::test_support::*;
    use crate::types::{Variables, WaitKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl TaskHandler for Counting {
        async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<Variables> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Variables::new())
        }
    }

    fn counting_harness() -> (TestHarness, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::with_builtins();
        registry.register("notify", Counting(calls.clone()));
        (TestHarness::with_registry(registry), calls)
    }

    #[tokio::test]
    async fn test_crash_before_resume_keeps_waiting_token() {
        let (harness, calls) = counting_harness();
        let id = harness.deploy(review_then_notify_source("approval"));

        let instance = harness.engine.start_instance(&id, Variables::new()).await.unwrap();
        harness.engine.run_until_idle().await;
        let before = harness.engine.get_state(instance).await.unwrap();
        let token = before.token_at("review").unwrap().id;

        // Simulated restart: a fresh engine over the same stores
        let restarted = harness.restart();
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.instances, 1);
        assert_eq!(report.active, 1);
        assert_eq!(report.requeued, 0);

        let after = restarted.get_state(instance).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(after.token_at("review").unwrap().wait, Some(WaitKind::Signal { deadline: None }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        restarted.signal(instance, token, Variables::new()).await.unwrap();
        restarted.run_until_idle().await;
        assert_eq!(
            restarted.get_state(instance).await.unwrap().status,
            InstanceStatus::Completed
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_crash_after_append_before_ack_resumes_once() {
        let (harness, calls) = counting_harness();
        let id = harness.deploy(review_then_notify_source("approval"));

        let instance = harness.engine.start_instance(&id, Variables::new()).await.unwrap();
        harness.engine.run_until_idle().await;
        let token = harness.engine.get_state(instance).await.unwrap().token_at("review").unwrap().id;

        // The signal reached the log, then the process died before applying it
        let signalled = ExecutionEvent::new(
            instance,
            EventType::TokenSignalled {
                token_id: token,
                timed_out: false,
                payload: json!({"approved": true}).as_object().cloned().unwrap(),
            },
        );
        harness.events.append(instance, &signalled).await.unwrap();

        let restarted = harness.restart();
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.requeued, 1);
        restarted.run_until_idle().await;

        let state = restarted.get_state(instance).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(state.variables["approved"], json!(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Re-signalling the consumed token is stale, not a second resume
        let err = restarted.signal(instance, token, Variables::new()).await.unwrap_err();
        assert!(err.is_stale());
    }

    #[tokio::test]
    async fn test_running_token_is_requeued() {
        let harness = TestHarness::new();
        let id = harness.deploy(user_task_source("approval", None));

        let instance = harness.engine.start_instance(&id, Variables::new()).await.unwrap();
        harness.engine.run_until_idle().await;
        let token = harness.engine.get_state(instance).await.unwrap().token_at("review").unwrap().id;

        for event_type in [
            EventType::TokenSignalled {
                token_id: token,
                timed_out: false,
                payload: Variables::new(),
            },
            EventType::TokenDispatched { token_id: token },
        ] {
            harness
                .events
                .append(instance, &ExecutionEvent::new(instance, event_type))
                .await
                .unwrap();
        }

        let restarted = harness.restart();
        restarted.recover().await.unwrap();
        let events = restarted.events(instance).await.unwrap();
        assert_eq!(
            events.last().unwrap().event_type,
            EventType::TokenRequeued { token_id: token }
        );

        restarted.run_until_idle().await;
        assert_eq!(
            restarted.get_state(instance).await.unwrap().status,
            InstanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_missed_deadline_fires_after_recovery() {
        let harness = TestHarness::new();
        let id = harness.deploy(timer_source("delay", 10));

        let instance = harness.engine.start_instance(&id, Variables::new()).await.unwrap();
        harness.engine.run_until_idle().await;

        let restarted = harness.restart();
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.timers, 1);

        let later = chrono::Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(restarted.fire_due_timers(later).await, 1);
        restarted.run_until_idle().await;
        assert_eq!(
            restarted.get_state(instance).await.unwrap().status,
            InstanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_terminal_instances_stay_queryable() {
        let harness = TestHarness::new();
        let id = harness.deploy(linear_source("linear"));
        let instance = harness.engine.start_instance(&id, Variables::new()).await.unwrap();
        harness.engine.run_until_idle().await;

        let restarted = harness.restart();
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.instances, 1);
        assert_eq!(report.active, 0);
        assert!(restarted.queue().is_empty());
        assert_eq!(
            restarted.get_state(instance).await.unwrap().status,
            InstanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_checkpoint_plus_tail_equals_full_replay() {
        let harness = TestHarness::with_checkpoint_interval(3);
        let id = harness.deploy(parallel_review_source("review"));

        let instance = harness.engine.start_instance(&id, json!({"a": 1}).as_object().cloned().unwrap()).await.unwrap();
        harness.engine.run_until_idle().await;
        let left = harness.engine.get_state(instance).await.unwrap().token_at("left").unwrap().id;
        harness.engine.signal(instance, left, Variables::new()).await.unwrap();
        harness.engine.run_until_idle().await;

        let live = harness.engine.get_state(instance).await.unwrap();
        let (from_checkpoint, checkpoint_seq) = harness.engine.rebuild(instance).await.unwrap().unwrap();
        assert!(checkpoint_seq > 0);

        let log = harness.events.read_from(instance, 1).await.unwrap();
        let full = InstanceState::replay(None, &log).unwrap();
        let twice = InstanceState::replay(Some(full.clone()), &log).unwrap();

        assert_eq!(from_checkpoint, full);
        assert_eq!(twice, full);
        assert_eq!(full.snapshot(), live);
    }
}
