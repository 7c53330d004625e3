use crate::engine::Engine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long the timer task sleeps without re-checking
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(60);

/// Worker pool draining the engine's work queue plus the task that delivers
/// due timers
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn `workers` workers and one timer task
    pub fn start(engine: Arc<Engine>, workers: usize) -> Self {
        let cancel = CancellationToken::new();
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers + 1);

        for worker in 0..workers {
            handles.push(tokio::spawn(run_worker(worker, engine.clone(), cancel.clone())));
        }
        handles.push(tokio::spawn(run_timers(engine, cancel.clone())));

        tracing::info!("Scheduler started with {} workers", workers);
        Self { cancel, handles }
    }

    /// Stop dispatching new work and wait for in-flight executions
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!("Scheduler task panicked: {}", err);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_worker(worker: usize, engine: Arc<Engine>, cancel: CancellationToken) {
    let queue = engine.queue().clone();
    while let Some((instance_id, token_id)) = queue.next(&cancel).await {
        tracing::debug!("Worker {} executing token {} of {}", worker, token_id, instance_id);
        if let Err(err) = engine.execute_token(instance_id, token_id).await {
            tracing::debug!("Token {} of instance {} failed: {}", token_id, instance_id, err);
        }
    }
}

async fn run_timers(engine: Arc<Engine>, cancel: CancellationToken) {
    let timers = engine.timers().clone();
    loop {
        // Register interest before scanning so a schedule() racing with the
        // scan still wakes us
        let notified = timers.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        engine.fire_due_timers(Utc::now()).await;

        let sleep_for = timers
            .next_deadline()
            .map(|deadline| {
                (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_TIMER_SLEEP)
            })
            .unwrap_or(MAX_TIMER_SLEEP);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut notified => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::types::{InstanceStatus, Variables};

    async fn wait_for(engine: &Engine, instance: crate::types::InstanceId, status: InstanceStatus) {
        for _ in 0..200 {
            if engine.get_state(instance).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instance {instance} never reached {status:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_complete_concurrent_instances() {
        let harness = TestHarness::new();
        let id = harness.deploy(fork_join_source("fan", 4));
        let engine = Arc::new(harness.engine);
        let scheduler = Scheduler::start(engine.clone(), 4);

        let mut instances = Vec::new();
        for _ in 0..10 {
            instances.push(engine.start_instance(&id, Variables::new()).await.unwrap());
        }
        for instance in instances {
            wait_for(&engine, instance, InstanceStatus::Completed).await;
        }

        scheduler.shutdown().await;
        assert!(engine.queue().is_empty());
    }

    #[tokio::test]
    async fn test_timer_task_fires_deadlines() {
        let harness = TestHarness::new();
        let id = harness.deploy(timer_source("delay", 20));
        let timeout = harness.deploy(user_task_source("review", Some(20)));
        let engine = Arc::new(harness.engine);
        let scheduler = Scheduler::start(engine.clone(), 1);

        let delayed = engine.start_instance(&id, Variables::new()).await.unwrap();
        let reviewed = engine.start_instance(&timeout, Variables::new()).await.unwrap();
        wait_for(&engine, delayed, InstanceStatus::Completed).await;
        wait_for(&engine, reviewed, InstanceStatus::Completed).await;

        let state = engine.get_state(reviewed).await.unwrap();
        assert_eq!(state.variables["review_timed_out"], serde_json::json!(true));
        scheduler.shutdown().await;
    }
}
