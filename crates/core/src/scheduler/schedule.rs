use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::types::Variables;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Recurring start of the latest version of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSchedule {
    pub id: String,
    pub definition_key: String,
    /// Six-field cron expression (`sec min hour day month weekday`)
    pub cron: String,
    #[serde(default)]
    pub variables: Variables,
}

struct Registered {
    schedule: StartSchedule,
    handle: JoinHandle<()>,
}

/// Cron scheduler for instance starts
pub struct StartScheduler {
    engine: Arc<Engine>,
    registered: Mutex<HashMap<String, Registered>>,
}

impl StartScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            registered: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registered>> {
        self.registered.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a schedule, replacing any schedule with the same id.
    /// Returns the first time it will fire.
    pub fn register(&self, schedule: StartSchedule) -> EngineResult<DateTime<Utc>> {
        let cron = parse_cron(&schedule.cron)?;
        let first = cron
            .upcoming(Utc)
            .next()
            .ok_or_else(|| EngineError::Validation(format!("cron expression {} never fires", schedule.cron)))?;

        let handle = tokio::spawn(run_schedule(self.engine.clone(), schedule.clone(), cron));
        if let Some(previous) = self.lock().insert(schedule.id.clone(), Registered { schedule, handle }) {
            previous.handle.abort();
        }
        Ok(first)
    }

    pub fn unregister(&self, id: &str) -> bool {
        match self.lock().remove(id) {
            Some(registered) => {
                registered.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<StartSchedule> {
        let mut schedules: Vec<StartSchedule> = self.lock().values().map(|r| r.schedule.clone()).collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        schedules
    }

    /// Stop every schedule
    pub fn shutdown(&self) {
        for (_, registered) in self.lock().drain() {
            registered.handle.abort();
        }
    }
}

impl Drop for StartScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_cron(expr: &str) -> EngineResult<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| EngineError::Validation(format!("invalid cron expression {expr}: {e}")))
}

async fn run_schedule(engine: Arc<Engine>, schedule: StartSchedule, cron: Schedule) {
    let mut last = Utc::now();
    loop {
        let Some(next) = cron.after(&last.max(Utc::now())).next() else {
            tracing::info!("Schedule {} has no further runs", schedule.id);
            break;
        };
        if let Ok(wait) = (next - Utc::now()).to_std() {
            tokio::time::sleep(wait).await;
        }
        last = next;

        match engine
            .start_latest(&schedule.definition_key, schedule.variables.clone())
            .await
        {
            Ok(instance_id) => tracing::info!(
                "Schedule {} started instance {} of {}",
                schedule.id,
                instance_id,
                schedule.definition_key
            ),
            Err(err) => tracing::error!("Schedule {} failed to start {}: {}", schedule.id, schedule.definition_key, err),
        }
    }
}
