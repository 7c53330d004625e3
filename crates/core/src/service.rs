//! Two-phase lifecycle around the engine.
//!
//! An [`EngineService`] is constructed inert with its configuration and task
//! handlers. Storage is handed over in [`EngineService::activate`], which
//! loads the deployed definitions, recovers instances from the log and
//! starts the scheduler. Nothing is reachable through globals.

use crate::config::EngineConfig;
use crate::definition::DefinitionStore;
use crate::engine::{Engine, RecoveryReport, TaskRegistry};
use crate::error::{EngineError, EngineResult};
use crate::events::EventStore;
use crate::scheduler::{Scheduler, StartSchedule, StartScheduler};
use crate::storage::{
    BlobStore, CheckpointStore, FilesystemBlobStore, InMemoryBlobStore, InMemoryEventLog, InMemoryIndexStore,
    IndexStore, RedbEventLog, RedbIndexStore,
};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage backends the engine needs, resolved by the caller
#[derive(Clone)]
pub struct ResolvedDependencies {
    pub event_store: Arc<dyn EventStore>,
    pub index_store: Arc<dyn IndexStore>,
    pub blob_store: Arc<dyn BlobStore>,
}

impl ResolvedDependencies {
    /// Ephemeral stores; everything is lost on restart
    pub fn in_memory() -> Self {
        Self {
            event_store: Arc::new(InMemoryEventLog::new()),
            index_store: Arc::new(InMemoryIndexStore::new()),
            blob_store: Arc::new(InMemoryBlobStore::new()),
        }
    }

    /// Durable stores under `data_dir`
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let event_store = RedbEventLog::new(data_dir.join("events.redb")).context("Failed to open event log")?;
        let index_store = RedbIndexStore::new(data_dir.join("index.redb")).context("Failed to open index")?;
        let blob_store = FilesystemBlobStore::new(data_dir.join("blobs")).context("Failed to open blob store")?;

        Ok(Self {
            event_store: Arc::new(event_store),
            index_store: Arc::new(index_store),
            blob_store: Arc::new(blob_store),
        })
    }
}

struct Active {
    engine: Arc<Engine>,
    scheduler: Scheduler,
    starts: StartScheduler,
}

/// Owner of the engine and its background tasks
pub struct EngineService {
    config: EngineConfig,
    handlers: Arc<TaskRegistry>,
    active: RwLock<Option<Active>>,
}

impl EngineService {
    pub fn new(config: EngineConfig, handlers: TaskRegistry) -> Self {
        Self {
            config,
            handlers: Arc::new(handlers),
            active: RwLock::new(None),
        }
    }

    /// Wire the engine to its storage, recover and start dispatching
    pub async fn activate(&self, deps: ResolvedDependencies) -> EngineResult<RecoveryReport> {
        let mut active = self.active.write().await;
        if active.is_some() {
            return Err(EngineError::InvalidState("service is already active".to_string()));
        }

        let definitions = Arc::new(DefinitionStore::new(deps.index_store.clone()));
        definitions.load_persisted()?;

        let engine = Arc::new(Engine::new(
            self.config.clone(),
            definitions,
            deps.event_store,
            CheckpointStore::new(deps.blob_store, deps.index_store),
            self.handlers.clone(),
        ));
        let report = engine.recover().await?;

        let scheduler = Scheduler::start(engine.clone(), self.config.workers);
        let starts = StartScheduler::new(engine.clone());
        *active = Some(Active {
            engine,
            scheduler,
            starts,
        });

        tracing::info!("Engine service activated");
        Ok(report)
    }

    pub async fn is_active(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Handle to the running engine
    pub async fn engine(&self) -> EngineResult<Arc<Engine>> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|active| active.engine.clone())
            .ok_or_else(inactive)
    }

    /// Register a cron-driven start
    pub async fn schedule_start(&self, schedule: StartSchedule) -> EngineResult<chrono::DateTime<chrono::Utc>> {
        let active = self.active.read().await;
        let active = active.as_ref().ok_or_else(inactive)?;
        let first = active.starts.register(schedule.clone())?;
        tracing::info!(
            "Scheduled {} to start {} ({}), first run at {}",
            schedule.id,
            schedule.definition_key,
            schedule.cron,
            first
        );
        Ok(first)
    }

    pub async fn schedules(&self) -> Vec<StartSchedule> {
        match self.active.read().await.as_ref() {
            Some(active) => active.starts.list(),
            None => Vec::new(),
        }
    }

    /// Stop dispatching and wait for in-flight executions. The service can
    /// be activated again afterwards.
    pub async fn deactivate(&self) -> EngineResult<()> {
        let active = self.active.write().await.take().ok_or_else(inactive)?;
        active.starts.shutdown();
        active.scheduler.shutdown().await;
        tracing::info!("Engine service deactivated");
        Ok(())
    }
}

fn inactive() -> EngineError {
    EngineError::InvalidState("service is not active".to_string())
}
