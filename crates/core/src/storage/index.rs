use crate::definition::ProcessDefinitionSource;
use crate::types::{DefinitionId, InstanceId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

const DEFINITIONS_TABLE: TableDefinition<(&str, u32), &[u8]> = TableDefinition::new("definitions");
const CHECKPOINTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Pointer to the latest checkpoint of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Last event sequence number folded into the snapshot
    pub seq: u64,
    /// Content hash of the compressed snapshot in the blob store
    pub blob: crate::storage::BlobHash,
    pub taken_at: DateTime<Utc>,
}

/// Metadata index: deployed definition sources and checkpoint pointers
pub trait IndexStore: Send + Sync {
    /// Persist the source of a deployed definition
    fn save_definition(&self, id: &DefinitionId, source: &ProcessDefinitionSource) -> Result<()>;

    /// All persisted definitions, ordered by key then version
    fn load_definitions(&self) -> Result<Vec<(DefinitionId, ProcessDefinitionSource)>>;

    /// Forget a pruned definition version
    fn delete_definition(&self, id: &DefinitionId) -> Result<()>;

    /// Record the latest checkpoint of an instance
    fn save_checkpoint(&self, instance_id: InstanceId, checkpoint: &CheckpointRef) -> Result<()>;

    /// Latest checkpoint of an instance, if any
    fn load_checkpoint(&self, instance_id: InstanceId) -> Result<Option<CheckpointRef>>;
}

/// Index store for fast lookups using redb
#[derive(Clone)]
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _definitions_table = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("Failed to open definitions table")?;
            let _checkpoints_table = write_txn
                .open_table(CHECKPOINTS_TABLE)
                .context("Failed to open checkpoints table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl IndexStore for RedbIndexStore {
    fn save_definition(&self, id: &DefinitionId, source: &ProcessDefinitionSource) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(source).context("Failed to serialize definition")?;
            table
                .insert((id.key.as_str(), id.version), value.as_slice())
                .context("Failed to insert definition")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn load_definitions(&self) -> Result<Vec<(DefinitionId, ProcessDefinitionSource)>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(DEFINITIONS_TABLE)
            .context("Failed to open table")?;

        let mut definitions = Vec::new();
        for item in table.iter().context("Failed to iterate definitions")? {
            let (key, value) = item.context("Failed to read item")?;
            let (def_key, version) = key.value();
            let source: ProcessDefinitionSource = serde_json::from_slice(value.value())
                .context("Failed to deserialize definition")?;
            definitions.push((DefinitionId::new(def_key, version), source));
        }

        Ok(definitions)
    }

    fn delete_definition(&self, id: &DefinitionId) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("Failed to open table")?;
            table
                .remove((id.key.as_str(), id.version))
                .context("Failed to remove definition")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn save_checkpoint(&self, instance_id: InstanceId, checkpoint: &CheckpointRef) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(CHECKPOINTS_TABLE)
                .context("Failed to open table")?;

            let key = instance_id.to_string();
            let value = serde_json::to_vec(checkpoint).context("Failed to serialize checkpoint")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert checkpoint")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn load_checkpoint(&self, instance_id: InstanceId) -> Result<Option<CheckpointRef>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(CHECKPOINTS_TABLE)
            .context("Failed to open table")?;

        let key = instance_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get checkpoint")?;

        match value {
            Some(guard) => {
                let checkpoint: CheckpointRef = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize checkpoint")?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }
}

/// Volatile index store for tests and ephemeral deployments
#[derive(Default)]
pub struct InMemoryIndexStore {
    definitions: RwLock<BTreeMap<DefinitionId, ProcessDefinitionSource>>,
    checkpoints: RwLock<HashMap<InstanceId, CheckpointRef>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("index store lock poisoned")
}

impl IndexStore for InMemoryIndexStore {
    fn save_definition(&self, id: &DefinitionId, source: &ProcessDefinitionSource) -> Result<()> {
        self.definitions
            .write()
            .map_err(poisoned)?
            .insert(id.clone(), source.clone());
        Ok(())
    }

    fn load_definitions(&self) -> Result<Vec<(DefinitionId, ProcessDefinitionSource)>> {
        Ok(self
            .definitions
            .read()
            .map_err(poisoned)?
            .iter()
            .map(|(id, source)| (id.clone(), source.clone()))
            .collect())
    }

    fn delete_definition(&self, id: &DefinitionId) -> Result<()> {
        self.definitions.write().map_err(poisoned)?.remove(id);
        Ok(())
    }

    fn save_checkpoint(&self, instance_id: InstanceId, checkpoint: &CheckpointRef) -> Result<()> {
        self.checkpoints
            .write()
            .map_err(poisoned)?
            .insert(instance_id, checkpoint.clone());
        Ok(())
    }

    fn load_checkpoint(&self, instance_id: InstanceId) -> Result<Option<CheckpointRef>> {
        Ok(self
            .checkpoints
            .read()
            .map_err(poisoned)?
            .get(&instance_id)
            .cloned())
    }
}
