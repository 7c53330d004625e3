use crate::events::{EventStore, ExecutionEvent};
use crate::types::InstanceId;
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// (instance id, seq) -> JSON encoded event
const EVENTS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("events");
/// instance id -> last assigned seq
const HEADS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("event_heads");

/// Durable event log backed by redb.
///
/// Each append runs in its own write transaction, so an event is durable
/// once `append` returns.
#[derive(Clone)]
pub struct RedbEventLog {
    db: Arc<Database>,
}

impl RedbEventLog {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create event log directory")?;
        }

        let db = Database::create(&path).context("Failed to create event log database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _events_table = write_txn
                .open_table(EVENTS_TABLE)
                .context("Failed to open events table")?;
            let _heads_table = write_txn
                .open_table(HEADS_TABLE)
                .context("Failed to open event heads table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait::async_trait]
impl EventStore for RedbEventLog {
    async fn append(&self, instance_id: InstanceId, event: &ExecutionEvent) -> Result<u64> {
        let key = instance_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let seq = {
            let mut heads = write_txn
                .open_table(HEADS_TABLE)
                .context("Failed to open event heads table")?;
            let last = heads
                .get(key.as_str())
                .context("Failed to read event head")?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let seq = last + 1;

            let mut stored = event.clone();
            stored.seq = seq;
            let value = serde_json::to_vec(&stored).context("Failed to serialize event")?;

            let mut events = write_txn
                .open_table(EVENTS_TABLE)
                .context("Failed to open events table")?;
            events
                .insert((key.as_str(), seq), value.as_slice())
                .context("Failed to insert event")?;
            heads
                .insert(key.as_str(), seq)
                .context("Failed to update event head")?;
            seq
        };
        write_txn.commit().context("Failed to commit event")?;
        Ok(seq)
    }

    async fn read_from(&self, instance_id: InstanceId, from_seq: u64) -> Result<Vec<ExecutionEvent>> {
        let key = instance_id.to_string();
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EVENTS_TABLE)
            .context("Failed to open events table")?;

        let mut events = Vec::new();
        for item in table
            .range((key.as_str(), from_seq)..=(key.as_str(), u64::MAX))
            .context("Failed to range events")?
        {
            let (_key, value) = item.context("Failed to read event")?;
            let event: ExecutionEvent =
                serde_json::from_slice(value.value()).context("Failed to deserialize event")?;
            events.push(event);
        }

        Ok(events)
    }

    async fn instances(&self) -> Result<Vec<InstanceId>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(HEADS_TABLE)
            .context("Failed to open event heads table")?;

        let mut ids = Vec::new();
        for item in table.iter().context("Failed to iterate event heads")? {
            let (key, _value) = item.context("Failed to read event head")?;
            let id: InstanceId = key
                .value()
                .parse()
                .context("Failed to parse instance id in event log")?;
            ids.push(id);
        }

        Ok(ids)
    }
}

/// Volatile event log for tests and ephemeral deployments
#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<HashMap<InstanceId, Vec<ExecutionEvent>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventLog {
    async fn append(&self, instance_id: InstanceId, event: &ExecutionEvent) -> Result<u64> {
        let mut events = self.events.write().await;
        let log = events.entry(instance_id).or_default();
        let seq = log.last().map(|e| e.seq).unwrap_or(0) + 1;
        let mut stored = event.clone();
        stored.seq = seq;
        log.push(stored);
        Ok(seq)
    }

    async fn read_from(&self, instance_id: InstanceId, from_seq: u64) -> Result<Vec<ExecutionEvent>> {
        let events = self.events.read().await;
        Ok(events
            .get(&instance_id)
            .map(|log| log.iter().filter(|e| e.seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn instances(&self) -> Result<Vec<InstanceId>> {
        Ok(self.events.read().await.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::types::{DefinitionId, TokenId};
    use tempfile::TempDir;

    fn started(instance_id: InstanceId) -> ExecutionEvent {
        ExecutionEvent::new(
            instance_id,
            EventType::InstanceStarted {
                definition_id: DefinitionId::new("order", 1),
                variables: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_redb_event_log_assigns_sequence_per_instance() {
        let temp_dir = TempDir::new().unwrap();
        let log = RedbEventLog::new(temp_dir.path().join("events.redb")).unwrap();

        let a = InstanceId::new();
        let b = InstanceId::new();
        assert_eq!(log.append(a, &started(a)).await.unwrap(), 1);
        assert_eq!(log.append(b, &started(b)).await.unwrap(), 1);
        let token_id = TokenId::new();
        let dispatched = ExecutionEvent::new(a, EventType::TokenDispatched { token_id });
        assert_eq!(log.append(a, &dispatched).await.unwrap(), 2);

        let events = log.read_from(a, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
        assert_eq!(events[1].event_type, EventType::TokenDispatched { token_id });

        let tail = log.read_from(a, 2).await.unwrap();
        assert_eq!(tail.len(), 1);

        let mut instances = log.instances().await.unwrap();
        instances.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(instances, expected);
    }

    #[tokio::test]
    async fn test_redb_event_log_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.redb");
        let id = InstanceId::new();
        {
            let log = RedbEventLog::new(path.clone()).unwrap();
            log.append(id, &started(id)).await.unwrap();
        }

        let log = RedbEventLog::new(path).unwrap();
        assert_eq!(log.read_from(id, 1).await.unwrap().len(), 1);
        assert_eq!(log.append(id, &started(id)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_event_log() {
        let log = InMemoryEventLog::new();
        let id = InstanceId::new();
        log.append(id, &started(id)).await.unwrap();
        log.append(id, &started(id)).await.unwrap();

        assert_eq!(log.read_from(id, 2).await.unwrap().len(), 1);
        assert!(log.read_from(InstanceId::new(), 1).await.unwrap().is_empty());
        assert_eq!(log.instances().await.unwrap(), vec![id]);
    }
}
