use super::blob::BlobStore;
use super::index::{CheckpointRef, IndexStore};
use crate::types::InstanceId;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::Arc;

/// Compressed instance snapshots kept in the blob store, indexed by instance
#[derive(Clone)]
pub struct CheckpointStore {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn IndexStore>,
}

impl CheckpointStore {
    pub fn new(blobs: Arc<dyn BlobStore>, index: Arc<dyn IndexStore>) -> Self {
        Self { blobs, index }
    }

    /// Store a snapshot that reflects every event up to and including `seq`
    pub async fn save<T: Serialize>(
        &self,
        instance_id: InstanceId,
        seq: u64,
        snapshot: &T,
    ) -> Result<CheckpointRef> {
        let json = serde_json::to_vec(snapshot).context("Failed to serialize checkpoint")?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .context("Failed to compress checkpoint")?;
        let compressed = encoder.finish().context("Failed to finish compression")?;

        let previous = self.index.load_checkpoint(instance_id)?;
        let blob = self.blobs.put(Bytes::from(compressed)).await?;
        let checkpoint = CheckpointRef {
            seq,
            blob,
            taken_at: Utc::now(),
        };
        self.index.save_checkpoint(instance_id, &checkpoint)?;

        // The superseded snapshot is no longer reachable
        if let Some(previous) = previous {
            if previous.blob != checkpoint.blob {
                self.blobs.delete(&previous.blob).await?;
            }
        }

        Ok(checkpoint)
    }

    /// Latest snapshot of an instance, if one was taken
    pub async fn load<T: DeserializeOwned>(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<(CheckpointRef, T)>> {
        let Some(checkpoint) = self.index.load_checkpoint(instance_id)? else {
            return Ok(None);
        };
        let Some(compressed) = self.blobs.get(&checkpoint.blob).await? else {
            tracing::warn!(
                "Checkpoint blob {} of instance {} is missing, replaying full log",
                checkpoint.blob,
                instance_id
            );
            return Ok(None);
        };

        let mut json = Vec::new();
        GzDecoder::new(compressed.as_ref())
            .read_to_end(&mut json)
            .context("Failed to decompress checkpoint")?;
        let snapshot = serde_json::from_slice(&json).context("Failed to parse checkpoint")?;
        Ok(Some((checkpoint, snapshot)))
    }
}
