use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Content-addressed blob hash (SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHash(pub String);

impl BlobHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(data);
        Self(hex::encode(hash))
    }
}

impl std::fmt::Display for BlobHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed storage for checkpoint snapshots
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under their SHA-256 hash; storing existing content is a no-op
    async fn put(&self, data: Bytes) -> Result<BlobHash>;

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>>;

    async fn exists(&self, hash: &BlobHash) -> Result<bool>;

    /// Remove a blob; deleting a missing blob succeeds
    async fn delete(&self, hash: &BlobHash) -> Result<()>;
}

/// Blobs as files under `base_path/<first two hex chars>/<hash>`.
///
/// Content is written to a temporary file and renamed into place, so a
/// crash mid-write never leaves a truncated blob under a valid hash.
#[derive(Clone)]
pub struct FilesystemBlobStore {
    base_path: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("Failed to create blob directory {}", base_path.display()))?;
        Ok(Self { base_path })
    }

    fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        let fanout = hash.0.get(..2).unwrap_or(&hash.0);
        self.base_path.join(fanout).join(&hash.0)
    }
}

fn not_found(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        let path = self.blob_path(&hash);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(hash);
        }

        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("blob path {} has no parent", path.display()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create blob fan-out directory")?;

        let staging = dir.join(format!(".{}.{}.tmp", hash.0, uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&staging)
            .await
            .context("Failed to create staging file")?;
        file.write_all(&data).await.context("Failed to write blob")?;
        file.sync_all().await.context("Failed to sync blob")?;
        drop(file);

        if let Err(err) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err).context("Failed to move blob into place");
        }
        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.blob_path(hash)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if not_found(&err) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read blob {hash}")),
        }
    }

    async fn exists(&self, hash: &BlobHash) -> Result<bool> {
        tokio::fs::try_exists(self.blob_path(hash))
            .await
            .context("Failed to stat blob")
    }

    async fn delete(&self, hash: &BlobHash) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(hash)).await {
            Err(err) if !not_found(&err) => Err(err).with_context(|| format!("Failed to delete blob {hash}")),
            _ => Ok(()),
        }
    }
}

/// Volatile blob store for tests and ephemeral deployments
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<BlobHash, Bytes>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        self.blobs.write().await.insert(hash.clone(), data);
        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().await.get(hash).cloned())
    }

    async fn exists(&self, hash: &BlobHash) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(hash))
    }

    async fn delete(&self, hash: &BlobHash) -> Result<()> {
        self.blobs.write().await.remove(hash);
        Ok(())
    }
}
