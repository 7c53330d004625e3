use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenflow_core::storage::{FilesystemBlobStore, RedbEventLog, RedbIndexStore};
use tokenflow_core::{EngineConfig, EngineService, ResolvedDependencies, StartSchedule};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Directory of `.json`/`.toml` definition sources deployed at startup
    #[serde(default)]
    pub deploy_dir: Option<PathBuf>,

    #[serde(default)]
    pub schedules: Vec<StartSchedule>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Redb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_event_log_file")]
    pub event_log_file: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
}

fn default_event_log_file() -> String {
    "events.redb".to_string()
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

fn default_blob_dir() -> String {
    "blobs".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            event_log_file: default_event_log_file(),
            index_file: default_index_file(),
            blob_dir: default_blob_dir(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            toml::from_str("").context("Failed to build default configuration")?
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_file)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    pub fn blob_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.blob_dir)
    }

    /// Open the storage backends selected by `[storage]`
    pub fn resolve_dependencies(&self) -> Result<ResolvedDependencies> {
        match self.storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage, instances will not survive a restart");
                Ok(ResolvedDependencies::in_memory())
            }
            StorageBackend::Redb => {
                std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
                Ok(ResolvedDependencies {
                    event_store: Arc::new(
                        RedbEventLog::new(self.event_log_path()).context("Failed to open event log")?,
                    ),
                    index_store: Arc::new(
                        RedbIndexStore::new(self.index_path()).context("Failed to open index store")?,
                    ),
                    blob_store: Arc::new(
                        FilesystemBlobStore::new(self.blob_path()).context("Failed to open blob store")?,
                    ),
                })
            }
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EngineService>,
}
