use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the engine and its scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of parallel workers pulling from the work queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Events between two checkpoints of an instance (0 disables checkpoints)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    #[serde(default)]
    pub storage_retry: RetryPolicy,
}

fn default_workers() -> usize {
    4
}

fn default_checkpoint_interval() -> u64 {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            checkpoint_interval: default_checkpoint_interval(),
            storage_retry: RetryPolicy::default(),
        }
    }
}

/// Bounded exponential backoff for log appends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}
