//! Error taxonomy of the engine.

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the definition store, the engine and the lifecycle service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Definition rejected at deploy time.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Definition or instance does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation against an instance or token in the wrong state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Parallel join received a mismatched set of tokens.
    #[error("Synchronization error: {0}")]
    Synchronization(String),

    /// Exclusive gateway found no outgoing path.
    #[error("No matching path: {0}")]
    NoMatchingPath(String),

    /// Signal addressed to an unknown or already consumed token.
    #[error("Stale signal: {0}")]
    StaleSignal(String),

    /// Durable log append/read failed after retries.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Service task handler missing or failed.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// Whether this error moves the affected instance to FAILED.
    pub fn fails_instance(&self) -> bool {
        matches!(
            self,
            Self::Synchronization(_) | Self::NoMatchingPath(_) | Self::Storage(_) | Self::TaskFailed(_)
        )
    }

    /// Stale signals are reported to the caller but never fatal.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleSignal(_))
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}
