// Core of the tokenflow process engine: definitions, token execution,
// write-ahead persistence and scheduling

pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{EngineConfig, RetryPolicy};
pub use definition::{DefinitionStore, ProcessDefinition, ProcessDefinitionSource};
pub use engine::{Engine, RecoveryReport, TaskContext, TaskHandler, TaskRegistry};
pub use error::{EngineError, EngineResult};
pub use scheduler::StartSchedule;
pub use service::{EngineService, ResolvedDependencies};
pub use types::*;
