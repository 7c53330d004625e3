use crate::types::{InstanceId, NodeId, TokenId, Variables};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a service task handler gets to see
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub instance_id: InstanceId,
    pub token_id: TokenId,
    pub node_id: NodeId,
    /// `parameters` of the service task node
    pub parameters: serde_json::Value,
    /// Instance variables at dispatch time
    pub variables: Variables,
}

/// Work performed by a service task.
///
/// The returned bindings are merged into the instance variables. A handler
/// may run again after a crash if its result was not yet committed.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> Result<Variables>;
}

/// Named service task handlers, fixed before the engine starts
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `log` and `assign`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", LogHandler);
        registry.register("assign", AssignHandler);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Logs the task parameters and leaves variables untouched
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn execute(&self, ctx: TaskContext) -> Result<Variables> {
        tracing::info!(
            "Service task {} of instance {}: {}",
            ctx.node_id,
            ctx.instance_id,
            ctx.parameters
        );
        Ok(Variables::new())
    }
}

/// Copies its `parameters` object into the instance variables
pub struct AssignHandler;

#[async_trait]
impl TaskHandler for AssignHandler {
    async fn execute(&self, ctx: TaskContext) -> Result<Variables> {
        match ctx.parameters {
            serde_json::Value::Object(values) => Ok(values),
            serde_json::Value::Null => Ok(Variables::new()),
            other => anyhow::bail!("assign expects an object of parameters, got {other}"),
        }
    }
}
