//! Process definitions: graph model, edge conditions, deploy-time validation
//! and the versioned definition store.

mod condition;
mod model;
mod store;
mod validate;

pub use condition::{CmpOp, Condition, Operand};
pub use model::{
    DefinitionSummary, Edge, GatewayRole, Node, NodeKind, ProcessDefinition, ProcessDefinitionSource,
};
pub use store::{load_sources_from_dir, DefinitionStore};
