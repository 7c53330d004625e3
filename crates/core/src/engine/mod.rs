//! Process instance engine: the token state machine, its event reducer and
//! crash recovery.

mod executor;
mod handlers;
mod instance;
mod recovery;

pub use executor::Engine;
pub use handlers::{AssignHandler, LogHandler, TaskContext, TaskHandler, TaskRegistry};
pub use instance::InstanceState;
pub use recovery::RecoveryReport;
