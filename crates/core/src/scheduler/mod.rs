//! Work distribution: the ready-token queue, timer deadlines, the worker
//! pool and cron-driven instance starts.

mod pool;
mod queue;
mod schedule;
mod timers;

pub use pool::Scheduler;
pub use queue::WorkQueue;
pub use schedule::{StartSchedule, StartScheduler};
pub use timers::{TimerEntry, TimerIndex, TimerKind};
