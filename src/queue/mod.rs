//! Task Queues
//!
//! At-least-once handoff of workflow and activity tasks between the
//! scheduler and workers.

pub mod task;
pub mod task_queue;

pub use task::{ActivityTask, Task, TaskId, TaskKind, WorkflowTask};
pub use task_queue::{DeadLetter, FailOutcome, TaskQueue};
