//! Workflow Execution Module
//!
//! Runs workflows to completion: the scheduler that turns commands into
//! tasks and enforces timeouts, and the engine runtime that exposes the
//! client API and drives worker threads.
//!
//! # Architecture
//!
//! - [`scheduler`]: Task dispatch, retries, timeouts, timers, recovery
//! - [`engine`]: Client facade and worker pool

pub mod engine;
pub mod scheduler;

pub use engine::{Engine, WorkerPool};
pub use scheduler::{Scheduler, SweepReport};
