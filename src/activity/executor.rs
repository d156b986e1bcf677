//! Activity Executor
//!
//! Runs one attempt of a registered activity and turns its outcome into a
//! report for the scheduler. Panics in activity code are caught and
//! reported as retryable execution failures.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use super::context::{ActivityContext, ActivityInfo, HeartbeatSink};
use crate::error::{ActivityError, Failure};
use crate::queue::{ActivityTask, TaskId};
use crate::registry::Registry;
use crate::workflow::{Payload, RunId};

/// Executable activity code.
pub trait Activity: Send + Sync {
    fn execute(&self, ctx: &ActivityContext, input: Payload) -> Result<Payload, ActivityError>;
}

struct FnActivity<F>(F);

impl<F> Activity for FnActivity<F>
where
    F: Fn(&ActivityContext, Payload) -> Result<Payload, ActivityError> + Send + Sync,
{
    fn execute(&self, ctx: &ActivityContext, input: Payload) -> Result<Payload, ActivityError> {
        (self.0)(ctx, input)
    }
}

/// Wraps a function as an [`Activity`].
pub fn activity_fn<F>(f: F) -> impl Activity
where
    F: Fn(&ActivityContext, Payload) -> Result<Payload, ActivityError> + Send + Sync,
{
    FnActivity(f)
}

/// Outcome of one activity attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityReport {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub seq: u64,
    pub attempt: u32,
    pub result: Result<Payload, Failure>,
}

/// Executes activity tasks against a registry.
#[derive(Clone)]
pub struct ActivityExecutor {
    registry: Arc<Registry>,
}

impl ActivityExecutor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Runs a single attempt of `task`.
    pub fn execute(&self, task: &ActivityTask, sink: Arc<dyn HeartbeatSink>) -> ActivityReport {
        let result = self.run_attempt(task, sink);
        ActivityReport {
            task_id: task.task_id.clone(),
            run_id: task.run_id.clone(),
            seq: task.seq,
            attempt: task.attempt,
            result,
        }
    }

    fn run_attempt(
        &self,
        task: &ActivityTask,
        sink: Arc<dyn HeartbeatSink>,
    ) -> Result<Payload, Failure> {
        let registered = self.registry.activity(&task.activity_type).ok_or_else(|| {
            Failure::unsupported_type(format!(
                "activity type '{}' is not registered",
                task.activity_type
            ))
            .with_attempts(task.attempt)
        })?;

        let ctx = ActivityContext::new(
            ActivityInfo {
                task_id: task.task_id.clone(),
                activity_type: task.activity_type.clone(),
                workflow_id: task.workflow_id.clone(),
                run_id: task.run_id.clone(),
                seq: task.seq,
                attempt: task.attempt,
                task_queue: task.task_queue.clone(),
            },
            sink,
        );

        debug!(
            "Executing activity '{}' ({}) attempt {}",
            task.activity_type, task.task_id, task.attempt
        );
        let started = Instant::now();

        let activity = Arc::clone(&registered.activity);
        let input = task.input.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| activity.execute(&ctx, input)));

        match outcome {
            Ok(Ok(result)) => {
                info!(
                    "Activity '{}' ({}) completed in {:.2?}",
                    task.activity_type,
                    task.task_id,
                    started.elapsed()
                );
                Ok(result)
            }
            Ok(Err(err)) => {
                warn!(
                    "Activity '{}' ({}) attempt {} failed: {}",
                    task.activity_type, task.task_id, task.attempt, err
                );
                Err(err.into_failure(task.attempt))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "activity panicked".to_string());
                warn!(
                    "Activity '{}' ({}) panicked: {}",
                    task.activity_type, task.task_id, message
                );
                Err(Failure::activity_execution(format!("panic: {}", message))
                    .with_attempts(task.attempt))
            }
        }
    }
}
