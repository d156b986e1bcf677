//! Task Types
//!
//! Units of work handed from the scheduler to workers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityOptions;
use crate::workflow::{Payload, RunId};

/// Stable task identity used for leasing, acking and deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Workflow task for a run at a given history length.
    ///
    /// Tasks raised for the same history collapse into one queue entry.
    pub fn workflow(run_id: &RunId, history_len: usize) -> Self {
        Self(format!("{}/wf@{}", run_id, history_len))
    }

    /// One attempt of the activity issued as command `seq`.
    pub fn activity(run_id: &RunId, seq: u64, attempt: u32) -> Self {
        Self(format!("{}#{}.{}", run_id, seq, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to replay and advance a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTask {
    pub workflow_id: String,
    pub run_id: RunId,
}

/// One attempt of an activity command.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTask {
    pub task_id: TaskId,
    pub workflow_id: String,
    pub run_id: RunId,

    /// Command sequence number in the owning run
    pub seq: u64,
    pub activity_type: String,
    pub task_queue: String,
    pub input: Payload,

    /// 1-based attempt counter
    pub attempt: u32,
    pub options: ActivityOptions,

    /// Set when a worker starts the attempt
    pub start_to_close_deadline: Option<DateTime<Utc>>,

    /// Reset by each heartbeat; only set when a heartbeat timeout is configured
    pub heartbeat_deadline: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
}

impl ActivityTask {
    /// The same logical task for the following attempt.
    pub fn next_attempt(&self, scheduled_at: DateTime<Utc>) -> Self {
        let attempt = self.attempt + 1;
        Self {
            task_id: TaskId::activity(&self.run_id, self.seq, attempt),
            attempt,
            start_to_close_deadline: None,
            heartbeat_deadline: None,
            scheduled_at,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Workflow(WorkflowTask),
    Activity(ActivityTask),
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
}

impl Task {
    pub fn workflow(id: TaskId, task: WorkflowTask) -> Self {
        Self {
            id,
            kind: TaskKind::Workflow(task),
        }
    }

    pub fn activity(task: ActivityTask) -> Self {
        Self {
            id: task.task_id.clone(),
            kind: TaskKind::Activity(task),
        }
    }

    pub fn run_id(&self) -> &RunId {
        match &self.kind {
            TaskKind::Workflow(task) => &task.run_id,
            TaskKind::Activity(task) => &task.run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_ids() {
        let run = RunId::new("wf-1.r1");
        assert_eq!(TaskId::workflow(&run, 3).as_str(), "wf-1.r1/wf@3");
        assert_eq!(TaskId::activity(&run, 4, 2).as_str(), "wf-1.r1#4.2");
    }

    #[test]
    fn test_next_attempt_gets_new_id() {
        let run_id = RunId::new("r");
        let now = Utc::now();
        let first = ActivityTask {
            task_id: TaskId::activity(&run_id, 7, 1),
            workflow_id: "wf".into(),
            run_id,
            seq: 7,
            activity_type: "a".into(),
            task_queue: "q".into(),
            input: json!(1),
            attempt: 1,
            options: ActivityOptions::default(),
            start_to_close_deadline: Some(now),
            heartbeat_deadline: Some(now),
            scheduled_at: now,
        };

        let second = first.next_attempt(now);
        assert_eq!(second.attempt, 2);
        assert_ne!(second.task_id, first.task_id);
        assert_eq!(second.seq, 7);
        assert!(second.start_to_close_deadline.is_none());
        assert!(second.heartbeat_deadline.is_none());
        assert_eq!(Task::activity(second).run_id(), &RunId::new("r"));
    }
}
