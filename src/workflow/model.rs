//! Workflow Execution Model
//!
//! Identity, status and derived state of a workflow run.
//!
//! A [`WorkflowExecution`] is never mutated directly: every change goes
//! through a [`HistoryEntry`], so rebuilding an execution from its stored
//! history always yields the same state as the live one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::history::{HistoryEntry, HistoryEvent, WorkflowHistory};
use crate::error::{EngineError, Failure};

/// Opaque workflow and activity payload.
pub type Payload = serde_json::Value;

/// Identity of a single run of a workflow id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a run. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Links a child run to the parent command awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub workflow_id: String,
    pub run_id: RunId,

    /// The parent's pending command slot
    pub seq: u64,
}

/// Result of a query against a workflow id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkflowOutcome {
    Running,
    Completed(Payload),
    Failed(Failure),
    TimedOut(Failure),
    Cancelled(String),
}

impl WorkflowOutcome {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// The failure a parent receives for this outcome, if it is not a success.
    pub fn to_failure(&self) -> Option<Failure> {
        match self {
            Self::Failed(failure) | Self::TimedOut(failure) => Some(failure.clone()),
            Self::Cancelled(reason) => Some(Failure::cancelled(reason.clone())),
            Self::Running | Self::Completed(_) => None,
        }
    }
}

/// Summary returned by `describe`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub run_id: RunId,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: ExecutionStatus,
    pub parent: Option<ParentLink>,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub history_length: usize,
    pub pending_commands: usize,
    pub halted: Option<String>,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A workflow run: a fold over its history.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: RunId,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Payload,
    pub status: ExecutionStatus,

    /// Commands issued and not yet resolved, by sequence number
    pub pending: BTreeSet<u64>,
    pub parent: Option<ParentLink>,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub execution_deadline: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
    pub failure: Option<Failure>,
    pub cancel_requested: Option<String>,

    /// Set when replay diverged from history; cleared by an operator
    pub halted: Option<String>,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    history: WorkflowHistory,
}

impl WorkflowExecution {
    /// Rebuilds an execution by folding its history.
    ///
    /// The first entry must be `WorkflowStarted`.
    pub fn from_history(run_id: RunId, entries: Vec<HistoryEntry>) -> Result<Self, EngineError> {
        let corrupt = |message: String| EngineError::CorruptHistory {
            run_id: run_id.to_string(),
            message,
        };

        let history = WorkflowHistory::from_entries(entries).map_err(corrupt)?;
        let first = history
            .entries()
            .first()
            .ok_or_else(|| corrupt("history is empty".to_string()))?;

        let mut execution = match &first.event {
            HistoryEvent::WorkflowStarted {
                workflow_type,
                workflow_id,
                task_queue,
                input,
                parent,
                memo,
                search_attributes,
                execution_deadline,
            } => Self {
                workflow_id: workflow_id.clone(),
                run_id: run_id.clone(),
                workflow_type: workflow_type.clone(),
                task_queue: task_queue.clone(),
                input: input.clone(),
                status: ExecutionStatus::Running,
                pending: BTreeSet::new(),
                parent: parent.clone(),
                memo: memo.clone(),
                search_attributes: search_attributes.clone(),
                execution_deadline: *execution_deadline,
                result: None,
                failure: None,
                cancel_requested: None,
                halted: None,
                started_at: first.timestamp,
                closed_at: None,
                history: WorkflowHistory::new(),
            },
            other => {
                return Err(corrupt(format!(
                    "first event is {}, expected WorkflowStarted",
                    other.name()
                )))
            }
        };

        for entry in history.entries() {
            execution.commit(entry.clone()).map_err(corrupt)?;
        }
        Ok(execution)
    }

    /// Starts a new execution from its `WorkflowStarted` event.
    pub fn start(run_id: RunId, started: HistoryEvent, now: DateTime<Utc>) -> Result<Self, EngineError> {
        let entry = WorkflowHistory::new().next_entry(started, now);
        Self::from_history(run_id, vec![entry])
    }

    pub fn history(&self) -> &WorkflowHistory {
        &self.history
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Builds entries for `events` without applying them.
    ///
    /// Fails if the run is closed or the batch would append past a
    /// terminal event.
    pub fn prepare(
        &self,
        events: Vec<HistoryEvent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::ExecutionClosed(self.workflow_id.clone()));
        }

        let mut closed = false;
        let mut entries = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            if closed {
                return Err(EngineError::ExecutionClosed(self.workflow_id.clone()));
            }
            closed = event.is_terminal();
            entries.push(HistoryEntry {
                event_id: self.history.len() as u64 + offset as u64 + 1,
                timestamp: now,
                event,
            });
        }
        Ok(entries)
    }

    /// Applies one entry to the derived state and appends it to history.
    pub fn commit(&mut self, entry: HistoryEntry) -> Result<(), String> {
        let expected = self.history.len() as u64 + 1;
        if entry.event_id != expected {
            return Err(format!(
                "expected event id {}, found {}",
                expected, entry.event_id
            ));
        }
        if self.is_closed() {
            return Err(format!(
                "{} recorded after the run closed",
                entry.event.name()
            ));
        }

        match &entry.event {
            HistoryEvent::WorkflowStarted { .. } => {
                if !self.history.is_empty() {
                    return Err("WorkflowStarted recorded twice".to_string());
                }
            }
            HistoryEvent::ActivityScheduled { seq, .. }
            | HistoryEvent::ChildWorkflowScheduled { seq, .. }
            | HistoryEvent::TimerStarted { seq, .. } => {
                if self.history.scheduled_command(*seq).is_some() {
                    return Err(format!("command {} scheduled twice", seq));
                }
                self.pending.insert(*seq);
            }
            HistoryEvent::ActivityRetryScheduled { seq, .. } => {
                if !self.pending.contains(seq) {
                    return Err(format!("retry of command {} which is not pending", seq));
                }
            }
            HistoryEvent::ChildWorkflowStarted { .. } => {}
            HistoryEvent::CancelRequested { reason } => {
                if self.cancel_requested.is_none() {
                    self.cancel_requested = Some(reason.clone());
                }
            }
            HistoryEvent::WorkflowCompleted { result } => {
                self.status = ExecutionStatus::Completed;
                self.result = Some(result.clone());
            }
            HistoryEvent::WorkflowFailed { failure } => {
                self.status = ExecutionStatus::Failed;
                self.failure = Some(failure.clone());
            }
            HistoryEvent::WorkflowTimedOut { failure } => {
                self.status = ExecutionStatus::TimedOut;
                self.failure = Some(failure.clone());
            }
            HistoryEvent::WorkflowCancelled { reason } => {
                self.status = ExecutionStatus::Cancelled;
                self.cancel_requested.get_or_insert_with(|| reason.clone());
            }
            resolution => {
                if let Some((seq, _)) = resolution.resolution() {
                    if !self.pending.remove(&seq) {
                        return Err(format!(
                            "{} for command {} which is not pending",
                            resolution.name(),
                            seq
                        ));
                    }
                }
            }
        }

        if entry.event.is_terminal() {
            self.closed_at = Some(entry.timestamp);
        }
        self.history.push_entry(entry);
        Ok(())
    }

    pub fn outcome(&self) -> WorkflowOutcome {
        match self.status {
            ExecutionStatus::Running => WorkflowOutcome::Running,
            ExecutionStatus::Completed => {
                WorkflowOutcome::Completed(self.result.clone().unwrap_or(Payload::Null))
            }
            ExecutionStatus::Failed => WorkflowOutcome::Failed(self.terminal_failure()),
            ExecutionStatus::TimedOut => WorkflowOutcome::TimedOut(self.terminal_failure()),
            ExecutionStatus::Cancelled => WorkflowOutcome::Cancelled(
                self.cancel_requested.clone().unwrap_or_default(),
            ),
        }
    }

    fn terminal_failure(&self) -> Failure {
        self.failure
            .clone()
            .unwrap_or_else(|| Failure::workflow("run closed without a recorded failure"))
    }

    pub fn info(&self) -> WorkflowInfo {
        WorkflowInfo {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            status: self.status,
            parent: self.parent.clone(),
            memo: self.memo.clone(),
            search_attributes: self.search_attributes.clone(),
            history_length: self.history.len(),
            pending_commands: self.pending.len(),
            halted: self.halted.clone(),
            started_at: self.started_at,
            closed_at: self.closed_at,
        }
    }
}
