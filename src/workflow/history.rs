//! Workflow History
//!
//! The append-only event log that is the single source of truth for a
//! workflow run. Execution state is a fold over these events and replay
//! reads command results from them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{ParentLink, Payload, RunId};
use crate::activity::ActivityOptions;
use crate::error::Failure;

/// Result of a resolved command as seen by workflow code.
pub type CommandResult = Result<Payload, Failure>;

/// The kind of command a sequence number was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Activity,
    ChildWorkflow,
    Timer,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activity => write!(f, "activity"),
            Self::ChildWorkflow => write!(f, "child workflow"),
            Self::Timer => write!(f, "timer"),
        }
    }
}

/// A command as recorded in history, used to match replayed commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub kind: CommandKind,
    pub name: String,
}

impl fmt::Display for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// A single history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HistoryEvent {
    WorkflowStarted {
        workflow_type: String,
        workflow_id: String,
        task_queue: String,
        input: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        memo: BTreeMap<String, Payload>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        search_attributes: BTreeMap<String, Payload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_deadline: Option<DateTime<Utc>>,
    },
    ActivityScheduled {
        seq: u64,
        activity_type: String,
        task_queue: String,
        input: Payload,
        options: ActivityOptions,
    },
    ActivityCompleted {
        seq: u64,
        result: Payload,
    },
    ActivityFailed {
        seq: u64,
        failure: Failure,
    },
    /// A failed attempt is being retried as `attempt`
    ActivityRetryScheduled {
        seq: u64,
        attempt: u32,
    },
    ChildWorkflowScheduled {
        seq: u64,
        workflow_type: String,
        workflow_id: String,
        task_queue: String,
        input: Payload,
    },
    ChildWorkflowStarted {
        seq: u64,
        run_id: RunId,
    },
    ChildWorkflowCompleted {
        seq: u64,
        result: Payload,
    },
    ChildWorkflowFailed {
        seq: u64,
        failure: Failure,
    },
    TimerStarted {
        seq: u64,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        seq: u64,
    },
    CancelRequested {
        reason: String,
    },
    WorkflowCompleted {
        result: Payload,
    },
    WorkflowFailed {
        failure: Failure,
    },
    WorkflowTimedOut {
        failure: Failure,
    },
    WorkflowCancelled {
        reason: String,
    },
}

impl HistoryEvent {
    /// Returns the command this event schedules, if any.
    pub fn scheduled_command(&self) -> Option<(u64, CommandRecord)> {
        match self {
            Self::ActivityScheduled {
                seq, activity_type, ..
            } => Some((
                *seq,
                CommandRecord {
                    kind: CommandKind::Activity,
                    name: activity_type.clone(),
                },
            )),
            Self::ChildWorkflowScheduled {
                seq, workflow_type, ..
            } => Some((
                *seq,
                CommandRecord {
                    kind: CommandKind::ChildWorkflow,
                    name: workflow_type.clone(),
                },
            )),
            Self::TimerStarted { seq, .. } => Some((
                *seq,
                CommandRecord {
                    kind: CommandKind::Timer,
                    name: "timer".to_string(),
                },
            )),
            _ => None,
        }
    }

    /// Returns the sequence number and result if this event resolves a command.
    pub fn resolution(&self) -> Option<(u64, CommandResult)> {
        match self {
            Self::ActivityCompleted { seq, result } | Self::ChildWorkflowCompleted { seq, result } => {
                Some((*seq, Ok(result.clone())))
            }
            Self::ActivityFailed { seq, failure } | Self::ChildWorkflowFailed { seq, failure } => {
                Some((*seq, Err(failure.clone())))
            }
            Self::TimerFired { seq } => Some((*seq, Ok(Payload::Null))),
            _ => None,
        }
    }

    /// Returns true for events that close the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowTimedOut { .. }
                | Self::WorkflowCancelled { .. }
        )
    }

    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "WorkflowStarted",
            Self::ActivityScheduled { .. } => "ActivityScheduled",
            Self::ActivityCompleted { .. } => "ActivityCompleted",
            Self::ActivityFailed { .. } => "ActivityFailed",
            Self::ActivityRetryScheduled { .. } => "ActivityRetryScheduled",
            Self::ChildWorkflowScheduled { .. } => "ChildWorkflowScheduled",
            Self::ChildWorkflowStarted { .. } => "ChildWorkflowStarted",
            Self::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            Self::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::TimerFired { .. } => "TimerFired",
            Self::CancelRequested { .. } => "CancelRequested",
            Self::WorkflowCompleted { .. } => "WorkflowCompleted",
            Self::WorkflowFailed { .. } => "WorkflowFailed",
            Self::WorkflowTimedOut { .. } => "WorkflowTimedOut",
            Self::WorkflowCancelled { .. } => "WorkflowCancelled",
        }
    }
}

/// An event with its position and recording time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// 1-based, contiguous position in the history
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub event: HistoryEvent,
}

/// Ordered, append-only event log of one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHistory {
    entries: Vec<HistoryEntry>,
}

impl WorkflowHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a history from stored entries, checking event ids are contiguous.
    pub fn from_entries(entries: Vec<HistoryEntry>) -> Result<Self, String> {
        for (index, entry) in entries.iter().enumerate() {
            let expected = index as u64 + 1;
            if entry.event_id != expected {
                return Err(format!(
                    "expected event id {} at position {}, found {}",
                    expected, index, entry.event_id
                ));
            }
        }
        Ok(Self { entries })
    }

    /// Builds the entry that would be appended next, without appending it.
    pub fn next_entry(&self, event: HistoryEvent, timestamp: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            event_id: self.entries.len() as u64 + 1,
            timestamp,
            event,
        }
    }

    pub(crate) fn push_entry(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.entries.iter().map(|e| &e.event)
    }

    /// Returns the command recorded for `seq`.
    pub fn scheduled_command(&self, seq: u64) -> Option<CommandRecord> {
        self.events()
            .filter_map(HistoryEvent::scheduled_command)
            .find(|(s, _)| *s == seq)
            .map(|(_, record)| record)
    }

    /// Returns the recorded result for `seq`, if it has resolved.
    pub fn resolution(&self, seq: u64) -> Option<CommandResult> {
        self.events()
            .filter_map(HistoryEvent::resolution)
            .find(|(s, _)| *s == seq)
            .map(|(_, result)| result)
    }

    pub fn is_resolved(&self, seq: u64) -> bool {
        self.resolution(seq).is_some()
    }

    /// Highest command sequence number recorded, if any command was issued.
    pub fn highest_seq(&self) -> Option<u64> {
        self.events()
            .filter_map(HistoryEvent::scheduled_command)
            .map(|(seq, _)| seq)
            .max()
    }

    /// Sequence numbers of scheduled commands that have not resolved.
    pub fn unresolved(&self) -> Vec<u64> {
        let mut pending: Vec<u64> = self
            .events()
            .filter_map(HistoryEvent::scheduled_command)
            .map(|(seq, _)| seq)
            .collect();
        pending.retain(|seq| !self.is_resolved(*seq));
        pending
    }

    /// Attempt number the activity for `seq` is currently on.
    pub fn activity_attempt(&self, seq: u64) -> u32 {
        self.events()
            .filter_map(|event| match event {
                HistoryEvent::ActivityRetryScheduled { seq: s, attempt } if *s == seq => Some(*attempt),
                _ => None,
            })
            .last()
            .unwrap_or(1)
    }

    /// Reason of the first cancellation request, if one was recorded.
    pub fn cancel_requested(&self) -> Option<&str> {
        self.events().find_map(|event| match event {
            HistoryEvent::CancelRequested { reason } => Some(reason.as_str()),
            _ => None,
        })
    }

    /// Run id of the child started for command `seq`.
    pub fn child_run(&self, seq: u64) -> Option<&RunId> {
        self.events().find_map(|event| match event {
            HistoryEvent::ChildWorkflowStarted { seq: s, run_id } if *s == seq => Some(run_id),
            _ => None,
        })
    }

    /// All child runs started from this history, with their command seq.
    pub fn child_runs(&self) -> Vec<(u64, RunId)> {
        self.events()
            .filter_map(|event| match event {
                HistoryEvent::ChildWorkflowStarted { seq, run_id } => Some((*seq, run_id.clone())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn history_with(events: Vec<HistoryEvent>) -> WorkflowHistory {
        let mut history = WorkflowHistory::new();
        let now = Utc::now();
        for event in events {
            let entry = history.next_entry(event, now);
            history.push_entry(entry);
        }
        history
    }

    fn scheduled(seq: u64, name: &str) -> HistoryEvent {
        HistoryEvent::ActivityScheduled {
            seq,
            activity_type: name.to_string(),
            task_queue: "q".to_string(),
            input: json!(null),
            options: ActivityOptions::default(),
        }
    }

    #[test]
    fn test_event_ids_are_contiguous() {
        let history = history_with(vec![scheduled(0, "a"), scheduled(1, "b")]);
        let ids: Vec<u64> = history.entries().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_from_entries_rejects_gaps() {
        let mut entries = history_with(vec![scheduled(0, "a"), scheduled(1, "b")])
            .entries()
            .to_vec();
        entries[1].event_id = 5;
        assert!(WorkflowHistory::from_entries(entries).is_err());
    }

    #[test]
    fn test_resolution_lookup() {
        let history = history_with(vec![
            scheduled(0, "a"),
            scheduled(1, "b"),
            HistoryEvent::ActivityCompleted {
                seq: 1,
                result: json!(2.0),
            },
            HistoryEvent::ActivityFailed {
                seq: 0,
                failure: Failure::activity_execution("x"),
            },
        ]);

        assert_eq!(history.resolution(1), Some(Ok(json!(2.0))));
        match history.resolution(0) {
            Some(Err(failure)) => assert_eq!(failure.kind, ErrorKind::ActivityExecution),
            other => panic!("unexpected resolution {:?}", other),
        }
        assert!(history.unresolved().is_empty());
        assert_eq!(history.highest_seq(), Some(1));
    }

    #[test]
    fn test_activity_attempt_follows_retries() {
        let history = history_with(vec![
            scheduled(0, "a"),
            scheduled(1, "b"),
            HistoryEvent::ActivityRetryScheduled { seq: 0, attempt: 2 },
            HistoryEvent::ActivityRetryScheduled { seq: 0, attempt: 3 },
        ]);

        assert_eq!(history.activity_attempt(0), 3);
        assert_eq!(history.activity_attempt(1), 1);
        assert_eq!(history.resolution(0), None);
        assert_eq!(history.unresolved(), vec![0, 1]);
    }

    #[test]
    fn test_scheduled_command_record() {
        let history = history_with(vec![
            scheduled(0, "sqrt_activity"),
            HistoryEvent::TimerStarted {
                seq: 1,
                fire_at: Utc::now(),
            },
        ]);

        let record = history.scheduled_command(0).unwrap();
        assert_eq!(record.kind, CommandKind::Activity);
        assert_eq!(record.name, "sqrt_activity");
        assert_eq!(history.scheduled_command(1).unwrap().kind, CommandKind::Timer);
        assert!(history.scheduled_command(2).is_none());
        assert_eq!(history.unresolved(), vec![0, 1]);
    }

    #[test]
    fn test_timer_fired_resolves_to_null() {
        let history = history_with(vec![
            HistoryEvent::TimerStarted {
                seq: 0,
                fire_at: Utc::now(),
            },
            HistoryEvent::TimerFired { seq: 0 },
        ]);
        assert_eq!(history.resolution(0), Some(Ok(Payload::Null)));
    }

    #[test]
    fn test_cancel_requested_and_child_runs() {
        let history = history_with(vec![
            HistoryEvent::ChildWorkflowScheduled {
                seq: 0,
                workflow_type: "Child".into(),
                workflow_id: "c".into(),
                task_queue: "q".into(),
                input: json!({}),
            },
            HistoryEvent::ChildWorkflowStarted {
                seq: 0,
                run_id: RunId::new("r1"),
            },
            HistoryEvent::CancelRequested {
                reason: "operator".into(),
            },
        ]);

        assert_eq!(history.cancel_requested(), Some("operator"));
        assert_eq!(history.child_run(0), Some(&RunId::new("r1")));
        assert_eq!(history.child_runs().len(), 1);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = HistoryEvent::TimerFired { seq: 3 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TimerFired");
        assert_eq!(json["seq"], 3);
    }
}
