//! Workflow Context
//!
//! The only way workflow code interacts with the outside world. Every call
//! that has an effect becomes a numbered command:
//! - If history already records that command, the call is matched against
//!   it and its recorded result is used
//! - Otherwise a new command is emitted for the scheduler to carry out
//!
//! Waiting on an unresolved command short-circuits the workflow code with
//! [`Interrupt::Suspended`]; the next workflow task replays it from the
//! start with more history.

use std::time::Duration;

use serde::Serialize;

use super::history::{CommandKind, CommandResult};
use super::model::{Payload, RunId, WorkflowExecution};
use crate::activity::ActivityCall;
use crate::error::Failure;

/// Why workflow code stopped before returning a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// Waiting on at least one unresolved command
    Suspended,
    /// A cancellation request was observed
    Cancelled(String),
    /// The workflow failed
    Failed(Failure),
    /// Replay issued a command that contradicts history
    Nondeterminism(String),
}

impl From<Failure> for Interrupt {
    fn from(failure: Failure) -> Self {
        Self::Failed(failure)
    }
}

impl From<serde_json::Error> for Interrupt {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(Failure::workflow(format!("payload conversion failed: {}", err)))
    }
}

pub type WorkflowResult = Result<Payload, Interrupt>;

/// A new command emitted during replay.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleActivity {
        seq: u64,
        call: ActivityCall,
    },
    StartChildWorkflow {
        seq: u64,
        workflow_type: String,
        workflow_id: String,
        task_queue: String,
        input: Payload,
    },
    StartTimer {
        seq: u64,
        duration: Duration,
    },
}

impl Command {
    pub fn seq(&self) -> u64 {
        match self {
            Self::ScheduleActivity { seq, .. }
            | Self::StartChildWorkflow { seq, .. }
            | Self::StartTimer { seq, .. } => *seq,
        }
    }
}

/// Refers to an issued command; redeem with [`WorkflowContext::join_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle {
    seq: u64,
}

impl CommandHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// A child workflow invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildWorkflowCall {
    pub workflow_type: String,
    pub input: Payload,

    /// Defaults to `{parent workflow id}-{seq}`
    pub workflow_id: Option<String>,

    /// Defaults to the parent's task queue
    pub task_queue: Option<String>,
}

impl ChildWorkflowCall {
    pub fn new(workflow_type: impl Into<String>, input: Payload) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            input,
            workflow_id: None,
            task_queue: None,
        }
    }

    pub fn with_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }
}

/// Replay-time handle given to workflow code.
pub struct WorkflowContext<'a> {
    execution: &'a WorkflowExecution,
    next_seq: u64,
    commands: Vec<Command>,
}

impl<'a> WorkflowContext<'a> {
    pub fn new(execution: &'a WorkflowExecution) -> Self {
        Self {
            execution,
            next_seq: 0,
            commands: Vec::new(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.execution.workflow_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.execution.run_id
    }

    pub fn task_queue(&self) -> &str {
        &self.execution.task_queue
    }

    pub fn memo(&self, key: &str) -> Option<&Payload> {
        self.execution.memo.get(key)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// True while the code is re-walking commands already in history.
    ///
    /// Useful to keep logging from repeating on every replay.
    pub fn is_replaying(&self) -> bool {
        self.execution
            .history()
            .highest_seq()
            .map_or(false, |highest| self.next_seq <= highest)
    }

    fn cancel_reason(&self) -> Option<&str> {
        self.execution.history().cancel_requested()
    }

    fn issue(
        &mut self,
        kind: CommandKind,
        name: &str,
        build: impl FnOnce(u64) -> Command,
    ) -> Result<CommandHandle, Interrupt> {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(recorded) = self.execution.history().scheduled_command(seq) {
            if recorded.kind != kind || recorded.name != name {
                return Err(Interrupt::Nondeterminism(format!(
                    "command {} is {} in history but replay issued {} '{}'",
                    seq, recorded, kind, name
                )));
            }
            return Ok(CommandHandle { seq });
        }

        if let Some(reason) = self.cancel_reason() {
            return Err(Interrupt::Cancelled(reason.to_string()));
        }

        self.commands.push(build(seq));
        Ok(CommandHandle { seq })
    }

    /// Issues an activity command without waiting for it.
    pub fn schedule_activity(&mut self, call: ActivityCall) -> Result<CommandHandle, Interrupt> {
        let name = call.activity_type.clone();
        self.issue(CommandKind::Activity, &name, move |seq| Command::ScheduleActivity {
            seq,
            call,
        })
    }

    /// Issues a child workflow command without waiting for it.
    pub fn schedule_child_workflow(
        &mut self,
        call: ChildWorkflowCall,
    ) -> Result<CommandHandle, Interrupt> {
        let parent_id = self.execution.workflow_id.clone();
        let parent_queue = self.execution.task_queue.clone();
        let name = call.workflow_type.clone();

        self.issue(CommandKind::ChildWorkflow, &name, move |seq| {
            Command::StartChildWorkflow {
                seq,
                workflow_type: call.workflow_type,
                workflow_id: call
                    .workflow_id
                    .unwrap_or_else(|| format!("{}-{}", parent_id, seq)),
                task_queue: call.task_queue.unwrap_or(parent_queue),
                input: call.input,
            }
        })
    }

    /// Issues a durable timer command.
    pub fn start_timer(&mut self, duration: Duration) -> Result<CommandHandle, Interrupt> {
        self.issue(CommandKind::Timer, "timer", move |seq| Command::StartTimer {
            seq,
            duration,
        })
    }

    /// Recorded result of a command, if it has resolved.
    pub fn result(&self, handle: CommandHandle) -> Option<CommandResult> {
        self.execution.history().resolution(handle.seq)
    }

    /// Waits for every handle to resolve.
    ///
    /// Results come back in the order of `handles`, never in completion
    /// order. Suspends (or reports cancellation) while any is unresolved.
    pub fn join_all(&self, handles: &[CommandHandle]) -> Result<Vec<CommandResult>, Interrupt> {
        let results: Option<Vec<CommandResult>> =
            handles.iter().map(|handle| self.result(*handle)).collect();

        match results {
            Some(results) => Ok(results),
            None => match self.cancel_reason() {
                Some(reason) => Err(Interrupt::Cancelled(reason.to_string())),
                None => Err(Interrupt::Suspended),
            },
        }
    }

    fn join_one(&self, handle: CommandHandle) -> Result<Payload, Interrupt> {
        self.join_all(&[handle])?
            .pop()
            .unwrap_or(Ok(Payload::Null))
            .map_err(Interrupt::Failed)
    }

    /// Runs an activity and waits for its result.
    ///
    /// A terminal activity failure comes back as [`Interrupt::Failed`] so it
    /// fails the workflow when propagated with `?`, or can be matched.
    pub fn execute_activity(&mut self, call: ActivityCall) -> Result<Payload, Interrupt> {
        let handle = self.schedule_activity(call)?;
        self.join_one(handle)
    }

    /// Runs a child workflow and waits for its result.
    pub fn execute_child_workflow(&mut self, call: ChildWorkflowCall) -> Result<Payload, Interrupt> {
        let handle = self.schedule_child_workflow(call)?;
        self.join_one(handle)
    }

    /// Durable sleep.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let handle = self.start_timer(duration)?;
        self.join_one(handle).map(|_| ())
    }

    /// Fails the workflow with an application error.
    pub fn fail(&self, message: impl Into<String>) -> Interrupt {
        Interrupt::Failed(Failure::workflow(message))
    }

    pub(crate) fn into_commands(self) -> (Vec<Command>, u64) {
        (self.commands, self.next_seq)
    }
}

/// Serializes a workflow return value.
pub fn to_payload(value: impl Serialize) -> WorkflowResult {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityOptions;
    use crate::workflow::history::HistoryEvent;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn execution(events: Vec<HistoryEvent>) -> WorkflowExecution {
        let started = HistoryEvent::WorkflowStarted {
            workflow_type: "Test".into(),
            workflow_id: "wf".into(),
            task_queue: "main".into(),
            input: json!(null),
            parent: None,
            memo: BTreeMap::new(),
            search_attributes: BTreeMap::new(),
            execution_deadline: None,
        };
        let mut execution = WorkflowExecution::start(RunId::new("r"), started, Utc::now()).unwrap();
        for entry in execution.prepare(events, Utc::now()).unwrap() {
            execution.commit(entry).unwrap();
        }
        execution
    }

    fn scheduled(seq: u64, name: &str) -> HistoryEvent {
        HistoryEvent::ActivityScheduled {
            seq,
            activity_type: name.into(),
            task_queue: "main".into(),
            input: json!(null),
            options: ActivityOptions::default(),
        }
    }

    #[test]
    fn test_new_commands_are_numbered_in_order() {
        let execution = execution(vec![]);
        let mut ctx = WorkflowContext::new(&execution);

        let a = ctx.schedule_activity(ActivityCall::new("a", json!(1))).unwrap();
        let b = ctx.start_timer(Duration::from_secs(1)).unwrap();
        assert_eq!((a.seq(), b.seq()), (0, 1));
        assert_eq!(ctx.join_all(&[a, b]), Err(Interrupt::Suspended));

        let (commands, issued) = ctx.into_commands();
        assert_eq!(issued, 2);
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[1], Command::StartTimer { seq: 1, .. }));
    }

    #[test]
    fn test_recorded_commands_are_not_reissued() {
        let execution = execution(vec![
            scheduled(0, "a"),
            HistoryEvent::ActivityCompleted {
                seq: 0,
                result: json!(7),
            },
        ]);
        let mut ctx = WorkflowContext::new(&execution);

        assert!(ctx.is_replaying());
        let value = ctx.execute_activity(ActivityCall::new("a", json!(1))).unwrap();
        assert_eq!(value, json!(7));
        assert!(!ctx.is_replaying());
        assert!(ctx.into_commands().0.is_empty());
    }

    #[test]
    fn test_mismatched_command_is_nondeterminism() {
        let execution = execution(vec![scheduled(0, "a")]);
        let mut ctx = WorkflowContext::new(&execution);

        let result = ctx.schedule_activity(ActivityCall::new("b", json!(1)));
        assert!(matches!(result, Err(Interrupt::Nondeterminism(_))));

        let mut ctx = WorkflowContext::new(&execution);
        let result = ctx.start_timer(Duration::from_secs(1));
        assert!(matches!(result, Err(Interrupt::Nondeterminism(_))));
    }

    #[test]
    fn test_join_preserves_issuance_order() {
        let execution = execution(vec![
            scheduled(0, "a"),
            scheduled(1, "a"),
            scheduled(2, "a"),
            HistoryEvent::ActivityCompleted {
                seq: 2,
                result: json!("third"),
            },
            HistoryEvent::ActivityCompleted {
                seq: 0,
                result: json!("first"),
            },
            HistoryEvent::ActivityCompleted {
                seq: 1,
                result: json!("second"),
            },
        ]);
        let mut ctx = WorkflowContext::new(&execution);
        let handles: Vec<CommandHandle> = (0..3)
            .map(|_| ctx.schedule_activity(ActivityCall::new("a", json!(null))).unwrap())
            .collect();

        let results: Vec<Payload> = ctx
            .join_all(&handles)
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(results, vec![json!("first"), json!("second"), json!("third")]);
    }

    #[test]
    fn test_activity_failure_surfaces_as_failed_interrupt() {
        let execution = execution(vec![
            scheduled(0, "a"),
            HistoryEvent::ActivityFailed {
                seq: 0,
                failure: Failure::invalid_input("bad path"),
            },
        ]);
        let mut ctx = WorkflowContext::new(&execution);
        match ctx.execute_activity(ActivityCall::new("a", json!(null))) {
            Err(Interrupt::Failed(failure)) => {
                assert_eq!(failure.kind, crate::error::ErrorKind::InvalidInput)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancellation_blocks_new_commands() {
        let execution = execution(vec![
            scheduled(0, "a"),
            HistoryEvent::CancelRequested {
                reason: "operator".into(),
            },
        ]);
        let mut ctx = WorkflowContext::new(&execution);

        let handle = ctx.schedule_activity(ActivityCall::new("a", json!(null))).unwrap();
        assert_eq!(
            ctx.join_all(&[handle]),
            Err(Interrupt::Cancelled("operator".into()))
        );
        assert_eq!(
            ctx.start_timer(Duration::from_secs(1)),
            Err(Interrupt::Cancelled("operator".into()))
        );
        assert!(ctx.into_commands().0.is_empty());
    }

    #[test]
    fn test_child_workflow_defaults() {
        let execution = execution(vec![]);
        let mut ctx = WorkflowContext::new(&execution);
        ctx.schedule_child_workflow(ChildWorkflowCall::new("Child", json!(1)))
            .unwrap();
        ctx.schedule_child_workflow(
            ChildWorkflowCall::new("Child", json!(2))
                .with_id("wf-ingestion")
                .with_task_queue("ingestion-task-queue"),
        )
        .unwrap();

        let (commands, _) = ctx.into_commands();
        match &commands[0] {
            Command::StartChildWorkflow {
                workflow_id,
                task_queue,
                ..
            } => {
                assert_eq!(workflow_id, "wf-0");
                assert_eq!(task_queue, "main");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &commands[1] {
            Command::StartChildWorkflow {
                workflow_id,
                task_queue,
                ..
            } => {
                assert_eq!(workflow_id, "wf-ingestion");
                assert_eq!(task_queue, "ingestion-task-queue");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
