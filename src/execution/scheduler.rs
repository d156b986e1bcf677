//! Orchestrator / Scheduler
//!
//! Owns everything shared between workers:
//! - The task queue and the history store
//! - Open executions, rebuilt from history on recovery; closed runs are
//!   archived to the store and read back on query
//! - In-flight activity attempts with their deadlines
//! - Durable timers and parent/child links
//!
//! Every history mutation goes through [`Scheduler::append_events`], which
//! persists before applying, so the store always holds at least what the
//! in-memory state reflects. Bookkeeping for a finished attempt or timer is
//! only dropped once its outcome is durable. Callers serialize access (one
//! writer at a time), which keeps each run's history strictly ordered.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::activity::{ActivityReport, Heartbeat};
use crate::clock::after;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Failure, TimeoutKind};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::queue::{ActivityTask, DeadLetter, FailOutcome, Task, TaskId, TaskQueue, WorkflowTask};
use crate::registry::{Registry, StartWorkflowRequest};
use crate::workflow::{
    Command, Decision, HistoryEntry, HistoryEvent, HistoryStore, ParentLink, Payload, ReplayOutcome,
    RunId, WorkflowEngine, WorkflowExecution, WorkflowInfo, WorkflowOutcome,
};

/// A workflow run plus one of its command sequence numbers.
type CommandKey = (RunId, u64);

#[derive(Debug, Clone)]
struct InFlightActivity {
    /// Current attempt; queued until a worker starts it
    task: ActivityTask,
    last_heartbeat: Option<Heartbeat>,
}

/// What one timeout sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out_activities: usize,
    pub fired_timers: usize,
    pub timed_out_workflows: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out_activities == 0 && self.fired_timers == 0 && self.timed_out_workflows == 0
    }
}

fn attempt_label(task: &ActivityTask) -> String {
    format!("{} {}", task.activity_type, task.task_id)
}

/// Counter suffix of a `{workflow_id}.{counter}` run id.
fn run_number(run_id: &RunId) -> Option<u64> {
    run_id.as_str().rsplit_once('.')?.1.parse().ok()
}

pub struct Scheduler {
    registry: Arc<Registry>,
    engine: WorkflowEngine,
    queue: TaskQueue,
    store: Box<dyn HistoryStore>,
    executions: HashMap<RunId, WorkflowExecution>,
    latest_runs: HashMap<String, RunId>,
    in_flight: BTreeMap<CommandKey, InFlightActivity>,
    timers: BTreeMap<CommandKey, DateTime<Utc>>,
    lease_duration: Duration,
    run_counter: u64,
    timeline: ExecutionTimeline,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, store: Box<dyn HistoryStore>, config: &EngineConfig) -> Self {
        Self {
            engine: WorkflowEngine::new(Arc::clone(&registry)),
            registry,
            queue: TaskQueue::with_max_deliveries(config.max_deliveries),
            store,
            executions: HashMap::new(),
            latest_runs: HashMap::new(),
            in_flight: BTreeMap::new(),
            timers: BTreeMap::new(),
            lease_duration: config.lease_duration,
            run_counter: 0,
            timeline: ExecutionTimeline::with_capacity(config.timeline_capacity),
        }
    }

    // ---- Dispatch ----

    /// Creates a run and its first workflow task.
    ///
    /// Type resolution and input validation happen first; a rejected
    /// request leaves no trace.
    pub fn start_execution(
        &mut self,
        request: StartWorkflowRequest,
        parent: Option<ParentLink>,
        now: DateTime<Utc>,
    ) -> Result<RunId, EngineError> {
        self.registry.prepare_start(&request)?;

        if let Some(run_id) = self.latest_runs.get(&request.workflow_id) {
            let open = self
                .executions
                .get(run_id)
                .map_or(false, |execution| !execution.is_closed());
            if open {
                return Err(EngineError::AlreadyStarted(request.workflow_id));
            }
        }

        let run_number = self.run_counter + 1;
        let run_id = RunId::new(format!("{}.{}", request.workflow_id, run_number));
        let started = HistoryEvent::WorkflowStarted {
            workflow_type: request.workflow_type.clone(),
            workflow_id: request.workflow_id.clone(),
            task_queue: request.task_queue.clone(),
            input: request.input,
            parent,
            memo: request.memo,
            search_attributes: request.search_attributes,
            execution_deadline: request.execution_timeout.map(|timeout| after(now, timeout)),
        };

        let execution = WorkflowExecution::start(run_id.clone(), started, now)?;
        self.store.append(&run_id, execution.history().entries())?;
        self.run_counter = run_number;

        info!(
            "Started workflow '{}' ({}) as run '{}' on '{}'",
            request.workflow_id, request.workflow_type, run_id, request.task_queue
        );
        self.latest_runs.insert(request.workflow_id, run_id.clone());
        self.executions.insert(run_id.clone(), execution);
        self.enqueue_workflow_task(&run_id, now);
        Ok(run_id)
    }

    /// Persists and applies events to a run, in order.
    fn append_events(
        &mut self,
        run_id: &RunId,
        events: Vec<HistoryEvent>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let execution = self
            .executions
            .get_mut(run_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(run_id.to_string()))?;

        let entries = execution.prepare(events, now)?;
        self.store.append(run_id, &entries)?;
        for entry in entries {
            debug!(
                "Run '{}' event {}: {}",
                run_id,
                entry.event_id,
                entry.event.name()
            );
            execution
                .commit(entry)
                .map_err(|message| EngineError::CorruptHistory {
                    run_id: run_id.to_string(),
                    message,
                })?;
        }

        if execution.is_closed() {
            self.on_closed(run_id, now)?;
            self.executions.remove(run_id);
            debug!("Archived run '{}'", run_id);
        }
        Ok(())
    }

    fn enqueue_workflow_task(&mut self, run_id: &RunId, now: DateTime<Utc>) {
        let Some(execution) = self.executions.get(run_id) else {
            return;
        };
        if execution.is_closed() || execution.halted.is_some() {
            return;
        }

        let task = Task::workflow(
            TaskId::workflow(run_id, execution.history().len()),
            WorkflowTask {
                workflow_id: execution.workflow_id.clone(),
                run_id: run_id.clone(),
            },
        );
        let queue = execution.task_queue.clone();
        self.queue.enqueue(&queue, task, now);
    }

    fn dispatch_activity(&mut self, task: ActivityTask, visible_at: DateTime<Utc>) {
        let key = (task.run_id.clone(), task.seq);
        let queue = task.task_queue.clone();
        self.queue.enqueue_at(&queue, Task::activity(task.clone()), visible_at);
        self.in_flight.insert(
            key,
            InFlightActivity {
                task,
                last_heartbeat: None,
            },
        );
    }

    /// Leases the next task on `queue`.
    pub fn dequeue(&mut self, queue: &str, now: DateTime<Utc>) -> Option<Task> {
        self.queue.dequeue(queue, self.lease_duration, now)
    }

    // ---- Workflow tasks ----

    /// Replays a run and carries out the resulting commands and decision.
    ///
    /// Nondeterminism (or a workflow type that is no longer registered)
    /// halts the run instead of failing it; it stays `Running` until
    /// [`Scheduler::resume_halted`].
    pub fn process_workflow_task(
        &mut self,
        id: &TaskId,
        task: &WorkflowTask,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let result = self.advance_workflow(id, task, now);
        match &result {
            Ok(()) => {
                self.queue.ack(id);
            }
            Err(err) => match self.queue.fail(id, &err.to_string(), now) {
                FailOutcome::DeadLettered => {
                    error!("Workflow task '{}' dead-lettered: {}", id, err)
                }
                _ => warn!("Workflow task '{}' failed, redelivering: {}", id, err),
            },
        }
        result
    }

    fn advance_workflow(
        &mut self,
        id: &TaskId,
        task: &WorkflowTask,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.executions.get(&task.run_id) else {
            debug!("Run '{}' is not open - dropping task '{}'", task.run_id, id);
            return Ok(());
        };
        if execution.is_closed() {
            debug!("Run '{}' already closed - skipping task '{}'", task.run_id, id);
            return Ok(());
        }
        if let Some(reason) = &execution.halted {
            warn!("Run '{}' is halted ({}) - skipping task '{}'", task.run_id, reason, id);
            return Ok(());
        }

        match self.engine.replay(execution) {
            Ok(outcome) => self.apply_outcome(&task.run_id, outcome, now),
            Err(err @ (EngineError::Nondeterminism { .. } | EngineError::UnsupportedType { .. })) => {
                error!(
                    "Halting workflow '{}' (run '{}'): {}. Fix the workflow code and resume it.",
                    task.workflow_id, task.run_id, err
                );
                if let Some(execution) = self.executions.get_mut(&task.run_id) {
                    execution.halted = Some(err.to_string());
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn apply_outcome(
        &mut self,
        run_id: &RunId,
        outcome: ReplayOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut resolved = false;
        for command in outcome.commands {
            resolved |= self.apply_command(run_id, command, now)?;
        }

        let terminal = match outcome.decision {
            Decision::Suspended => {
                if resolved {
                    self.enqueue_workflow_task(run_id, now);
                }
                return Ok(());
            }
            Decision::Completed(result) => HistoryEvent::WorkflowCompleted { result },
            Decision::Failed(failure) => {
                warn!("Run '{}' failed: {}", run_id, failure);
                HistoryEvent::WorkflowFailed { failure }
            }
            Decision::Cancelled(reason) => HistoryEvent::WorkflowCancelled { reason },
        };
        self.append_events(run_id, vec![terminal], now)
    }

    /// Records one new command and starts carrying it out.
    ///
    /// Returns true when the command resolved immediately (e.g. an
    /// unregistered activity type) and the run needs another workflow task.
    fn apply_command(
        &mut self,
        run_id: &RunId,
        command: Command,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let execution = self
            .executions
            .get(run_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(run_id.to_string()))?;
        let workflow_id = execution.workflow_id.clone();
        let workflow_queue = execution.task_queue.clone();

        match command {
            Command::ScheduleActivity { seq, call } => {
                match self.registry.resolve_activity_options(&call, &workflow_queue) {
                    Ok((task_queue, options)) => {
                        self.append_events(
                            run_id,
                            vec![HistoryEvent::ActivityScheduled {
                                seq,
                                activity_type: call.activity_type.clone(),
                                task_queue: task_queue.clone(),
                                input: call.input.clone(),
                                options: options.clone(),
                            }],
                            now,
                        )?;
                        self.dispatch_activity(
                            ActivityTask {
                                task_id: TaskId::activity(run_id, seq, 1),
                                workflow_id,
                                run_id: run_id.clone(),
                                seq,
                                activity_type: call.activity_type,
                                task_queue,
                                input: call.input,
                                attempt: 1,
                                options,
                                start_to_close_deadline: None,
                                heartbeat_deadline: None,
                                scheduled_at: now,
                            },
                            now,
                        );
                        Ok(false)
                    }
                    Err(failure) => {
                        warn!(
                            "Run '{}' cannot schedule activity '{}': {}",
                            run_id, call.activity_type, failure
                        );
                        self.append_events(
                            run_id,
                            vec![
                                HistoryEvent::ActivityScheduled {
                                    seq,
                                    activity_type: call.activity_type,
                                    task_queue: workflow_queue,
                                    input: call.input,
                                    options: call.options.unwrap_or_default(),
                                },
                                HistoryEvent::ActivityFailed { seq, failure },
                            ],
                            now,
                        )?;
                        Ok(true)
                    }
                }
            }
            Command::StartChildWorkflow {
                seq,
                workflow_type,
                workflow_id: child_id,
                task_queue,
                input,
            } => {
                self.append_events(
                    run_id,
                    vec![HistoryEvent::ChildWorkflowScheduled {
                        seq,
                        workflow_type: workflow_type.clone(),
                        workflow_id: child_id.clone(),
                        task_queue: task_queue.clone(),
                        input: input.clone(),
                    }],
                    now,
                )?;
                let request = StartWorkflowRequest::new(workflow_type, task_queue, child_id, input);
                self.start_child(run_id, seq, request, now)
            }
            Command::StartTimer { seq, duration } => {
                let fire_at = after(now, duration);
                self.append_events(run_id, vec![HistoryEvent::TimerStarted { seq, fire_at }], now)?;
                self.timers.insert((run_id.clone(), seq), fire_at);
                Ok(false)
            }
        }
    }

    /// Starts the child run for a parent's `ChildWorkflowScheduled` command.
    fn start_child(
        &mut self,
        parent_run: &RunId,
        seq: u64,
        request: StartWorkflowRequest,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let parent_id = self.execution(parent_run)?.workflow_id.clone();
        let workflow_type = request.workflow_type.clone();
        let link = ParentLink {
            workflow_id: parent_id,
            run_id: parent_run.clone(),
            seq,
        };

        match self.start_execution(request, Some(link), now) {
            Ok(child_run) => {
                self.append_events(
                    parent_run,
                    vec![HistoryEvent::ChildWorkflowStarted {
                        seq,
                        run_id: child_run,
                    }],
                    now,
                )?;
                Ok(false)
            }
            Err(err) => {
                warn!(
                    "Run '{}' could not start child '{}': {}",
                    parent_run, workflow_type, err
                );
                self.append_events(
                    parent_run,
                    vec![HistoryEvent::ChildWorkflowFailed {
                        seq,
                        failure: Failure::child_workflow(&workflow_type, err.to_failure()),
                    }],
                    now,
                )?;
                Ok(true)
            }
        }
    }

    // ---- Activity tasks ----

    /// Marks a dequeued activity attempt as started and arms its deadlines.
    ///
    /// Returns the task to execute, or `None` when the delivery is stale
    /// (superseded attempt, closed run) or a duplicate of a running attempt.
    pub fn activity_started(&mut self, task: &ActivityTask, now: DateTime<Utc>) -> Option<ActivityTask> {
        let key = (task.run_id.clone(), task.seq);
        let Some(current) = self.in_flight.get_mut(&key) else {
            debug!("Dropping stale activity task '{}'", task.task_id);
            self.queue.ack(&task.task_id);
            return None;
        };
        if current.task.task_id != task.task_id {
            debug!("Dropping superseded activity task '{}'", task.task_id);
            self.queue.ack(&task.task_id);
            return None;
        }
        if current.task.start_to_close_deadline.is_some() {
            debug!("Activity task '{}' is already running - skipping redelivery", task.task_id);
            return None;
        }

        let deadline = after(now, current.task.options.start_to_close_timeout);
        current.task.start_to_close_deadline = Some(deadline);
        current.task.heartbeat_deadline = current
            .task
            .options
            .heartbeat_timeout
            .map(|timeout| after(now, timeout));
        let started = current.task.clone();

        // Liveness of a running attempt is governed by its deadlines
        self.queue.extend_lease(&task.task_id, deadline);
        self.timeline
            .add_event(attempt_label(&started), EventType::Started, now);
        Some(started)
    }

    /// Applies an attempt's outcome. Reports for attempts that are no
    /// longer current are ignored.
    ///
    /// If the outcome cannot be recorded the attempt stays in flight with
    /// its task leased, so its deadlines still apply.
    pub fn report_activity(&mut self, report: ActivityReport, now: DateTime<Utc>) -> Result<(), EngineError> {
        let key = (report.run_id.clone(), report.seq);
        let task = match self.in_flight.get(&key) {
            Some(in_flight) if in_flight.task.task_id == report.task_id => in_flight.task.clone(),
            _ => {
                debug!("Ignoring stale report for task '{}'", report.task_id);
                self.queue.ack(&report.task_id);
                return Ok(());
            }
        };

        match report.result {
            Ok(result) => {
                self.append_events(
                    &task.run_id,
                    vec![HistoryEvent::ActivityCompleted {
                        seq: task.seq,
                        result,
                    }],
                    now,
                )?;
                self.settle_attempt(&task);
                self.timeline
                    .add_event(attempt_label(&task), EventType::Completed, now);
                self.enqueue_workflow_task(&task.run_id, now);
                Ok(())
            }
            Err(failure) => self.handle_activity_failure(task, failure, now),
        }
    }

    /// Forgets an attempt whose outcome is in history.
    fn settle_attempt(&mut self, task: &ActivityTask) {
        let key = (task.run_id.clone(), task.seq);
        let current = self
            .in_flight
            .get(&key)
            .map_or(false, |in_flight| in_flight.task.task_id == task.task_id);
        if current {
            self.in_flight.remove(&key);
        }
        self.queue.ack(&task.task_id);
    }

    /// Retries a failed attempt with backoff, or records the terminal failure.
    ///
    /// The retry itself is recorded in history so attempt counts survive
    /// recovery.
    fn handle_activity_failure(
        &mut self,
        task: ActivityTask,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let policy = &task.options.retry_policy;
        if failure.is_retryable() && policy.has_attempts_remaining(task.attempt) {
            let delay = policy.backoff(task.attempt);
            let next = task.next_attempt(now);
            self.append_events(
                &task.run_id,
                vec![HistoryEvent::ActivityRetryScheduled {
                    seq: task.seq,
                    attempt: next.attempt,
                }],
                now,
            )?;
            info!(
                "Retrying activity '{}' of run '{}' in {:?} (attempt {} of {} failed: {})",
                task.activity_type,
                task.run_id,
                delay,
                task.attempt,
                task.options.retry_policy.maximum_attempts,
                failure.message
            );
            self.settle_attempt(&task);
            self.record_attempt_end(&task, &failure, EventType::Retried, now);
            self.dispatch_activity(next, after(now, delay));
            return Ok(());
        }

        self.append_events(
            &task.run_id,
            vec![HistoryEvent::ActivityFailed {
                seq: task.seq,
                failure: failure.clone().with_attempts(task.attempt),
            }],
            now,
        )?;
        warn!(
            "Activity '{}' of run '{}' failed after {} attempts: {}",
            task.activity_type, task.run_id, task.attempt, failure
        );
        self.settle_attempt(&task);
        self.record_attempt_end(&task, &failure, EventType::Failed, now);
        self.enqueue_workflow_task(&task.run_id, now);
        Ok(())
    }

    fn record_attempt_end(
        &mut self,
        task: &ActivityTask,
        failure: &Failure,
        event_type: EventType,
        now: DateTime<Utc>,
    ) {
        let label = attempt_label(task);
        if failure.kind == ErrorKind::ActivityTimeout {
            self.timeline.add_event(label.clone(), EventType::TimedOut, now);
        }
        self.timeline.add_event(label, event_type, now);
    }

    /// Records a heartbeat and pushes out the heartbeat deadline.
    pub fn heartbeat(
        &mut self,
        task_id: &TaskId,
        progress: Payload,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let in_flight = self
            .in_flight
            .values_mut()
            .find(|in_flight| {
                &in_flight.task.task_id == task_id && in_flight.task.start_to_close_deadline.is_some()
            })
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;

        if let Some(timeout) = in_flight.task.options.heartbeat_timeout {
            in_flight.task.heartbeat_deadline = Some(after(now, timeout));
        }
        debug!("Heartbeat from '{}': {}", task_id, progress);
        in_flight.last_heartbeat = Some(Heartbeat {
            task_id: task_id.clone(),
            timestamp: now,
            progress,
        });
        Ok(())
    }

    // ---- Timeouts and timers ----

    /// Enforces deadlines and fires due timers.
    ///
    /// Start-to-close expiry is checked before heartbeat expiry, so an
    /// attempt past its start-to-close deadline times out as such no matter
    /// how recently it heartbeat.
    ///
    /// A deadline whose outcome cannot be recorded is left in place for the
    /// next sweep; the rest are still processed and the first error is
    /// returned.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        let mut first_error = None;

        let expired: Vec<(CommandKey, TimeoutKind)> = self
            .in_flight
            .iter()
            .filter_map(|(key, in_flight)| {
                let task = &in_flight.task;
                if task.start_to_close_deadline.map_or(false, |d| d <= now) {
                    Some((key.clone(), TimeoutKind::StartToClose))
                } else if task.heartbeat_deadline.map_or(false, |d| d <= now) {
                    Some((key.clone(), TimeoutKind::Heartbeat))
                } else {
                    None
                }
            })
            .collect();

        for (key, kind) in expired {
            let Some(in_flight) = self.in_flight.get(&key) else {
                continue;
            };
            let task = in_flight.task.clone();
            let last_progress = in_flight
                .last_heartbeat
                .as_ref()
                .map(|beat| format!(" (last heartbeat: {})", beat.progress))
                .unwrap_or_default();
            warn!(
                "Activity '{}' ({}) exceeded its {} timeout{}",
                task.activity_type, task.task_id, kind, last_progress
            );

            let task_id = task.task_id.clone();
            let failure =
                Failure::activity_timeout(kind, &task.activity_type).with_attempts(task.attempt);
            match self.handle_activity_failure(task, failure, now) {
                Ok(()) => report.timed_out_activities += 1,
                Err(err) => {
                    error!("Could not record timeout of '{}': {}", task_id, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        let due: Vec<CommandKey> = self
            .timers
            .iter()
            .filter(|(_, fire_at)| **fire_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            if !self.timers.contains_key(&key) {
                continue;
            }
            let (run_id, seq) = key.clone();
            match self.append_events(&run_id, vec![HistoryEvent::TimerFired { seq }], now) {
                Ok(()) => {
                    debug!("Timer {} of run '{}' fired", seq, run_id);
                    self.timers.remove(&key);
                    self.enqueue_workflow_task(&run_id, now);
                    report.fired_timers += 1;
                }
                Err(err) => {
                    error!("Could not fire timer {} of run '{}': {}", seq, run_id, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        let mut overdue: Vec<RunId> = self
            .executions
            .values()
            .filter(|e| !e.is_closed() && e.execution_deadline.map_or(false, |d| d <= now))
            .map(|e| e.run_id.clone())
            .collect();
        overdue.sort();
        for run_id in overdue {
            let Some(execution) = self.executions.get(&run_id) else {
                continue;
            };
            if execution.is_closed() {
                continue;
            }
            warn!(
                "Workflow '{}' (run '{}') exceeded its execution timeout",
                execution.workflow_id, run_id
            );
            let failure = Failure::workflow_timeout(&execution.workflow_type);
            match self.append_events(&run_id, vec![HistoryEvent::WorkflowTimedOut { failure }], now) {
                Ok(()) => report.timed_out_workflows += 1,
                Err(err) => {
                    error!("Could not time out run '{}': {}", run_id, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    // ---- Closing, children, cancellation ----

    /// Cleans up after a run reaches a terminal state: abandons its
    /// activities and timers, resolves the parent's pending command and
    /// requests cancellation of children still open.
    fn on_closed(&mut self, run_id: &RunId, now: DateTime<Utc>) -> Result<(), EngineError> {
        let abandoned: Vec<CommandKey> = self
            .in_flight
            .keys()
            .filter(|(run, _)| run == run_id)
            .cloned()
            .collect();
        for key in abandoned {
            if let Some(in_flight) = self.in_flight.remove(&key) {
                debug!("Abandoning activity task '{}'", in_flight.task.task_id);
                self.queue.ack(&in_flight.task.task_id);
            }
        }
        self.timers.retain(|(run, _), _| run != run_id);

        let Some(execution) = self.executions.get(run_id) else {
            return Ok(());
        };
        info!(
            "Workflow '{}' (run '{}') closed as {}",
            execution.workflow_id, run_id, execution.status
        );

        let outcome = execution.outcome();
        let parent = execution.parent.clone();
        let workflow_type = execution.workflow_type.clone();
        let open_children: Vec<RunId> = execution
            .history()
            .child_runs()
            .into_iter()
            .map(|(_, child)| child)
            .filter(|child| {
                self.executions
                    .get(child)
                    .map_or(false, |c| !c.is_closed())
            })
            .collect();

        if let Some(link) = parent {
            self.deliver_to_parent(&link, &workflow_type, &outcome, now)?;
        }
        for child in open_children {
            match self.cancel_run(&child, "parent workflow closed", now) {
                Ok(()) | Err(EngineError::ExecutionClosed(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Resolves the parent's pending child command with the child's outcome.
    ///
    /// Delivery is idempotent: a slot that already holds a result is left
    /// untouched.
    fn deliver_to_parent(
        &mut self,
        link: &ParentLink,
        child_type: &str,
        outcome: &WorkflowOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(parent) = self.executions.get(&link.run_id) else {
            debug!("Parent run '{}' is not open - dropping child result", link.run_id);
            return Ok(());
        };
        if parent.is_closed() {
            debug!("Parent run '{}' already closed - dropping child result", link.run_id);
            return Ok(());
        }
        if !parent.pending.contains(&link.seq) {
            debug!(
                "Child result for command {} of run '{}' already delivered",
                link.seq, link.run_id
            );
            return Ok(());
        }

        let event = match outcome {
            WorkflowOutcome::Completed(result) => HistoryEvent::ChildWorkflowCompleted {
                seq: link.seq,
                result: result.clone(),
            },
            other => {
                let cause = other
                    .to_failure()
                    .unwrap_or_else(|| Failure::workflow("child run has not closed"));
                HistoryEvent::ChildWorkflowFailed {
                    seq: link.seq,
                    failure: Failure::child_workflow(child_type, cause),
                }
            }
        };
        self.append_events(&link.run_id, vec![event], now)?;
        self.enqueue_workflow_task(&link.run_id, now);
        Ok(())
    }

    /// Requests cancellation of a workflow's current run. Idempotent.
    pub fn request_cancel(
        &mut self,
        workflow_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let run_id = self.latest_run(workflow_id)?;
        self.cancel_run(&run_id, reason, now)
    }

    fn cancel_run(&mut self, run_id: &RunId, reason: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        let Some(execution) = self.executions.get(run_id) else {
            let archived = self.load_archived(run_id)?;
            return Err(EngineError::ExecutionClosed(archived.workflow_id));
        };
        if execution.is_closed() {
            return Err(EngineError::ExecutionClosed(execution.workflow_id.clone()));
        }
        if execution.cancel_requested.is_some() {
            debug!("Cancellation of run '{}' already requested", run_id);
            return Ok(());
        }

        info!(
            "Cancellation requested for '{}' (run '{}'): {}",
            execution.workflow_id, run_id, reason
        );
        self.append_events(
            run_id,
            vec![HistoryEvent::CancelRequested {
                reason: reason.to_string(),
            }],
            now,
        )?;
        self.enqueue_workflow_task(run_id, now);
        Ok(())
    }

    /// Clears a halt so the run is replayed again. Returns false if the run
    /// was not halted.
    pub fn resume_halted(&mut self, workflow_id: &str, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let run_id = self.latest_run(workflow_id)?;
        let resumed = self
            .executions
            .get_mut(&run_id)
            .and_then(|execution| execution.halted.take())
            .is_some();
        if resumed {
            info!("Resuming halted workflow '{}' (run '{}')", workflow_id, run_id);
            self.enqueue_workflow_task(&run_id, now);
        }
        Ok(resumed)
    }

    // ---- Queries ----

    fn latest_run(&self, workflow_id: &str) -> Result<RunId, EngineError> {
        self.latest_runs
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::ExecutionNotFound(workflow_id.to_string()))
    }

    /// An open run.
    pub fn execution(&self, run_id: &RunId) -> Result<&WorkflowExecution, EngineError> {
        self.executions
            .get(run_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(run_id.to_string()))
    }

    /// Folds a closed run back from the store.
    fn load_archived(&self, run_id: &RunId) -> Result<WorkflowExecution, EngineError> {
        let entries = self.store.read(run_id)?;
        if entries.is_empty() {
            return Err(EngineError::ExecutionNotFound(run_id.to_string()));
        }
        WorkflowExecution::from_history(run_id.clone(), entries)
    }

    /// Applies `read` to a run, open or archived.
    fn with_run<T>(
        &self,
        run_id: &RunId,
        read: impl FnOnce(&WorkflowExecution) -> T,
    ) -> Result<T, EngineError> {
        match self.executions.get(run_id) {
            Some(execution) => Ok(read(execution)),
            None => Ok(read(&self.load_archived(run_id)?)),
        }
    }

    /// Current outcome of a workflow id's latest run.
    pub fn query(&self, workflow_id: &str) -> Result<WorkflowOutcome, EngineError> {
        let run_id = self.latest_run(workflow_id)?;
        self.with_run(&run_id, WorkflowExecution::outcome)
    }

    pub fn describe(&self, workflow_id: &str) -> Result<WorkflowInfo, EngineError> {
        let run_id = self.latest_run(workflow_id)?;
        self.with_run(&run_id, WorkflowExecution::info)
    }

    pub fn history(&self, workflow_id: &str) -> Result<Vec<HistoryEntry>, EngineError> {
        let run_id = self.latest_run(workflow_id)?;
        self.with_run(&run_id, |execution| execution.history().entries().to_vec())
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queue
            .queue_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn queued_tasks(&self) -> usize {
        self.queue.total()
    }

    pub fn in_flight_activities(&self) -> usize {
        self.in_flight.len()
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        self.queue.dead_letters()
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Number of runs not yet in a terminal state.
    pub fn open_runs(&self) -> usize {
        self.executions.len()
    }

    // ---- Recovery ----

    /// Rebuilds state from the history store.
    ///
    /// Executions are folded from history; only open runs are kept live.
    /// Their pending activities (at the attempt recorded in history), timers
    /// and children are re-armed and each gets a fresh workflow task.
    /// Returns the number of open runs.
    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut started: HashMap<RunId, (DateTime<Utc>, u64)> = HashMap::new();
        let mut total = 0;

        for run_id in self.store.runs()? {
            let entries = self.store.read(&run_id)?;
            let execution = WorkflowExecution::from_history(run_id.clone(), entries)?;
            let number = run_number(&run_id).unwrap_or(0);
            self.run_counter = self.run_counter.max(number);
            total += 1;

            let order = (execution.started_at, number);
            let replace = match self.latest_runs.get(&execution.workflow_id) {
                None => true,
                Some(latest) if self.executions.contains_key(latest) => false,
                Some(latest) => {
                    !execution.is_closed() || started.get(latest).map_or(true, |seen| order > *seen)
                }
            };
            if replace {
                self.latest_runs
                    .insert(execution.workflow_id.clone(), run_id.clone());
            }
            started.insert(run_id.clone(), order);
            if !execution.is_closed() {
                self.executions.insert(run_id, execution);
            }
        }

        let mut open: Vec<RunId> = self.executions.keys().cloned().collect();
        open.sort();
        for run_id in &open {
            self.restore_run(run_id, now)?;
        }

        info!(
            "Recovered {} runs from history store ({} open)",
            total,
            open.len()
        );
        Ok(open.len())
    }

    fn restore_run(&mut self, run_id: &RunId, now: DateTime<Utc>) -> Result<(), EngineError> {
        let execution = self.execution(run_id)?;
        let workflow_id = execution.workflow_id.clone();

        let mut activities = Vec::new();
        let mut timers = Vec::new();
        let mut children = Vec::new();
        for event in execution.history().events() {
            match event {
                HistoryEvent::ActivityScheduled {
                    seq,
                    activity_type,
                    task_queue,
                    input,
                    options,
                } if execution.pending.contains(seq) => {
                    let attempt = execution.history().activity_attempt(*seq);
                    activities.push(ActivityTask {
                        task_id: TaskId::activity(run_id, *seq, attempt),
                        workflow_id: workflow_id.clone(),
                        run_id: run_id.clone(),
                        seq: *seq,
                        activity_type: activity_type.clone(),
                        task_queue: task_queue.clone(),
                        input: input.clone(),
                        attempt,
                        options: options.clone(),
                        start_to_close_deadline: None,
                        heartbeat_deadline: None,
                        scheduled_at: now,
                    })
                }
                HistoryEvent::TimerStarted { seq, fire_at } if execution.pending.contains(seq) => {
                    timers.push((*seq, *fire_at))
                }
                HistoryEvent::ChildWorkflowScheduled {
                    seq,
                    workflow_type,
                    workflow_id: child_id,
                    task_queue,
                    input,
                } if execution.pending.contains(seq) => children.push((
                    *seq,
                    StartWorkflowRequest::new(
                        workflow_type.clone(),
                        task_queue.clone(),
                        child_id.clone(),
                        input.clone(),
                    ),
                    execution.history().child_run(*seq).cloned(),
                )),
                _ => {}
            }
        }

        for task in activities {
            debug!("Re-dispatching activity task '{}'", task.task_id);
            self.dispatch_activity(task, now);
        }
        for (seq, fire_at) in timers {
            self.timers.insert((run_id.clone(), seq), fire_at);
        }
        for (seq, request, child_run) in children {
            let link = ParentLink {
                workflow_id: workflow_id.clone(),
                run_id: run_id.clone(),
                seq,
            };
            let child_run = child_run.or_else(|| self.orphaned_child(&request.workflow_id, &link));
            match child_run {
                Some(child_run) => self.restore_child_link(link, &request.workflow_type, &child_run, now)?,
                None => {
                    self.start_child(run_id, seq, request, now)?;
                }
            }
        }

        self.enqueue_workflow_task(run_id, now);
        Ok(())
    }

    /// A child run that was started for `link` but never recorded in the
    /// parent's history.
    fn orphaned_child(&self, child_id: &str, link: &ParentLink) -> Option<RunId> {
        let run_id = self.latest_runs.get(child_id)?;
        let parent = self
            .with_run(run_id, |child| child.parent.clone())
            .ok()
            .flatten()?;
        (parent.run_id == link.run_id && parent.seq == link.seq).then(|| run_id.clone())
    }

    fn restore_child_link(
        &mut self,
        link: ParentLink,
        child_type: &str,
        child_run: &RunId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let recorded = self
            .execution(&link.run_id)?
            .history()
            .child_run(link.seq)
            .is_some();
        if !recorded {
            self.append_events(
                &link.run_id,
                vec![HistoryEvent::ChildWorkflowStarted {
                    seq: link.seq,
                    run_id: child_run.clone(),
                }],
                now,
            )?;
        }

        let outcome = self.with_run(child_run, WorkflowExecution::outcome)?;
        if !outcome.is_running() {
            self.deliver_to_parent(&link, child_type, &outcome, now)?;
        }
        Ok(())
    }
}
