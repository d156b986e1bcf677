//! Engine Runtime
//!
//! The client-facing facade over the scheduler:
//! - Starting, querying, cancelling and resuming workflows
//! - Per-queue worker threads polling for workflow and activity tasks
//! - A sweeper thread enforcing timeouts and firing timers
//! - `run_until_idle` for driving everything from the calling thread
//!
//! Scheduler state sits behind a single mutex. Activity code runs outside
//! it; only the dequeue/start and the report are applied under the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::activity::{ActivityExecutor, HeartbeatSink};
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_config, EngineConfig};
use crate::error::EngineError;
use crate::monitoring::ExecutionTimeline;
use crate::queue::{DeadLetter, TaskId, TaskKind};
use crate::registry::{Registry, StartWorkflowRequest};
use crate::workflow::{
    FileHistoryStore, HistoryEntry, HistoryStore, MemoryHistoryStore, Payload, WorkflowInfo,
    WorkflowOutcome,
};

use super::scheduler::{Scheduler, SweepReport};

fn lock(scheduler: &Mutex<Scheduler>) -> MutexGuard<'_, Scheduler> {
    scheduler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes activity heartbeats back into the scheduler.
struct SchedulerHeartbeats {
    scheduler: Arc<Mutex<Scheduler>>,
    clock: Arc<dyn Clock>,
}

impl HeartbeatSink for SchedulerHeartbeats {
    fn record_heartbeat(&self, task_id: &TaskId, progress: Payload) -> Result<(), EngineError> {
        let now = self.clock.now();
        lock(&self.scheduler).heartbeat(task_id, progress, now)
    }
}

/// Durable workflow engine.
///
/// # Example
///
/// ```rust,no_run
/// use duraflow::{Engine, EngineConfig, Registry, StartWorkflowRequest};
/// use duraflow::workflow::workflow_fn;
/// use serde_json::json;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut registry = Registry::new();
///     registry.register_workflow("Echo", workflow_fn(|_ctx, input| Ok(input)))?;
///
///     let engine = Engine::new(EngineConfig::default(), registry)?;
///     engine.start_workflow(StartWorkflowRequest::new("Echo", "main", "echo-1", json!(1)))?;
///     engine.run_until_idle()?;
///     println!("{:?}", engine.query("echo-1")?);
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: EngineConfig,
    registry: Arc<Registry>,
    scheduler: Arc<Mutex<Scheduler>>,
    executor: ActivityExecutor,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Creates an engine on the wall clock. History is kept under
    /// `config.state_dir` when set, in memory otherwise.
    pub fn new(config: EngineConfig, registry: Registry) -> Result<Self, EngineError> {
        let store: Box<dyn HistoryStore> = match &config.state_dir {
            Some(dir) => Box::new(FileHistoryStore::open(dir.clone())?),
            None => Box::new(MemoryHistoryStore::new()),
        };
        Self::with_store(config, registry, store, Arc::new(SystemClock))
    }

    pub fn with_store(
        config: EngineConfig,
        registry: Registry,
        store: Box<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        validate_config(&config).map_err(EngineError::InvalidConfig)?;

        let registry = Arc::new(registry);
        info!(
            "Engine ready: {} workflow types, {} activity types",
            registry.workflow_types().len(),
            registry.activity_types().len()
        );

        let scheduler = Scheduler::new(Arc::clone(&registry), store, &config);
        Ok(Self {
            executor: ActivityExecutor::new(Arc::clone(&registry)),
            scheduler: Arc::new(Mutex::new(scheduler)),
            registry,
            config,
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        lock(&self.scheduler)
    }

    fn heartbeat_sink(&self) -> Arc<dyn HeartbeatSink> {
        Arc::new(SchedulerHeartbeats {
            scheduler: Arc::clone(&self.scheduler),
            clock: Arc::clone(&self.clock),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- Client API ----

    /// Starts a workflow run and returns its workflow id.
    pub fn start_workflow(&self, request: StartWorkflowRequest) -> Result<String, EngineError> {
        let workflow_id = request.workflow_id.clone();
        let now = self.now();
        self.lock().start_execution(request, None, now)?;
        Ok(workflow_id)
    }

    pub fn query(&self, workflow_id: &str) -> Result<WorkflowOutcome, EngineError> {
        self.lock().query(workflow_id)
    }

    pub fn describe(&self, workflow_id: &str) -> Result<WorkflowInfo, EngineError> {
        self.lock().describe(workflow_id)
    }

    pub fn history(&self, workflow_id: &str) -> Result<Vec<HistoryEntry>, EngineError> {
        self.lock().history(workflow_id)
    }

    /// Requests cancellation; the workflow observes it on its next task.
    pub fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError> {
        let now = self.now();
        self.lock().request_cancel(workflow_id, reason, now)
    }

    /// Re-enables a run halted by nondeterminism.
    pub fn resume_halted(&self, workflow_id: &str) -> Result<bool, EngineError> {
        let now = self.now();
        self.lock().resume_halted(workflow_id, now)
    }

    /// Records progress for a running activity attempt.
    pub fn heartbeat(&self, task_id: &TaskId, progress: Payload) -> Result<(), EngineError> {
        let now = self.now();
        self.lock().heartbeat(task_id, progress, now)
    }

    /// Reloads runs from the history store and re-arms their pending work.
    pub fn recover(&self) -> Result<usize, EngineError> {
        let now = self.now();
        self.lock().recover(now)
    }

    pub fn sweep(&self) -> Result<SweepReport, EngineError> {
        let now = self.now();
        self.lock().sweep(now)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters().to_vec()
    }

    pub fn timeline(&self) -> ExecutionTimeline {
        self.lock().timeline().clone()
    }

    /// Polls until the workflow closes or `timeout` elapses.
    pub fn wait_for_outcome(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowOutcome, EngineError> {
        let started = Instant::now();
        loop {
            let outcome = self.query(workflow_id)?;
            if !outcome.is_running() {
                return Ok(outcome);
            }
            if started.elapsed() >= timeout {
                return Err(EngineError::Timeout(workflow_id.to_string()));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    // ---- Task processing ----

    /// Processes at most one task from `queue`. Returns false if none was
    /// visible.
    pub fn poll_once(&self, queue: &str) -> Result<bool, EngineError> {
        let now = self.now();
        let mut scheduler = self.lock();
        let Some(task) = scheduler.dequeue(queue, now) else {
            return Ok(false);
        };

        match task.kind {
            TaskKind::Workflow(workflow_task) => {
                scheduler.process_workflow_task(&task.id, &workflow_task, now)?;
            }
            TaskKind::Activity(activity_task) => {
                let Some(started) = scheduler.activity_started(&activity_task, now) else {
                    return Ok(true);
                };
                drop(scheduler);

                let report = self.executor.execute(&started, self.heartbeat_sink());
                let now = self.now();
                self.lock().report_activity(report, now)?;
            }
        }
        Ok(true)
    }

    /// Drives every queue and the sweep from the calling thread until
    /// nothing is left to do at the current time. Returns the number of
    /// tasks processed.
    pub fn run_until_idle(&self) -> Result<usize, EngineError> {
        let mut processed = 0;
        loop {
            let mut progressed = false;

            let queues = self.lock().queue_names();
            for queue in queues {
                while self.poll_once(&queue)? {
                    processed += 1;
                    progressed = true;
                }
            }

            if !self.sweep()?.is_empty() {
                progressed = true;
            }
            if !progressed {
                return Ok(processed);
            }
        }
    }

    // ---- Worker pool ----

    /// Spawns the configured worker threads plus the sweeper.
    pub fn spawn_workers(self: &Arc<Self>) -> Result<WorkerPool, EngineError> {
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::new();

        if self.config.workers.is_empty() {
            warn!("No workers configured - only the sweeper will run");
        }

        for worker in &self.config.workers {
            for index in 0..worker.threads {
                let engine = Arc::clone(self);
                let flag = Arc::clone(&running);
                let queue = worker.task_queue.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", queue, index))
                    .spawn(move || engine.worker_loop(&queue, &flag))?;
                handles.push(handle);
            }
        }

        let engine = Arc::clone(self);
        let flag = Arc::clone(&running);
        let sweeper = thread::Builder::new()
            .name("sweeper".to_string())
            .spawn(move || engine.sweeper_loop(&flag))?;
        handles.push(sweeper);

        info!(
            "Started {} worker threads on {} task queues",
            self.config.total_threads(),
            self.config.workers.len()
        );
        Ok(WorkerPool { running, handles })
    }

    fn worker_loop(&self, queue: &str, running: &AtomicBool) {
        debug!("Worker polling '{}'", queue);
        while running.load(Ordering::Relaxed) {
            match self.poll_once(queue) {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.config.poll_interval),
                Err(e) => {
                    error!("Worker on '{}' failed to process a task: {}", queue, e);
                    thread::sleep(self.config.poll_interval);
                }
            }
        }
        debug!("Worker on '{}' stopped", queue);
    }

    fn sweeper_loop(&self, running: &AtomicBool) {
        while running.load(Ordering::Relaxed) {
            match self.sweep() {
                Ok(report) if !report.is_empty() => debug!("Sweep: {:?}", report),
                Ok(_) => {}
                Err(e) => error!("Timeout sweep failed: {}", e),
            }
            thread::sleep(self.config.sweep_interval);
        }
    }
}

/// Running worker threads. Dropping the pool signals them to stop;
/// [`WorkerPool::shutdown`] also waits for them.
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in std::mem::take(&mut self.handles) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{activity_fn, ActivityCall, ActivityOptions, RetryPolicy};
    use crate::clock::ManualClock;
    use crate::error::{ActivityError, ErrorKind};
    use crate::workflow::workflow_fn;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    const MAIN: &str = "main";

    fn registry(failures_before_success: u32) -> Registry {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        registry
            .register_activity(
                "double",
                ActivityOptions::new(Duration::from_secs(5)).with_retry_policy(
                    RetryPolicy::new(3).with_initial_interval(Duration::from_secs(2)),
                ),
                activity_fn(move |ctx, input| {
                    ctx.heartbeat(json!({"attempt": ctx.attempt()}))?;
                    if calls.fetch_add(1, Ordering::SeqCst) < failures_before_success {
                        return Err(ActivityError::Failed("not yet".into()));
                    }
                    let value = input.as_f64().ok_or_else(|| {
                        ActivityError::InvalidInput("expected a number".into())
                    })?;
                    Ok(json!(value * 2.0))
                }),
            )
            .unwrap();
        registry
            .register_activity(
                "explode",
                ActivityOptions::default().with_retry_policy(RetryPolicy::no_retries()),
                activity_fn(|_ctx, _input| panic!("kaboom")),
            )
            .unwrap();
        registry
            .register_workflow(
                "Doubler",
                workflow_fn(|ctx, input| ctx.execute_activity(ActivityCall::new("double", input))),
            )
            .unwrap();
        registry
            .register_workflow(
                "Exploder",
                workflow_fn(|ctx, input| ctx.execute_activity(ActivityCall::new("explode", input))),
            )
            .unwrap();
        registry
            .register_workflow(
                "Napper",
                workflow_fn(|ctx, _input| {
                    ctx.sleep(Duration::from_secs(3600))?;
                    Ok(json!("rested"))
                }),
            )
            .unwrap();
        registry
    }

    fn manual_engine(failures: u32) -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let engine = Engine::with_store(
            EngineConfig::default(),
            registry(failures),
            Box::new(MemoryHistoryStore::new()),
            clock.clone(),
        )
        .unwrap();
        (engine, clock)
    }

    fn request(workflow_type: &str, id: &str, input: Payload) -> StartWorkflowRequest {
        StartWorkflowRequest::new(workflow_type, MAIN, id, input)
    }

    #[test]
    fn test_run_until_idle_completes_workflow() {
        let (engine, _clock) = manual_engine(0);
        let id = engine.start_workflow(request("Doubler", "wf", json!(21.0))).unwrap();
        assert_eq!(id, "wf");

        assert!(engine.run_until_idle().unwrap() >= 3);
        assert_eq!(engine.query("wf").unwrap(), WorkflowOutcome::Completed(json!(42.0)));
        assert_eq!(engine.timeline().count(crate::monitoring::EventType::Completed), 1);
    }

    #[test]
    fn test_retries_follow_clock() {
        let (engine, clock) = manual_engine(2);
        engine.start_workflow(request("Doubler", "wf", json!(1.0))).unwrap();

        engine.run_until_idle().unwrap();
        assert_eq!(engine.query("wf").unwrap(), WorkflowOutcome::Running);

        clock.advance(Duration::from_secs(2));
        engine.run_until_idle().unwrap();
        assert_eq!(engine.query("wf").unwrap(), WorkflowOutcome::Running);

        clock.advance(Duration::from_secs(4));
        engine.run_until_idle().unwrap();
        assert_eq!(engine.query("wf").unwrap(), WorkflowOutcome::Completed(json!(2.0)));
    }

    #[test]
    fn test_invalid_input_fails_without_retry() {
        let (engine, _clock) = manual_engine(0);
        engine
            .start_workflow(request("Doubler", "wf", json!("twenty")))
            .unwrap();
        engine.run_until_idle().unwrap();

        match engine.query("wf").unwrap() {
            WorkflowOutcome::Failed(failure) => {
                assert_eq!(failure.kind, ErrorKind::InvalidInput);
                assert_eq!(failure.attempts, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_activity_panic_is_a_failure() {
        let (engine, _clock) = manual_engine(0);
        engine.start_workflow(request("Exploder", "wf", json!(null))).unwrap();
        engine.run_until_idle().unwrap();

        match engine.query("wf").unwrap() {
            WorkflowOutcome::Failed(failure) => {
                assert_eq!(failure.kind, ErrorKind::ActivityExecution);
                assert!(failure.message.contains("kaboom"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cancel_and_describe() {
        let (engine, clock) = manual_engine(0);
        let request = request("Napper", "nap", json!(null)).with_memo("initiated_by", json!("api"));
        engine.start_workflow(request).unwrap();
        engine.run_until_idle().unwrap();

        let info = engine.describe("nap").unwrap();
        assert_eq!(info.pending_commands, 1);
        assert_eq!(info.memo.get("initiated_by"), Some(&json!("api")));

        engine.cancel("nap", "no time").unwrap();
        engine.run_until_idle().unwrap();
        assert_eq!(
            engine.query("nap").unwrap(),
            WorkflowOutcome::Cancelled("no time".into())
        );

        clock.advance(Duration::from_secs(7200));
        assert!(engine.sweep().unwrap().is_empty());
    }

    #[test]
    fn test_wait_for_outcome_times_out() {
        let config = EngineConfig::default().with_poll_interval(Duration::from_millis(5));
        let engine = Engine::new(config, registry(0)).unwrap();
        engine.start_workflow(request("Napper", "nap", json!(null))).unwrap();

        let result = engine.wait_for_outcome("nap", Duration::from_millis(30));
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[test]
    fn test_worker_pool_runs_workflows() {
        let config = EngineConfig::default()
            .with_worker(MAIN, 2)
            .with_poll_interval(Duration::from_millis(5))
            .with_sweep_interval(Duration::from_millis(10));
        let engine = Arc::new(Engine::new(config, registry(0)).unwrap());
        let pool = engine.spawn_workers().unwrap();
        assert_eq!(pool.len(), 3);

        for i in 0..4 {
            engine
                .start_workflow(request("Doubler", &format!("wf-{}", i), json!(i as f64)))
                .unwrap();
        }
        for i in 0..4 {
            let outcome = engine
                .wait_for_outcome(&format!("wf-{}", i), Duration::from_secs(10))
                .unwrap();
            assert_eq!(outcome, WorkflowOutcome::Completed(json!(i as f64 * 2.0)));
        }
        pool.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::default().with_max_deliveries(0);
        assert!(matches!(
            Engine::new(config, registry(0)),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_recover_from_state_dir() {
        let temp_dir = tempdir().unwrap();
        let config = EngineConfig::default().with_state_dir(temp_dir.path());

        {
            let engine = Engine::new(config.clone(), registry(0)).unwrap();
            engine.start_workflow(request("Doubler", "wf", json!(4.0))).unwrap();
        }

        let engine = Engine::new(config, registry(0)).unwrap();
        assert_eq!(engine.recover().unwrap(), 1);
        engine.run_until_idle().unwrap();
        assert_eq!(engine.query("wf").unwrap(), WorkflowOutcome::Completed(json!(8.0)));
        assert!(engine.history("wf").unwrap().len() >= 4);
    }
}
