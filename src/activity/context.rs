//! Activity Context
//!
//! What an executing activity can see and do: its task identity and
//! attempt number, and heartbeat reporting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ActivityError, EngineError};
use crate::queue::TaskId;
use crate::workflow::{Payload, RunId};

/// Identity of the running activity attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityInfo {
    pub task_id: TaskId,
    pub activity_type: String,
    pub workflow_id: String,
    pub run_id: RunId,
    pub seq: u64,
    pub attempt: u32,
    pub task_queue: String,
}

/// A liveness report from a running activity.
///
/// Only resets the heartbeat deadline; never written to workflow history.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub progress: Payload,
}

/// Receives heartbeats from running activities.
pub trait HeartbeatSink: Send + Sync {
    fn record_heartbeat(&self, task_id: &TaskId, progress: Payload) -> Result<(), EngineError>;
}

/// Sink that accepts and drops every heartbeat.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHeartbeatSink;

impl HeartbeatSink for NoopHeartbeatSink {
    fn record_heartbeat(&self, _task_id: &TaskId, _progress: Payload) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Handle passed to activity code.
pub struct ActivityContext {
    info: ActivityInfo,
    sink: Arc<dyn HeartbeatSink>,
}

impl ActivityContext {
    pub fn new(info: ActivityInfo, sink: Arc<dyn HeartbeatSink>) -> Self {
        Self { info, sink }
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    pub fn attempt(&self) -> u32 {
        self.info.attempt
    }

    /// Reports progress and resets the heartbeat deadline.
    ///
    /// Fails with a non-retryable error once the attempt has been abandoned
    /// (timed out, cancelled or superseded), so the activity can stop early.
    pub fn heartbeat(&self, progress: impl Serialize) -> Result<(), ActivityError> {
        let progress = serde_json::to_value(progress)?;
        self.sink
            .record_heartbeat(&self.info.task_id, progress)
            .map_err(|e| ActivityError::NonRetryable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        beats: Mutex<Vec<(TaskId, Payload)>>,
    }

    impl HeartbeatSink for RecordingSink {
        fn record_heartbeat(&self, task_id: &TaskId, progress: Payload) -> Result<(), EngineError> {
            self.beats.lock().unwrap().push((task_id.clone(), progress));
            Ok(())
        }
    }

    struct ClosedSink;

    impl HeartbeatSink for ClosedSink {
        fn record_heartbeat(&self, task_id: &TaskId, _progress: Payload) -> Result<(), EngineError> {
            Err(EngineError::UnknownTask(task_id.to_string()))
        }
    }

    fn info() -> ActivityInfo {
        let run_id = RunId::new("run-1");
        ActivityInfo {
            task_id: TaskId::activity(&run_id, 0, 1),
            activity_type: "sqrt_activity".into(),
            workflow_id: "wf".into(),
            run_id,
            seq: 0,
            attempt: 1,
            task_queue: "processor-task-queue".into(),
        }
    }

    #[test]
    fn test_heartbeat_reaches_sink() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ActivityContext::new(info(), sink.clone());

        ctx.heartbeat("Progress: 10 / 60 seconds").unwrap();

        let beats = sink.beats.lock().unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].1, json!("Progress: 10 / 60 seconds"));
        assert_eq!(ctx.attempt(), 1);
    }

    #[test]
    fn test_heartbeat_on_abandoned_task_fails() {
        let ctx = ActivityContext::new(info(), Arc::new(ClosedSink));
        let err = ctx.heartbeat(1).unwrap_err();
        assert!(matches!(err, ActivityError::NonRetryable(_)));
    }
}
