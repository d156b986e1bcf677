//! Activity Options
//!
//! Timeouts, retry policy and target queue for an activity. Options are
//! given at registration and may be overridden per call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::workflow::Payload;

/// Default start-to-close timeout for a single attempt.
pub const DEFAULT_START_TO_CLOSE: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Queue the activity task is dispatched on (the workflow's queue if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,

    /// Deadline for one attempt, measured from when a worker starts it
    #[serde(rename = "start_to_close_ms", with = "crate::config::duration_ms")]
    pub start_to_close_timeout: Duration,

    /// Maximum gap allowed between heartbeats
    #[serde(
        rename = "heartbeat_ms",
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::config::option_duration_ms"
    )]
    pub heartbeat_timeout: Option<Duration>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self::new(DEFAULT_START_TO_CLOSE)
    }
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration) -> Self {
        Self {
            task_queue: None,
            start_to_close_timeout,
            heartbeat_timeout: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// An activity invocation requested by workflow code.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCall {
    pub activity_type: String,
    pub input: Payload,

    /// Overrides the options the activity was registered with
    pub options: Option<ActivityOptions>,
}

impl ActivityCall {
    pub fn new(activity_type: impl Into<String>, input: Payload) -> Self {
        Self {
            activity_type: activity_type.into(),
            input,
            options: None,
        }
    }

    pub fn with_options(mut self, options: ActivityOptions) -> Self {
        self.options = Some(options);
        self
    }
}
