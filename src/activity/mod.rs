//! Activities
//!
//! Externally visible units of work run by workers outside workflow replay.
//!
//! # Structure
//!
//! - [`retry`]: Retry policy and backoff schedule
//! - [`options`]: Timeouts, retry policy and queue for an activity
//! - [`context`]: Activity-side view of the task, heartbeats
//! - [`executor`]: Runs one attempt and reports its outcome

pub mod context;
pub mod executor;
pub mod options;
pub mod retry;

pub use context::{ActivityContext, ActivityInfo, Heartbeat, HeartbeatSink, NoopHeartbeatSink};
pub use executor::{activity_fn, Activity, ActivityExecutor, ActivityReport};
pub use options::{ActivityCall, ActivityOptions, DEFAULT_START_TO_CLOSE};
pub use retry::RetryPolicy;
