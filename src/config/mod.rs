//! Engine Configuration
//!
//! Explicit configuration passed into [`crate::Engine`] constructors.
//!
//! # Structure
//!
//! - [`loader`]: YAML loading and saving
//! - [`validator`]: Validation rules for engine and activity settings
//!
//! # Example YAML Format
//!
//! ```yaml
//! lease_ms: 30000
//! sweep_interval_ms: 250
//! poll_interval_ms: 50
//! max_deliveries: 5
//! timeline_capacity: 10000
//! state_dir: .duraflow
//! workers:
//!   - task_queue: automation-pipeline-queue
//!     threads: 1
//!   - task_queue: processor-task-queue
//!     threads: 8
//! ```

pub mod loader;
pub mod validator;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use loader::{load_config, save_config};
pub use validator::{validate_activity_options, validate_config, ValidationError};

/// Default lease on a dequeued task before it becomes eligible for redelivery.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Default interval between timeout sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Default idle wait for a worker that found no task.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default delivery budget for a single queued task.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Default number of attempt events kept by the execution timeline.
pub const DEFAULT_TIMELINE_CAPACITY: usize = 10_000;

/// Runtime configuration for an engine instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Lease granted to a worker when it dequeues a task
    #[serde(rename = "lease_ms", with = "duration_ms", default = "default_lease")]
    pub lease_duration: Duration,

    /// How often the sweeper checks deadlines and timers
    #[serde(
        rename = "sweep_interval_ms",
        with = "duration_ms",
        default = "default_sweep_interval"
    )]
    pub sweep_interval: Duration,

    /// How long an idle worker waits before polling again
    #[serde(
        rename = "poll_interval_ms",
        with = "duration_ms",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,

    /// Deliveries allowed before a task is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Most recent attempt events kept for the timeline report
    #[serde(default = "default_timeline_capacity")]
    pub timeline_capacity: usize,

    /// Directory for the file-backed history store (in-memory when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Worker threads per task queue
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// Worker threads polling one task queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub task_queue: String,

    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl WorkerConfig {
    pub fn new(task_queue: impl Into<String>, threads: usize) -> Self {
        Self {
            task_queue: task_queue.into().trim().to_string(),
            threads,
        }
    }
}

fn default_lease() -> Duration {
    DEFAULT_LEASE
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_max_deliveries() -> u32 {
    DEFAULT_MAX_DELIVERIES
}

fn default_timeline_capacity() -> usize {
    DEFAULT_TIMELINE_CAPACITY
}

/// Worker threads default to one per CPU.
fn default_threads() -> usize {
    num_cpus::get()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            timeline_capacity: DEFAULT_TIMELINE_CAPACITY,
            state_dir: None,
            workers: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds worker threads for a task queue.
    pub fn with_worker(mut self, task_queue: impl Into<String>, threads: usize) -> Self {
        self.workers.push(WorkerConfig::new(task_queue, threads));
        self
    }

    /// Adds workers for a task queue with one thread per CPU.
    pub fn with_default_worker(self, task_queue: impl Into<String>) -> Self {
        self.with_worker(task_queue, default_threads())
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max;
        self
    }

    pub fn with_timeline_capacity(mut self, capacity: usize) -> Self {
        self.timeline_capacity = capacity;
        self
    }

    /// Total number of worker threads across all queues.
    pub fn total_threads(&self) -> usize {
        self.workers.iter().map(|w| w.threads).sum()
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serializes an optional `Duration` as whole milliseconds.
pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer
                .serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.lease_duration, DEFAULT_LEASE);
        assert_eq!(config.max_deliveries, DEFAULT_MAX_DELIVERIES);
        assert!(config.workers.is_empty());
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::new()
            .with_worker("a", 2)
            .with_worker(" b ", 3)
            .with_state_dir("/tmp/state")
            .with_lease_duration(Duration::from_secs(5));

        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[1].task_queue, "b");
        assert_eq!(config.total_threads(), 5);
        assert_eq!(config.lease_duration, Duration::from_secs(5));
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/state")));
    }

    #[test]
    fn test_default_worker_uses_cpu_count() {
        let config = EngineConfig::new().with_default_worker("q");
        assert_eq!(config.workers[0].threads, num_cpus::get());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = EngineConfig::new().with_sweep_interval(Duration::from_millis(750));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["sweep_interval_ms"], 750);
        assert_eq!(json["lease_ms"], 30_000);

        let parsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let parsed: EngineConfig = serde_json::from_str(r#"{"workers":[{"task_queue":"q"}]}"#).unwrap();
        assert_eq!(parsed.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(parsed.timeline_capacity, DEFAULT_TIMELINE_CAPACITY);
        assert_eq!(parsed.workers[0].threads, num_cpus::get());
    }
}
