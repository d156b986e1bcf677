//! Configuration Validation
//!
//! Validation for engine settings and activity options:
//! - Worker queue names and thread counts
//! - Lease, sweep and poll intervals
//! - Retry policy bounds
//! - Heartbeat timeout versus start-to-close timeout

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info};

use super::EngineConfig;
use crate::activity::{ActivityOptions, RetryPolicy};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    ZeroDuration(&'static str),
    ZeroMaxDeliveries,
    ZeroTimelineCapacity,
    EmptyQueueName,
    ZeroThreads(String),
    DuplicateQueue(String),
    ZeroMaxAttempts,
    InvalidBackoffCoefficient(f64),
    IntervalOrder { initial: Duration, maximum: Duration },
    HeartbeatNotShorter { heartbeat: Duration, start_to_close: Duration },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroDuration(field) => write!(f, "'{}' must be greater than zero", field),
            Self::ZeroMaxDeliveries => write!(f, "'max_deliveries' must be at least 1"),
            Self::ZeroTimelineCapacity => write!(f, "'timeline_capacity' must be at least 1"),
            Self::EmptyQueueName => write!(f, "Worker has empty or whitespace-only task queue"),
            Self::ZeroThreads(queue) => {
                write!(f, "Worker for '{}' must have at least one thread (threads = 0)", queue)
            }
            Self::DuplicateQueue(queue) => write!(f, "Duplicate worker task queue: '{}'", queue),
            Self::ZeroMaxAttempts => write!(f, "Retry policy 'maximum_attempts' must be at least 1"),
            Self::InvalidBackoffCoefficient(value) => {
                write!(f, "Retry policy 'backoff_coefficient' must be >= 1.0 (got {})", value)
            }
            Self::IntervalOrder { initial, maximum } => write!(
                f,
                "Retry policy 'maximum_interval' ({:?}) is shorter than 'initial_interval' ({:?})",
                maximum, initial
            ),
            Self::HeartbeatNotShorter {
                heartbeat,
                start_to_close,
            } => write!(
                f,
                "Heartbeat timeout ({:?}) must be shorter than start-to-close timeout ({:?})",
                heartbeat, start_to_close
            ),
        }
    }
}

/// Validates a retry policy.
fn validate_retry_policy(policy: &RetryPolicy) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if policy.maximum_attempts == 0 {
        errors.push(ValidationError::ZeroMaxAttempts);
    }

    if !policy.backoff_coefficient.is_finite() || policy.backoff_coefficient < 1.0 {
        errors.push(ValidationError::InvalidBackoffCoefficient(
            policy.backoff_coefficient,
        ));
    }

    if policy.maximum_interval < policy.initial_interval {
        errors.push(ValidationError::IntervalOrder {
            initial: policy.initial_interval,
            maximum: policy.maximum_interval,
        });
    }

    errors
}

/// Validates activity options as given at registration or at the call site.
pub fn validate_activity_options(options: &ActivityOptions) -> Result<(), String> {
    let mut errors = validate_retry_policy(&options.retry_policy);

    if options.start_to_close_timeout.is_zero() {
        errors.push(ValidationError::ZeroDuration("start_to_close_timeout"));
    }

    if let Some(heartbeat) = options.heartbeat_timeout {
        if heartbeat.is_zero() {
            errors.push(ValidationError::ZeroDuration("heartbeat_timeout"));
        } else if heartbeat >= options.start_to_close_timeout {
            errors.push(ValidationError::HeartbeatNotShorter {
                heartbeat,
                start_to_close: options.start_to_close_timeout,
            });
        }
    }

    join_errors(errors)
}

/// Validates the engine configuration.
///
/// Performs the following checks:
/// 1. Lease, sweep and poll intervals are non-zero
/// 2. The delivery budget allows at least one delivery
/// 3. Every worker names a queue and has at least one thread
/// 4. No task queue is configured twice
pub fn validate_config(config: &EngineConfig) -> Result<(), String> {
    info!(
        "Validating engine configuration with {} worker queues",
        config.workers.len()
    );

    let mut errors = Vec::new();

    if config.lease_duration.is_zero() {
        errors.push(ValidationError::ZeroDuration("lease_ms"));
    }
    if config.sweep_interval.is_zero() {
        errors.push(ValidationError::ZeroDuration("sweep_interval_ms"));
    }
    if config.poll_interval.is_zero() {
        errors.push(ValidationError::ZeroDuration("poll_interval_ms"));
    }
    if config.max_deliveries == 0 {
        errors.push(ValidationError::ZeroMaxDeliveries);
    }
    if config.timeline_capacity == 0 {
        errors.push(ValidationError::ZeroTimelineCapacity);
    }

    let mut seen_queues: HashSet<&str> = HashSet::new();
    for worker in &config.workers {
        let queue = worker.task_queue.trim();
        if queue.is_empty() {
            errors.push(ValidationError::EmptyQueueName);
            continue;
        }
        if worker.threads == 0 {
            errors.push(ValidationError::ZeroThreads(queue.to_string()));
        }
        if !seen_queues.insert(queue) {
            errors.push(ValidationError::DuplicateQueue(queue.to_string()));
        }
    }

    if config.workers.is_empty() {
        debug!("No workers configured - tasks must be driven manually");
    }

    join_errors(errors)
}

fn join_errors(errors: Vec<ValidationError>) -> Result<(), String> {
    if errors.is_empty() {
        return Ok(());
    }
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    Err(messages.join("\n"))
}
