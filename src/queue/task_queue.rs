//! Task Queue
//!
//! Named FIFO queues with lease-based, at-least-once delivery:
//! - `dequeue` hands out the oldest visible task that is not under a live lease
//! - A lease that expires without an `ack` makes the task deliverable again
//! - `ack` removes the task for good and is idempotent
//! - Tasks past their delivery budget move to a dead-letter list
//!
//! Task ids deduplicate: enqueueing an id that is already queued is a no-op.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::task::{Task, TaskId};
use crate::clock::after;
use crate::config::DEFAULT_MAX_DELIVERIES;

#[derive(Debug, Clone)]
struct QueueEntry {
    task: Task,
    queue: String,
    visible_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    deliveries: u32,
}

impl QueueEntry {
    fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now && self.leased_until.map_or(true, |until| until <= now)
    }
}

/// A task that exhausted its delivery budget.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub task: Task,
    pub queue: String,
    pub reason: String,
    pub deliveries: u32,
}

/// Result of [`TaskQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    DeadLettered,
    Unknown,
}

#[derive(Debug)]
pub struct TaskQueue {
    queues: HashMap<String, VecDeque<TaskId>>,
    entries: HashMap<TaskId, QueueEntry>,
    dead_letters: Vec<DeadLetter>,
    max_deliveries: u32,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            queues: HashMap::new(),
            entries: HashMap::new(),
            dead_letters: Vec::new(),
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Appends a task, visible immediately.
    ///
    /// Returns false if a task with the same id is already queued.
    pub fn enqueue(&mut self, queue: &str, task: Task, now: DateTime<Utc>) -> bool {
        self.enqueue_at(queue, task, now)
    }

    /// Appends a task that becomes visible at `visible_at`.
    pub fn enqueue_at(&mut self, queue: &str, task: Task, visible_at: DateTime<Utc>) -> bool {
        if self.entries.contains_key(&task.id) {
            debug!("Task '{}' already queued - ignoring duplicate", task.id);
            return false;
        }

        let id = task.id.clone();
        self.entries.insert(
            id.clone(),
            QueueEntry {
                task,
                queue: queue.to_string(),
                visible_at,
                leased_until: None,
                deliveries: 0,
            },
        );
        self.queues.entry(queue.to_string()).or_default().push_back(id);
        true
    }

    /// Leases the oldest deliverable task on `queue`.
    pub fn dequeue(&mut self, queue: &str, lease: Duration, now: DateTime<Utc>) -> Option<Task> {
        let ids: Vec<TaskId> = self
            .queues
            .get(queue)?
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .map_or(false, |entry| entry.is_deliverable(now))
            })
            .cloned()
            .collect();

        for id in ids {
            let exhausted = self
                .entries
                .get(&id)
                .map_or(false, |entry| entry.deliveries >= self.max_deliveries);
            if exhausted {
                self.dead_letter(&id, "lease expired after final delivery");
                continue;
            }

            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.deliveries > 0 {
                    debug!(
                        "Redelivering task '{}' (delivery {})",
                        id,
                        entry.deliveries + 1
                    );
                }
                entry.deliveries += 1;
                entry.leased_until = Some(after(now, lease));
                return Some(entry.task.clone());
            }
        }

        None
    }

    /// Removes a task permanently. Returns false if it was not queued.
    pub fn ack(&mut self, id: &TaskId) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                if let Some(ids) = self.queues.get_mut(&entry.queue) {
                    ids.retain(|queued| queued != id);
                }
                true
            }
            None => false,
        }
    }

    /// Releases a leased task after a delivery failure.
    ///
    /// The task is made visible again while deliveries remain, otherwise it
    /// is moved to the dead-letter list.
    pub fn fail(&mut self, id: &TaskId, reason: &str, now: DateTime<Utc>) -> FailOutcome {
        let Some(entry) = self.entries.get_mut(id) else {
            return FailOutcome::Unknown;
        };

        if entry.deliveries < self.max_deliveries {
            entry.leased_until = None;
            entry.visible_at = now;
            if let Some(ids) = self.queues.get_mut(&entry.queue) {
                ids.retain(|queued| queued != id);
                ids.push_back(id.clone());
            }
            debug!("Task '{}' requeued after failure: {}", id, reason);
            FailOutcome::Requeued
        } else {
            self.dead_letter(id, reason);
            FailOutcome::DeadLettered
        }
    }

    /// Pushes the lease of a delivered task out to `until`.
    pub fn extend_lease(&mut self, id: &TaskId, until: DateTime<Utc>) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.leased_until.is_some() => {
                entry.leased_until = Some(until);
                true
            }
            _ => false,
        }
    }

    fn dead_letter(&mut self, id: &TaskId, reason: &str) {
        if let Some(entry) = self.entries.remove(id) {
            warn!(
                "Task '{}' dead-lettered after {} deliveries: {}",
                id, entry.deliveries, reason
            );
            if let Some(ids) = self.queues.get_mut(&entry.queue) {
                ids.retain(|queued| queued != id);
            }
            self.dead_letters.push(DeadLetter {
                task: entry.task,
                queue: entry.queue,
                reason: reason.to_string(),
                deliveries: entry.deliveries,
            });
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of tasks held on `queue`, leased or not.
    pub fn len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total tasks held across all queues.
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    pub fn queue_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Earliest time a currently held task becomes deliverable.
    pub fn next_visible(&self) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .map(|entry| match entry.leased_until {
                Some(until) => until.max(entry.visible_at),
                None => entry.visible_at,
            })
            .min()
    }
}
