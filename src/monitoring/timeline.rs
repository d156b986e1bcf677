//! Execution Timeline
//!
//! Tracks activity attempt start/end times for generating execution
//! reports and Gantt charts. Timestamps come from the engine clock, so
//! timelines recorded under a manual clock are deterministic. Only the
//! most recent events are kept; older ones are dropped first.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::config::DEFAULT_TIMELINE_CAPACITY;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Attempt started executing
    Started,
    /// Attempt completed successfully
    Completed,
    /// Attempt failed and will not be retried
    Failed,
    /// Attempt exceeded a deadline
    TimedOut,
    /// Attempt failed and another was scheduled
    Retried,
}

impl EventType {
    fn ends_attempt(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    /// Attempt label, e.g. `sqrt_activity wf-accuracy#3.1`
    pub label: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Tracks the execution timeline of activity attempts.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: VecDeque<TimelineEvent>,
    capacity: usize,
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TIMELINE_CAPACITY)
    }
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a timeline that keeps at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Records an event for an attempt, evicting the oldest when full.
    pub fn add_event(&mut self, label: impl Into<String>, event_type: EventType, at: DateTime<Utc>) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(TimelineEvent {
            label: label.into(),
            event_type,
            timestamp: at,
        });
    }

    pub fn get_events(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events of a given type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|event| event.timestamp).min()
    }

    /// Time between the first and the last recorded event.
    pub fn elapsed(&self) -> chrono::Duration {
        let end = self.events.iter().map(|event| event.timestamp).max();
        match (self.start_time(), end) {
            (Some(start), Some(end)) => end - start,
            _ => chrono::Duration::zero(),
        }
    }

    /// Returns attempt durations in milliseconds, up to the first event
    /// that ended each attempt.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        let mut starts: HashMap<&str, DateTime<Utc>> = HashMap::new();
        let mut durations: HashMap<String, i64> = HashMap::new();

        for event in &self.events {
            if event.event_type == EventType::Started {
                starts.insert(&event.label, event.timestamp);
            } else if let Some(start) = starts.get(event.label.as_str()) {
                durations
                    .entry(event.label.clone())
                    .or_insert((event.timestamp - *start).num_milliseconds());
            }
        }

        durations
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each attempt is shown as a bar indicating when it ran relative to
    /// the whole timeline, marked by how it ended.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let Some(start_time) = self.start_time() else {
            return output;
        };
        let total_time = self.elapsed().num_milliseconds();
        if total_time <= 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut spans: HashMap<&str, (i64, Option<(i64, EventType)>)> = HashMap::new();
        for event in &self.events {
            let elapsed = (event.timestamp - start_time).num_milliseconds();
            if event.event_type == EventType::Started {
                spans.insert(&event.label, (elapsed, None));
            } else if event.event_type.ends_attempt() {
                if let Some(span) = spans.get_mut(event.label.as_str()) {
                    span.1.get_or_insert((elapsed, event.event_type));
                }
            }
        }

        let mut sorted: Vec<_> = spans.into_iter().collect();
        sorted.sort_by(|a, b| (a.1 .0, a.0).cmp(&(b.1 .0, b.0)));

        for (label, (start, end)) in sorted {
            let Some((end, how)) = end else { continue };
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;
            let mark = match how {
                EventType::Completed => "#",
                EventType::TimedOut => "~",
                _ => "x",
            };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{:24} |{:50}| ({} ms)\n",
                truncate(label, 24),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.is_empty());
        assert!(timeline.get_events().next().is_none());
        assert_eq!(timeline.elapsed(), chrono::Duration::zero());
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("a#0.1", EventType::Started, at(0));
        timeline.add_event("a#0.1", EventType::Completed, at(50));
        timeline.add_event("b#1.1", EventType::Started, at(10));

        let durations = timeline.get_durations();
        assert_eq!(durations.get("a#0.1"), Some(&50));
        assert!(!durations.contains_key("b#1.1"));
    }

    #[test]
    fn test_count_by_type() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("a#0.1", EventType::Started, at(0));
        timeline.add_event("a#0.1", EventType::Retried, at(5));
        timeline.add_event("a#0.2", EventType::Started, at(10));
        timeline.add_event("a#0.2", EventType::TimedOut, at(20));

        assert_eq!(timeline.count(EventType::Started), 2);
        assert_eq!(timeline.count(EventType::Retried), 1);
        assert_eq!(timeline.count(EventType::Completed), 0);
        assert_eq!(timeline.elapsed(), chrono::Duration::milliseconds(20));
    }

    #[test]
    fn test_oldest_events_evicted_at_capacity() {
        let mut timeline = ExecutionTimeline::with_capacity(3);
        timeline.add_event("a#0.1", EventType::Started, at(0));
        timeline.add_event("a#0.1", EventType::Completed, at(10));
        timeline.add_event("b#1.1", EventType::Started, at(20));
        timeline.add_event("b#1.1", EventType::Completed, at(30));

        assert_eq!(timeline.len(), 3);
        let labels: Vec<&str> = timeline.get_events().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["a#0.1", "b#1.1", "b#1.1"]);
        assert_eq!(timeline.count(EventType::Started), 1);
        assert_eq!(timeline.get_durations().get("b#1.1"), Some(&10));
        assert!(!timeline.get_durations().contains_key("a#0.1"));
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("step1", EventType::Started, at(0));
        timeline.add_event("step1", EventType::Completed, at(50));
        timeline.add_event("step2", EventType::Started, at(50));
        timeline.add_event("step2", EventType::TimedOut, at(100));

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains('~'));
        assert!(chart.contains("Total: 100 ms"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::new().gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-activity-label", 10), "a-very-...");
    }
}
