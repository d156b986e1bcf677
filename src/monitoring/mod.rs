//! Monitoring Module
//!
//! Execution timeline of activity attempts, used for timing reports and
//! Gantt charts.

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
