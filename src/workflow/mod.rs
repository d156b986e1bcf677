//! Workflow Module
//!
//! Durable workflow runs: their history, the replay engine that advances
//! them, and the context workflow code is written against.
//!
//! # Structure
//!
//! - [`model`]: Execution identity, status and outcome
//! - [`history`]: Append-only event log
//! - [`context`]: Command API used by workflow code
//! - [`definition`]: The workflow trait
//! - [`engine`]: Deterministic replay
//! - [`state`]: History persistence

pub mod context;
pub mod definition;
pub mod engine;
pub mod history;
pub mod model;
pub mod state;

pub use context::{
    to_payload, ChildWorkflowCall, Command, CommandHandle, Interrupt, WorkflowContext,
    WorkflowResult,
};
pub use definition::{workflow_fn, WorkflowDefinition};
pub use engine::{replay_with, Decision, ReplayOutcome, WorkflowEngine};
pub use history::{CommandKind, CommandResult, HistoryEntry, HistoryEvent, WorkflowHistory};
pub use model::{
    ExecutionStatus, ParentLink, Payload, RunId, WorkflowExecution, WorkflowInfo, WorkflowOutcome,
};
pub use state::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
