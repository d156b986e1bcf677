//! DuraFlow - Durable Workflow Execution Engine
//!
//! Runs long-lived workflows whose progress survives worker crashes.
//! Workflow code is replayed against an append-only history, so it resumes
//! exactly where it left off; side effects live in activities, which are
//! retried with backoff and bounded by timeouts.
//!
//! # Architecture
//!
//! - [`queue`]: Named task queues with leases and deduplication
//! - [`activity`]: Activity trait, options, retry policy and executor
//! - [`workflow`]: History, replay engine and workflow context
//! - [`registry`]: Type-name dispatch for workflows and activities
//! - [`execution`]: Scheduler and the engine runtime with its worker pool
//! - [`config`]: Engine configuration loading and validation
//! - [`monitoring`]: Activity attempt timeline
//! - [`pipeline`]: The image automation pipeline built on the engine
//!
//! # Example
//!
//! ```rust,no_run
//! use duraflow::pipeline::{self, AutomationPipelineInput, PipelineOptions};
//! use duraflow::Engine;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = pipeline::build_registry(&PipelineOptions::default())?;
//!     let engine = Arc::new(Engine::new(pipeline::engine_config(2), registry)?);
//!     let workers = engine.spawn_workers()?;
//!
//!     let input = AutomationPipelineInput::new("My_path", "Navad");
//!     let id = engine.start_workflow(pipeline::start_request("automation-1", &input)?)?;
//!     println!("{:?}", engine.wait_for_outcome(&id, Duration::from_secs(600))?);
//!
//!     workers.shutdown();
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod clock;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod workflow;

// Re-export commonly used types
pub use config::{load_config, EngineConfig};
pub use error::{EngineError, ErrorKind, Failure};
pub use execution::{Engine, WorkerPool};
pub use registry::{Registry, StartWorkflowRequest};
pub use workflow::{WorkflowContext, WorkflowDefinition, WorkflowOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "DuraFlow";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "DuraFlow");
    }

    #[test]
    fn test_module_exports_engine() {
        let mut registry = Registry::new();
        registry
            .register_workflow("Echo", workflow::workflow_fn(|_ctx, input| Ok(input)))
            .unwrap();
        let engine = Engine::new(EngineConfig::default(), registry).unwrap();

        engine
            .start_workflow(StartWorkflowRequest::new("Echo", "main", "echo", json!("hi")))
            .unwrap();
        engine.run_until_idle().unwrap();
        assert_eq!(engine.query("echo").unwrap(), WorkflowOutcome::Completed(json!("hi")));
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
