//! Workflow Definitions
//!
//! Workflow code must be deterministic: no randomness, no wall-clock reads,
//! no ambient state. Everything variable enters through command results
//! recorded in history.

use super::context::{WorkflowContext, WorkflowResult};
use super::model::Payload;
use crate::error::Failure;

/// Executable workflow code.
pub trait WorkflowDefinition: Send + Sync {
    /// Runs the workflow from the start against the context's history.
    fn run(&self, ctx: &mut WorkflowContext<'_>, input: Payload) -> WorkflowResult;

    /// Checks a start request's input before anything is recorded.
    ///
    /// A rejected input starts nothing.
    fn validate(&self, _input: &Payload) -> Result<(), Failure> {
        Ok(())
    }
}

struct FnWorkflow<F>(F);

impl<F> WorkflowDefinition for FnWorkflow<F>
where
    F: Fn(&mut WorkflowContext<'_>, Payload) -> WorkflowResult + Send + Sync,
{
    fn run(&self, ctx: &mut WorkflowContext<'_>, input: Payload) -> WorkflowResult {
        (self.0)(ctx, input)
    }
}

/// Wraps a function as a [`WorkflowDefinition`] with no input validation.
pub fn workflow_fn<F>(f: F) -> impl WorkflowDefinition
where
    F: Fn(&mut WorkflowContext<'_>, Payload) -> WorkflowResult + Send + Sync,
{
    FnWorkflow(f)
}
