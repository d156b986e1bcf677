//! Replay Engine
//!
//! Turns (workflow code, history) into the next decision. Replay is a pure
//! function: the same definition and history always produce the same
//! commands and decision, which is what makes crash recovery possible.

use std::sync::Arc;

use log::{debug, warn};

use super::context::{Command, Interrupt, WorkflowContext};
use super::definition::WorkflowDefinition;
use super::model::{Payload, WorkflowExecution};
use crate::error::{EngineError, Failure};
use crate::registry::Registry;

/// What the run should do after this replay.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Wait for pending commands
    Suspended,
    Completed(Payload),
    Failed(Failure),
    Cancelled(String),
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Suspended)
    }
}

/// New commands plus the decision produced by one replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub commands: Vec<Command>,
    pub decision: Decision,
}

/// Replays workflow runs using definitions from the registry.
#[derive(Clone)]
pub struct WorkflowEngine {
    registry: Arc<Registry>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn replay(&self, execution: &WorkflowExecution) -> Result<ReplayOutcome, EngineError> {
        let definition = self.registry.workflow(&execution.workflow_type)?;
        replay_with(definition.as_ref(), execution)
    }
}

/// Replays `execution` from the start with `definition`.
///
/// Fails with [`EngineError::Nondeterminism`] when the code issues a
/// command that history contradicts, or stops before re-issuing every
/// command history records.
pub fn replay_with(
    definition: &dyn WorkflowDefinition,
    execution: &WorkflowExecution,
) -> Result<ReplayOutcome, EngineError> {
    let mut ctx = WorkflowContext::new(execution);
    let result = definition.run(&mut ctx, execution.input.clone());
    let (mut commands, issued) = ctx.into_commands();

    let nondeterminism = |message: String| EngineError::Nondeterminism {
        workflow_id: execution.workflow_id.clone(),
        message,
    };

    if let Err(Interrupt::Nondeterminism(message)) = &result {
        return Err(nondeterminism(message.clone()));
    }
    if let Some(highest) = execution.history().highest_seq() {
        if highest >= issued {
            return Err(nondeterminism(format!(
                "history records command {} but replay issued only {} commands",
                highest, issued
            )));
        }
    }

    let decision = match result {
        Ok(value) => Decision::Completed(value),
        Err(Interrupt::Failed(failure)) => Decision::Failed(failure),
        Err(Interrupt::Cancelled(reason)) => Decision::Cancelled(reason),
        Err(Interrupt::Suspended) => match execution.history().cancel_requested() {
            Some(reason) => Decision::Cancelled(reason.to_string()),
            None if commands.is_empty() && execution.pending.is_empty() => {
                Decision::Failed(Failure::workflow(
                    "workflow suspended with no pending commands",
                ))
            }
            None => Decision::Suspended,
        },
        Err(Interrupt::Nondeterminism(message)) => return Err(nondeterminism(message)),
    };

    if decision.is_terminal() && !commands.is_empty() {
        warn!(
            "Workflow '{}' closed with {} unissued commands - discarding them",
            execution.workflow_id,
            commands.len()
        );
        commands.clear();
    }

    debug!(
        "Replayed '{}' ({} events): {} new commands, decision {:?}",
        execution.workflow_id,
        execution.history().len(),
        commands.len(),
        decision
    );

    Ok(ReplayOutcome { commands, decision })
}
