//! Pipeline Workflows
//!
//! Deterministic workflow code: it only issues commands through the
//! context and reads their recorded results, so every replay takes the
//! same path.

use std::time::Duration;

use log::info;
use serde_json::json;

use crate::activity::{ActivityCall, ActivityOptions, RetryPolicy};
use crate::error::{ErrorKind, Failure};
use crate::workflow::{
    to_payload, ChildWorkflowCall, Interrupt, Payload, WorkflowContext, WorkflowDefinition,
    WorkflowResult,
};

use super::{
    AutomationPipelineInput, ImageType, ACCURACY_TASK_QUEUE, ACCURACY_WORKFLOW,
    GEOLOCALIZATION_TASK_QUEUE, GEOLOCALIZATION_WORKFLOW, INGESTION_TASK_QUEUE, INGESTION_WORKFLOW,
    PROCESSOR_TASK_QUEUE, PROCESS_GEOLOCALIZATION, PROCESS_INGESTION, SQRT_ACTIVITY,
};

/// Number of parallel `sqrt_activity` calls made by the accuracy stage.
pub const ACCURACY_FAN_OUT: usize = 20;
pub const ACCURACY_SAMPLE: f64 = 42.0;
pub const SQRT_TIMEOUT: Duration = Duration::from_secs(70);
pub const SQRT_MAX_ATTEMPTS: u32 = 3;

fn unsupported(image_type: &str) -> Failure {
    Failure::unsupported_type(format!("Image type {} is not a supported type.", image_type))
}

/// A stage reports an invalid image with a literal `false`.
fn stage_failed(result: &Payload) -> bool {
    *result == Payload::Bool(false)
}

/// Runs one pipeline stage as a child workflow named `{parent}-{suffix}`.
fn run_stage(
    ctx: &mut WorkflowContext<'_>,
    workflow_type: &str,
    task_queue: &str,
    suffix: &str,
    input: &Payload,
) -> Result<Payload, Interrupt> {
    let child_id = format!("{}-{}", ctx.workflow_id(), suffix);
    if !ctx.is_replaying() {
        info!("Executing {} as '{}'", workflow_type, child_id);
    }
    ctx.execute_child_workflow(
        ChildWorkflowCall::new(workflow_type, input.clone())
            .with_id(child_id)
            .with_task_queue(task_queue),
    )
}

/// Routes an image to the stages for its type.
pub struct AutomationWorkflow;

impl WorkflowDefinition for AutomationWorkflow {
    fn validate(&self, input: &Payload) -> Result<(), Failure> {
        let request: AutomationPipelineInput = serde_json::from_value(input.clone())
            .map_err(|e| Failure::invalid_input(format!("invalid pipeline input: {}", e)))?;
        match ImageType::parse(&request.image_type) {
            Some(_) => Ok(()),
            None => Err(unsupported(&request.image_type)),
        }
    }

    fn run(&self, ctx: &mut WorkflowContext<'_>, input: Payload) -> WorkflowResult {
        let request: AutomationPipelineInput = serde_json::from_value(input.clone())?;

        match ImageType::parse(&request.image_type) {
            Some(ImageType::Navad) => {
                let ingested = run_stage(ctx, INGESTION_WORKFLOW, INGESTION_TASK_QUEUE, "ingestion", &input)?;
                if stage_failed(&ingested) {
                    return to_payload("Automation pipeline failed at ingestion!");
                }

                let accuracy = run_stage(ctx, ACCURACY_WORKFLOW, ACCURACY_TASK_QUEUE, "accuracy", &input)?;
                if stage_failed(&accuracy) {
                    return to_payload("Automation pipeline failed at accuracy!");
                }
                to_payload("Success automation for Navad.")
            }
            Some(ImageType::Satellite) => {
                let located = run_stage(
                    ctx,
                    GEOLOCALIZATION_WORKFLOW,
                    GEOLOCALIZATION_TASK_QUEUE,
                    "geolocalization",
                    &input,
                )?;
                if stage_failed(&located) {
                    return to_payload("Automation pipeline at geolocalization");
                }
                to_payload("Success automation for Satellite.")
            }
            None => Err(Interrupt::Failed(unsupported(&request.image_type))),
        }
    }
}

/// Runs one activity; invalid input becomes the stage's `false` result
/// instead of a failure.
fn validity_stage(ctx: &mut WorkflowContext<'_>, activity_type: &str, input: Payload) -> WorkflowResult {
    match ctx.execute_activity(ActivityCall::new(activity_type, input)) {
        Err(Interrupt::Failed(failure)) if failure.kind == ErrorKind::InvalidInput => {
            info!("{} rejected its input: {}", activity_type, failure.message);
            Ok(json!(false))
        }
        other => other,
    }
}

pub struct IngestionWorkflow;

impl WorkflowDefinition for IngestionWorkflow {
    fn run(&self, ctx: &mut WorkflowContext<'_>, input: Payload) -> WorkflowResult {
        validity_stage(ctx, PROCESS_INGESTION, input)
    }
}

pub struct GeolocalizationWorkflow;

impl WorkflowDefinition for GeolocalizationWorkflow {
    fn run(&self, ctx: &mut WorkflowContext<'_>, input: Payload) -> WorkflowResult {
        validity_stage(ctx, PROCESS_GEOLOCALIZATION, input)
    }
}

/// Fans out square roots over the processor queue and sums them.
///
/// Results are summed in command order, so the total is the same whatever
/// order the activities finish in.
pub struct AccuracyWorkflow;

impl WorkflowDefinition for AccuracyWorkflow {
    fn run(&self, ctx: &mut WorkflowContext<'_>, _input: Payload) -> WorkflowResult {
        let options = ActivityOptions::new(SQRT_TIMEOUT)
            .with_task_queue(PROCESSOR_TASK_QUEUE)
            .with_retry_policy(RetryPolicy::new(SQRT_MAX_ATTEMPTS));

        let handles = (0..ACCURACY_FAN_OUT)
            .map(|_| {
                ctx.schedule_activity(
                    ActivityCall::new(SQRT_ACTIVITY, json!(ACCURACY_SAMPLE))
                        .with_options(options.clone()),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut total = 0.0;
        for result in ctx.join_all(&handles)? {
            let value = result.map_err(Interrupt::Failed)?;
            total += value
                .as_f64()
                .ok_or_else(|| ctx.fail(format!("{} returned {}", SQRT_ACTIVITY, value)))?;
        }

        if !ctx.is_replaying() {
            info!("Accuracy result is {}", total);
        }
        to_payload(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_routes_known_types() {
        let navad = serde_json::to_value(AutomationPipelineInput::new("p", "Navad")).unwrap();
        assert!(AutomationWorkflow.validate(&navad).is_ok());

        let drone = serde_json::to_value(AutomationPipelineInput::new("p", "Drone")).unwrap();
        let failure = AutomationWorkflow.validate(&drone).unwrap_err();
        assert_eq!(failure.kind, ErrorKind::UnsupportedType);
        assert_eq!(failure.message, "Image type Drone is not a supported type.");
    }

    #[test]
    fn test_validate_rejects_malformed_input() {
        let failure = AutomationWorkflow.validate(&json!({"image_path": 7})).unwrap_err();
        assert_eq!(failure.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn test_only_literal_false_fails_a_stage() {
        assert!(stage_failed(&json!(false)));
        assert!(!stage_failed(&json!(true)));
        assert!(!stage_failed(&json!(0.0)));
        assert!(!stage_failed(&Payload::Null));
    }
}
