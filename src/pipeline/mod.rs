//! Automation Pipeline
//!
//! An image-processing pipeline built on the engine. The orchestrating
//! `AutomationWorkflow` routes each image by type to child workflows, each
//! served from its own task queue:
//!
//! - `Navad`: ingestion, then accuracy (a 20-way `sqrt_activity` fan-out)
//! - `Satellite`: geolocalization
//! - anything else is rejected as an unsupported type

pub mod activities;
pub mod workflows;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::activity::{activity_fn, ActivityOptions};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::{Registry, StartWorkflowRequest};

pub use activities::{process_geolocalization, process_ingestion, SqrtActivity};
pub use workflows::{AccuracyWorkflow, AutomationWorkflow, GeolocalizationWorkflow, IngestionWorkflow};

pub const AUTOMATION_TASK_QUEUE: &str = "automation-pipeline-queue";
pub const INGESTION_TASK_QUEUE: &str = "ingestion-task-queue";
pub const ACCURACY_TASK_QUEUE: &str = "accuracy-task-queue";
pub const GEOLOCALIZATION_TASK_QUEUE: &str = "geolocalization-task-queue";
pub const PROCESSOR_TASK_QUEUE: &str = "processor-task-queue";

pub const AUTOMATION_WORKFLOW: &str = "AutomationWorkflow";
pub const INGESTION_WORKFLOW: &str = "IngestionWorkflow";
pub const ACCURACY_WORKFLOW: &str = "AccuracyWorkflow";
pub const GEOLOCALIZATION_WORKFLOW: &str = "GeolocalizationWorkflow";

pub const PROCESS_INGESTION: &str = "process_ingestion";
pub const PROCESS_GEOLOCALIZATION: &str = "process_geolocalization";
pub const SQRT_ACTIVITY: &str = "sqrt_activity";

/// Timeout of the ingestion and geolocalization activities.
const STAGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Input shared by every workflow of the pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AutomationPipelineInput {
    pub image_path: String,
    pub image_type: String,
}

impl AutomationPipelineInput {
    pub fn new(image_path: impl Into<String>, image_type: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            image_type: image_type.into(),
        }
    }
}

/// Image types the pipeline knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Navad,
    Satellite,
}

impl ImageType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Navad" => Some(Self::Navad),
            "Satellite" => Some(Self::Satellite),
            _ => None,
        }
    }
}

/// Tunables for the demo activities.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Heartbeating steps of `sqrt_activity`
    pub sqrt_steps: u32,
    pub sqrt_step_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            sqrt_steps: 6,
            sqrt_step_delay: Duration::from_secs(10),
        }
    }
}

/// Registers every pipeline workflow and activity.
pub fn build_registry(options: &PipelineOptions) -> Result<Registry, EngineError> {
    let mut registry = Registry::new();

    registry.register_workflow(AUTOMATION_WORKFLOW, AutomationWorkflow)?;
    registry.register_workflow(INGESTION_WORKFLOW, IngestionWorkflow)?;
    registry.register_workflow(GEOLOCALIZATION_WORKFLOW, GeolocalizationWorkflow)?;
    registry.register_workflow(ACCURACY_WORKFLOW, AccuracyWorkflow)?;

    registry.register_activity(
        PROCESS_INGESTION,
        ActivityOptions::new(STAGE_TIMEOUT).with_task_queue(INGESTION_TASK_QUEUE),
        activity_fn(process_ingestion),
    )?;
    registry.register_activity(
        PROCESS_GEOLOCALIZATION,
        ActivityOptions::new(STAGE_TIMEOUT).with_task_queue(GEOLOCALIZATION_TASK_QUEUE),
        activity_fn(process_geolocalization),
    )?;
    registry.register_activity(
        SQRT_ACTIVITY,
        ActivityOptions::new(workflows::SQRT_TIMEOUT).with_task_queue(PROCESSOR_TASK_QUEUE),
        SqrtActivity::new(options.sqrt_steps, options.sqrt_step_delay),
    )?;

    Ok(registry)
}

/// Engine configuration with workers on every pipeline queue. The
/// processor queue gets one thread per fan-out branch.
pub fn engine_config(threads: usize) -> EngineConfig {
    EngineConfig::default()
        .with_worker(AUTOMATION_TASK_QUEUE, threads)
        .with_worker(INGESTION_TASK_QUEUE, threads)
        .with_worker(ACCURACY_TASK_QUEUE, threads)
        .with_worker(GEOLOCALIZATION_TASK_QUEUE, threads)
        .with_worker(PROCESSOR_TASK_QUEUE, workflows::ACCURACY_FAN_OUT)
}

/// Start request for one pipeline run, tagged with memo and search
/// attributes.
pub fn start_request(
    workflow_id: &str,
    input: &AutomationPipelineInput,
) -> Result<StartWorkflowRequest, EngineError> {
    let request = StartWorkflowRequest::new(
        AUTOMATION_WORKFLOW,
        AUTOMATION_TASK_QUEUE,
        workflow_id,
        serde_json::to_value(input)?,
    )
    .with_memo(
        "description",
        json!(format!("{} auto-processing run", input.image_type)),
    )
    .with_memo("initiated_by", json!("api"))
    .with_search_attribute("CustomStringField", json!(workflow_id))
    .with_search_attribute("CustomKeywordField", json!(input.image_type.to_lowercase()))
    .with_search_attribute("CustomIntField", json!(42))
    .with_search_attribute("CustomBoolField", json!(true));

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::execution::Engine;
    use crate::monitoring::EventType;
    use crate::workflow::{MemoryHistoryStore, WorkflowOutcome};
    use std::sync::Arc;

    fn fast_options() -> PipelineOptions {
        PipelineOptions {
            sqrt_steps: 2,
            sqrt_step_delay: Duration::ZERO,
        }
    }

    fn engine() -> Engine {
        Engine::with_store(
            EngineConfig::default(),
            build_registry(&fast_options()).unwrap(),
            Box::new(MemoryHistoryStore::new()),
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    fn run(engine: &Engine, id: &str, input: AutomationPipelineInput) -> WorkflowOutcome {
        engine
            .start_workflow(start_request(id, &input).unwrap())
            .unwrap();
        engine.run_until_idle().unwrap();
        engine.query(id).unwrap()
    }

    #[test]
    fn test_navad_pipeline_succeeds() {
        let engine = engine();
        let outcome = run(&engine, "auto-1", AutomationPipelineInput::new("My_path", "Navad"));
        assert_eq!(
            outcome,
            WorkflowOutcome::Completed(json!("Success automation for Navad."))
        );

        assert_eq!(
            engine.query("auto-1-ingestion").unwrap(),
            WorkflowOutcome::Completed(json!(true))
        );
        match engine.query("auto-1-accuracy").unwrap() {
            WorkflowOutcome::Completed(sum) => {
                let sum = sum.as_f64().unwrap();
                assert!((sum - 20.0 * 42f64.sqrt()).abs() < 1e-9);
                assert!((sum - 129.615).abs() < 1e-3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let timeline = engine.timeline();
        assert_eq!(timeline.count(EventType::Started), 21);
        assert_eq!(timeline.count(EventType::Completed), 21);
    }

    #[test]
    fn test_satellite_pipeline_succeeds() {
        let engine = engine();
        let outcome = run(&engine, "auto-2", AutomationPipelineInput::new("/img/2.tif", "Satellite"));
        assert_eq!(
            outcome,
            WorkflowOutcome::Completed(json!("Success automation for Satellite."))
        );
        assert!(engine.query("auto-2-geolocalization").is_ok());
        assert!(engine.query("auto-2-ingestion").is_err());
    }

    #[test]
    fn test_unsupported_type_starts_nothing() {
        let engine = engine();
        let input = AutomationPipelineInput::new("/img/3.tif", "Drone");
        let err = engine
            .start_workflow(start_request("auto-3", &input).unwrap())
            .unwrap_err();

        assert_eq!(err.failure_kind(), Some(ErrorKind::UnsupportedType));
        assert!(err.to_string().contains("Image type Drone is not a supported type."));
        assert_eq!(engine.run_until_idle().unwrap(), 0);
        assert!(engine.query("auto-3").is_err());
        assert!(engine.query("auto-3-ingestion").is_err());
    }

    #[test]
    fn test_invalid_ingestion_stops_pipeline() {
        let engine = engine();
        let outcome = run(&engine, "auto-4", AutomationPipelineInput::new("  ", "Navad"));
        assert_eq!(
            outcome,
            WorkflowOutcome::Completed(json!("Automation pipeline failed at ingestion!"))
        );
        assert_eq!(
            engine.query("auto-4-ingestion").unwrap(),
            WorkflowOutcome::Completed(json!(false))
        );
        assert!(engine.query("auto-4-accuracy").is_err());
    }

    #[test]
    fn test_memo_and_search_attributes_visible() {
        let engine = engine();
        run(&engine, "auto-5", AutomationPipelineInput::new("My_path", "Satellite"));

        let info = engine.describe("auto-5").unwrap();
        assert_eq!(info.memo.get("initiated_by"), Some(&json!("api")));
        assert_eq!(
            info.memo.get("description"),
            Some(&json!("Satellite auto-processing run"))
        );
        assert_eq!(info.search_attributes.get("CustomKeywordField"), Some(&json!("satellite")));
        assert_eq!(info.search_attributes.get("CustomIntField"), Some(&json!(42)));
        assert_eq!(info.search_attributes.get("CustomBoolField"), Some(&json!(true)));

        let child = engine.describe("auto-5-geolocalization").unwrap();
        assert_eq!(child.task_queue, GEOLOCALIZATION_TASK_QUEUE);
        assert_eq!(child.parent.unwrap().workflow_id, "auto-5");
    }

    #[test]
    fn test_pipeline_on_worker_threads() {
        let config = engine_config(2)
            .with_poll_interval(Duration::from_millis(5))
            .with_sweep_interval(Duration::from_millis(10));
        let options = PipelineOptions {
            sqrt_steps: 3,
            sqrt_step_delay: Duration::from_millis(2),
        };
        let engine = Arc::new(Engine::new(config, build_registry(&options).unwrap()).unwrap());
        let pool = engine.spawn_workers().unwrap();

        let input = AutomationPipelineInput::new("My_path", "Navad");
        engine
            .start_workflow(start_request("auto-6", &input).unwrap())
            .unwrap();
        let outcome = engine
            .wait_for_outcome("auto-6", Duration::from_secs(30))
            .unwrap();
        pool.shutdown();

        assert_eq!(
            outcome,
            WorkflowOutcome::Completed(json!("Success automation for Navad."))
        );
    }
}
