//! Pipeline Activities
//!
//! Side-effecting work of the pipeline. These run on worker threads,
//! outside the scheduler lock, and may be retried.

use std::thread;
use std::time::Duration;

use log::info;
use serde_json::json;

use crate::activity::{Activity, ActivityContext};
use crate::error::ActivityError;
use crate::workflow::Payload;

use super::AutomationPipelineInput;

fn parse_input(input: Payload) -> Result<AutomationPipelineInput, ActivityError> {
    Ok(serde_json::from_value(input)?)
}

/// Ingests the image at `image_path`.
pub fn process_ingestion(ctx: &ActivityContext, input: Payload) -> Result<Payload, ActivityError> {
    let request = parse_input(input)?;
    if request.image_path.trim().is_empty() {
        return Err(ActivityError::InvalidInput("image path is empty".into()));
    }

    info!(
        "Ingested '{}' (attempt {})",
        request.image_path,
        ctx.attempt()
    );
    Ok(json!(true))
}

/// Geolocates an image of a supported type.
pub fn process_geolocalization(
    ctx: &ActivityContext,
    input: Payload,
) -> Result<Payload, ActivityError> {
    let request = parse_input(input)?;
    if request.image_type.trim().is_empty() {
        return Err(ActivityError::InvalidInput("image type is empty".into()));
    }

    info!(
        "Geolocalized '{}' (attempt {})",
        request.image_path,
        ctx.attempt()
    );
    Ok(json!(true))
}

/// Slow square root that reports progress before each step.
#[derive(Debug, Clone, PartialEq)]
pub struct SqrtActivity {
    steps: u32,
    step_delay: Duration,
}

impl SqrtActivity {
    pub fn new(steps: u32, step_delay: Duration) -> Self {
        Self { steps, step_delay }
    }
}

impl Activity for SqrtActivity {
    fn execute(&self, ctx: &ActivityContext, input: Payload) -> Result<Payload, ActivityError> {
        let number = input
            .as_f64()
            .ok_or_else(|| ActivityError::InvalidInput(format!("expected a number, got {}", input)))?;
        if number < 0.0 {
            return Err(ActivityError::InvalidInput(format!(
                "cannot take the square root of {}",
                number
            )));
        }

        let total = self.step_delay * self.steps;
        for step in 1..=self.steps {
            ctx.heartbeat(format!(
                "Progress: {:?} / {:?}",
                self.step_delay * step,
                total
            ))?;
            thread::sleep(self.step_delay);
        }

        Ok(json!(number.sqrt()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityInfo, HeartbeatSink};
    use crate::error::EngineError;
    use crate::queue::TaskId;
    use crate::workflow::RunId;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        beats: Mutex<Vec<Payload>>,
    }

    impl HeartbeatSink for RecordingSink {
        fn record_heartbeat(&self, _task_id: &TaskId, progress: Payload) -> Result<(), EngineError> {
            self.beats.lock().unwrap().push(progress);
            Ok(())
        }
    }

    fn context(sink: Arc<RecordingSink>) -> ActivityContext {
        let run_id = RunId::new("wf-accuracy.1");
        ActivityContext::new(
            ActivityInfo {
                task_id: TaskId::activity(&run_id, 0, 1),
                activity_type: "sqrt_activity".into(),
                workflow_id: "wf-accuracy".into(),
                run_id,
                seq: 0,
                attempt: 1,
                task_queue: "processor-task-queue".into(),
            },
            sink,
        )
    }

    #[test]
    fn test_sqrt_heartbeats_each_step() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = context(sink.clone());
        let activity = SqrtActivity::new(6, Duration::ZERO);

        assert_eq!(activity.execute(&ctx, json!(42.0)).unwrap(), json!(42f64.sqrt()));
        assert_eq!(sink.beats.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_sqrt_rejects_bad_input() {
        let ctx = context(Arc::new(RecordingSink::default()));
        let activity = SqrtActivity::new(1, Duration::ZERO);

        assert!(matches!(
            activity.execute(&ctx, json!("x")),
            Err(ActivityError::InvalidInput(_))
        ));
        assert!(matches!(
            activity.execute(&ctx, json!(-4.0)),
            Err(ActivityError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_ingestion_validates_path() {
        let ctx = context(Arc::new(RecordingSink::default()));
        let ok = serde_json::to_value(AutomationPipelineInput::new("My_path", "Navad")).unwrap();
        assert_eq!(process_ingestion(&ctx, ok).unwrap(), json!(true));

        let empty = serde_json::to_value(AutomationPipelineInput::new("", "Navad")).unwrap();
        assert!(matches!(
            process_ingestion(&ctx, empty),
            Err(ActivityError::InvalidInput(_))
        ));
        assert!(matches!(
            process_geolocalization(&ctx, json!({"image_path": 3})),
            Err(ActivityError::InvalidInput(_))
        ));
    }
}
