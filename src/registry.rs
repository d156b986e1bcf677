//! Workflow Registry & Dispatch
//!
//! Maps workflow and activity type names to executable definitions.
//! Lookups happen when a run starts or a command is scheduled; a miss is an
//! `UnsupportedType` error, never a silent no-op.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::activity::{Activity, ActivityCall, ActivityOptions};
use crate::config::validate_activity_options;
use crate::error::{EngineError, Failure};
use crate::workflow::{Payload, WorkflowDefinition};

/// A registered activity and its default options.
#[derive(Clone)]
pub struct RegisteredActivity {
    pub options: ActivityOptions,
    pub activity: Arc<dyn Activity>,
}

/// Returned by activity registration; builds calls to that activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityHandle {
    name: String,
}

impl ActivityHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, input: Payload) -> ActivityCall {
        ActivityCall::new(self.name.clone(), input)
    }
}

/// A request to start a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflowRequest {
    pub workflow_type: String,
    pub task_queue: String,
    pub workflow_id: String,
    pub input: Payload,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,

    /// Limit on the whole run, measured from start
    pub execution_timeout: Option<Duration>,
}

impl StartWorkflowRequest {
    pub fn new(
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        workflow_id: impl Into<String>,
        input: Payload,
    ) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            workflow_id: workflow_id.into(),
            input,
            memo: BTreeMap::new(),
            search_attributes: BTreeMap::new(),
            execution_timeout: None,
        }
    }

    pub fn with_memo(mut self, key: impl Into<String>, value: Payload) -> Self {
        self.memo.insert(key.into(), value);
        self
    }

    pub fn with_search_attribute(mut self, key: impl Into<String>, value: Payload) -> Self {
        self.search_attributes.insert(key.into(), value);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Type-name keyed workflow and activity definitions.
#[derive(Default, Clone)]
pub struct Registry {
    workflows: HashMap<String, Arc<dyn WorkflowDefinition>>,
    activities: HashMap<String, RegisteredActivity>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(
        &mut self,
        name: impl Into<String>,
        definition: impl WorkflowDefinition + 'static,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if self.workflows.contains_key(&name) {
            return Err(EngineError::DuplicateRegistration {
                kind: "workflow",
                name,
            });
        }

        debug!("Registered workflow type '{}'", name);
        self.workflows.insert(name, Arc::new(definition));
        Ok(())
    }

    /// Registers an activity with its default timeout and retry policy.
    pub fn register_activity(
        &mut self,
        name: impl Into<String>,
        options: ActivityOptions,
        activity: impl Activity + 'static,
    ) -> Result<ActivityHandle, EngineError> {
        let name = name.into();
        if self.activities.contains_key(&name) {
            return Err(EngineError::DuplicateRegistration {
                kind: "activity",
                name,
            });
        }
        validate_activity_options(&options).map_err(|e| {
            EngineError::InvalidConfig(format!("activity '{}': {}", name, e))
        })?;

        debug!(
            "Registered activity type '{}' (start-to-close {:?}, {} attempts)",
            name, options.start_to_close_timeout, options.retry_policy.maximum_attempts
        );
        self.activities.insert(
            name.clone(),
            RegisteredActivity {
                options,
                activity: Arc::new(activity),
            },
        );
        Ok(ActivityHandle { name })
    }

    pub fn workflow(&self, name: &str) -> Result<Arc<dyn WorkflowDefinition>, EngineError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::unsupported("workflow", name))
    }

    pub fn activity(&self, name: &str) -> Option<&RegisteredActivity> {
        self.activities.get(name)
    }

    pub fn workflow_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn activity_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolves the queue and options an activity call runs with.
    ///
    /// Call-site options replace the registered ones; the queue falls back
    /// to the registered queue, then to `fallback_queue`.
    pub fn resolve_activity_options(
        &self,
        call: &ActivityCall,
        fallback_queue: &str,
    ) -> Result<(String, ActivityOptions), Failure> {
        let registered = self.activity(&call.activity_type).ok_or_else(|| {
            Failure::unsupported_type(format!(
                "activity type '{}' is not registered",
                call.activity_type
            ))
        })?;

        let mut options = call
            .options
            .clone()
            .unwrap_or_else(|| registered.options.clone());
        if call.options.is_some() {
            validate_activity_options(&options).map_err(|e| {
                Failure::workflow(format!(
                    "invalid options for activity '{}': {}",
                    call.activity_type, e
                ))
            })?;
        }

        let queue = options
            .task_queue
            .clone()
            .or_else(|| registered.options.task_queue.clone())
            .unwrap_or_else(|| fallback_queue.to_string());
        options.task_queue = Some(queue.clone());
        Ok((queue, options))
    }

    /// Routes a start request to its definition and checks its input.
    ///
    /// Nothing is recorded when this fails.
    pub fn prepare_start(
        &self,
        request: &StartWorkflowRequest,
    ) -> Result<Arc<dyn WorkflowDefinition>, EngineError> {
        if request.workflow_id.trim().is_empty() {
            return Err(EngineError::Rejected(Failure::invalid_input(
                "workflow id must not be empty",
            )));
        }
        if request.task_queue.trim().is_empty() {
            return Err(EngineError::Rejected(Failure::invalid_input(
                "task queue must not be empty",
            )));
        }

        let definition = self.workflow(&request.workflow_type)?;
        if let Err(failure) = definition.validate(&request.input) {
            info!(
                "Rejected start of '{}' ({}): {}",
                request.workflow_id, request.workflow_type, failure
            );
            return Err(EngineError::Rejected(failure));
        }
        Ok(definition)
    }
}
