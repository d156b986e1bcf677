//! Error Types
//!
//! Two families of errors live here:
//!
//! - [`EngineError`]: returned by the engine API (registration, start,
//!   query, storage). These never enter workflow history.
//! - [`Failure`]: the serializable failure payload recorded in history when
//!   an activity, child workflow or workflow run fails. Workflows receive
//!   these as resolved command results and decide whether they are fatal.
//!
//! [`ActivityError`] is what activity code returns; the executor converts it
//! into a [`Failure`] tagged with the attempt number.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which deadline expired for an activity attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    StartToClose,
    Heartbeat,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartToClose => write!(f, "start-to-close"),
            Self::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Classification of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Activity code returned an error
    ActivityExecution,
    /// Activity rejected its input; never retried
    InvalidInput,
    /// Start-to-close or heartbeat deadline expired
    ActivityTimeout,
    /// Replay diverged from recorded history
    WorkflowNondeterminism,
    /// Unregistered workflow/activity type or unknown input discriminant
    UnsupportedType,
    /// A child workflow ended without success
    ChildWorkflowFailure,
    /// Workflow code itself failed
    WorkflowExecution,
    /// Workflow run exceeded its execution timeout
    WorkflowTimeout,
    /// Work was abandoned because of a cancellation request
    Cancelled,
}

impl ErrorKind {
    /// Returns true for kinds the retry policy is allowed to retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ActivityExecution | Self::ActivityTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ActivityExecution => "ActivityExecutionError",
            Self::InvalidInput => "InvalidInputError",
            Self::ActivityTimeout => "ActivityTimeoutError",
            Self::WorkflowNondeterminism => "WorkflowNondeterminismError",
            Self::UnsupportedType => "UnsupportedTypeError",
            Self::ChildWorkflowFailure => "ChildWorkflowFailure",
            Self::WorkflowExecution => "WorkflowExecutionError",
            Self::WorkflowTimeout => "WorkflowTimeoutError",
            Self::Cancelled => "CancelledError",
        };
        write!(f, "{}", name)
    }
}

/// Failure payload recorded in workflow history and returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message} (attempts: {attempts})")]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,

    /// Number of attempts made before the failure became terminal
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutKind>,

    /// Set when the failing code asked not to be retried
    #[serde(default)]
    pub non_retryable: bool,

    /// Underlying failure, e.g. the child's own failure for a child workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: 0,
            timeout: None,
            non_retryable: false,
            cause: None,
        }
    }

    pub fn activity_execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActivityExecution, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn activity_timeout(timeout: TimeoutKind, activity_type: &str) -> Self {
        let mut failure = Self::new(
            ErrorKind::ActivityTimeout,
            format!("activity '{}' exceeded its {} timeout", activity_type, timeout),
        );
        failure.timeout = Some(timeout);
        failure
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedType, message)
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkflowNondeterminism, message)
    }

    pub fn workflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkflowExecution, message)
    }

    pub fn workflow_timeout(workflow_type: &str) -> Self {
        Self::new(
            ErrorKind::WorkflowTimeout,
            format!("workflow '{}' exceeded its execution timeout", workflow_type),
        )
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, reason)
    }

    /// Wraps the terminal failure of a child workflow for delivery to its parent.
    pub fn child_workflow(workflow_type: &str, cause: Failure) -> Self {
        let mut failure = Self::new(
            ErrorKind::ChildWorkflowFailure,
            format!("child workflow '{}' failed: {}", workflow_type, cause.message),
        );
        failure.attempts = cause.attempts;
        failure.cause = Some(Box::new(cause));
        failure
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self
    }

    /// Returns true if a retry policy may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !self.non_retryable && self.kind.is_retryable()
    }

    /// Walks the cause chain and returns the innermost failure.
    pub fn root_cause(&self) -> &Failure {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

/// Error returned by activity code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActivityError {
    /// Retryable application failure
    #[error("activity failed: {0}")]
    Failed(String),

    /// The input was unusable; retrying cannot help
    #[error("invalid activity input: {0}")]
    InvalidInput(String),

    /// Application failure that must not be retried
    #[error("activity failed permanently: {0}")]
    NonRetryable(String),
}

impl ActivityError {
    /// Converts into the failure recorded for the given attempt.
    pub fn into_failure(self, attempt: u32) -> Failure {
        let failure = match self {
            Self::Failed(message) => Failure::activity_execution(message),
            Self::InvalidInput(message) => Failure::invalid_input(message),
            Self::NonRetryable(message) => {
                Failure::activity_execution(message).with_non_retryable()
            }
        };
        failure.with_attempts(attempt)
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

/// Errors returned by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported {kind} type '{name}'")]
    UnsupportedType { kind: &'static str, name: String },

    #[error("{kind} type '{name}' is already registered")]
    DuplicateRegistration { kind: &'static str, name: String },

    #[error("workflow '{0}' already has an open run")]
    AlreadyStarted(String),

    #[error("no execution found for '{0}'")]
    ExecutionNotFound(String),

    #[error("execution '{0}' is already closed")]
    ExecutionClosed(String),

    #[error("nondeterminism detected in workflow '{workflow_id}': {message}")]
    Nondeterminism { workflow_id: String, message: String },

    #[error("start rejected: {0}")]
    Rejected(Failure),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown or abandoned task '{0}'")]
    UnknownTask(String),

    #[error("corrupt history for run '{run_id}': {message}")]
    CorruptHistory { run_id: String, message: String },

    #[error("timed out waiting for workflow '{0}'")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

impl EngineError {
    pub fn unsupported(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            kind,
            name: name.into(),
        }
    }

    /// Converts a start-time error into the failure a parent workflow sees.
    pub fn to_failure(&self) -> Failure {
        match self {
            Self::UnsupportedType { .. } => Failure::unsupported_type(self.to_string()),
            Self::Rejected(failure) => failure.clone(),
            Self::Nondeterminism { message, .. } => Failure::nondeterminism(message.clone()),
            other => Failure::workflow(other.to_string()),
        }
    }

    /// The failure kind this error corresponds to, if any.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::UnsupportedType { .. } => Some(ErrorKind::UnsupportedType),
            Self::Rejected(failure) => Some(failure.kind),
            Self::Nondeterminism { .. } => Some(ErrorKind::WorkflowNondeterminism),
            _ => None,
        }
    }
}
