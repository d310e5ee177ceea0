//! Core error taxonomy and the structured error payload carried by ticks.

use serde::{Deserialize, Serialize};

/// Errors raised by the control-plane core itself.
///
/// These indicate definition or programmer errors (mismatched snapshots,
/// invalid state transitions, malformed cron expressions) and are never
/// retried. Storage failures live in `backends::BackendError` instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("execution plan targets pipeline snapshot {plan} but the index identifies as {index}")]
    SnapshotMismatch { plan: String, index: String },
    #[error("job {job_name} of type {job_type} has invalid job data: {reason}")]
    InvalidJobData {
        job_name: String,
        job_type: String,
        reason: String,
    },
    #[error("tick with status {status} is invalid: {reason}")]
    InvalidTick { status: String, reason: String },
    #[error("step {step_key} is not part of the execution plan")]
    UnknownStepKey { step_key: String },
    #[error("dependency cycle among steps: {}", remaining.join(", "))]
    CycleDetected { remaining: Vec<String> },
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("unknown timezone '{timezone}'")]
    InvalidTimezone { timezone: String },
    #[error("no {kind} named {name} in repository {repository}")]
    UnknownDefinition {
        kind: &'static str,
        name: String,
        repository: String,
    },
    #[error("failed to encode snapshot content: {0}")]
    SnapshotEncoding(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Structured error payload persisted with failed ticks.
///
/// Captures the display message of an error and its source chain so a
/// failure survives serialization without holding the original error type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Build a payload from any error, walking its source chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let cause = error
            .source()
            .map(|source| Box::new(Self::from_error(source)));
        Self {
            message: error.to_string(),
            cause,
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}
