//! Failure taxonomy for orchestrations.
//!
//! Transient infrastructure errors are retried inside the dispatcher and
//! never reach orchestration code. What the decision function observes is a
//! `TaskError`; what an instance reports to the outside world on failure is
//! always a `WorkflowFailure` — never a raw fault.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category attached to a structured failure output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// An activity reported a business failure
    Activity,

    /// A child orchestration failed
    SubOrchestration,

    /// The instance was cancelled from outside
    Cancelled,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::Activity => "activity",
            FailureCategory::SubOrchestration => "sub_orchestration",
            FailureCategory::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The failure shape an instance completes with instead of crashing.
///
/// Serializes to `{"error": <category>, "message": <string>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{category}: {message}")]
pub struct WorkflowFailure {
    #[serde(rename = "error")]
    pub category: FailureCategory,
    pub message: String,
}

impl WorkflowFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// What orchestration code observes when an awaited call fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("activity '{name}' failed: {message}")]
    Activity { name: String, message: String },

    #[error("sub-orchestration '{orchestration}' failed: {message}")]
    SubOrchestration {
        orchestration: String,
        message: String,
    },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl From<TaskError> for WorkflowFailure {
    fn from(err: TaskError) -> Self {
        let category = match &err {
            TaskError::Activity { .. } => FailureCategory::Activity,
            TaskError::SubOrchestration { .. } => FailureCategory::SubOrchestration,
            TaskError::Cancelled { .. } => FailureCategory::Cancelled,
        };
        WorkflowFailure::new(category, err.to_string())
    }
}
