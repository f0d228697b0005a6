//! Instance state reconstructed from history.
//!
//! An `Instance` is never stored directly: it is derived by folding the
//! history log, so the log stays the single source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::history::{EventKind, HistoryEvent, ParentLink};

/// Lifecycle status of an orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Started and not yet finished (possibly suspended awaiting work)
    Running,

    /// Finished successfully; `output` holds the result
    Completed,

    /// Finished via the compensation path; `output` holds the structured failure
    Failed,

    /// Hit an unrecoverable fault; requires operator intervention
    Terminated,
}

/// One execution of an orchestration, derived from its history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Instance id (caller-supplied or generated)
    pub id: String,

    /// Orchestration type name
    pub orchestration: String,

    /// Input payload the instance was started with
    pub input: Value,

    /// Current lifecycle status
    pub status: InstanceStatus,

    /// Output payload, present only when Completed or Failed
    pub output: Option<Value>,

    /// Parent call linkage when this is a child orchestration
    pub parent: Option<ParentLink>,

    /// When the instance started
    pub started_at: DateTime<Utc>,

    /// When the instance reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Fold a history log into instance state.
    ///
    /// Returns `None` if the log does not begin with `OrchestrationStarted`.
    pub fn from_events(id: &str, events: &[HistoryEvent]) -> Option<Self> {
        let first = events.first()?;
        let EventKind::OrchestrationStarted {
            orchestration,
            input,
            parent,
        } = &first.kind
        else {
            return None;
        };

        let mut instance = Self {
            id: id.to_string(),
            orchestration: orchestration.clone(),
            input: input.clone(),
            status: InstanceStatus::Running,
            output: None,
            parent: parent.clone(),
            started_at: first.timestamp,
            finished_at: None,
        };

        for event in &events[1..] {
            match &event.kind {
                EventKind::OrchestrationCompleted { output } => {
                    instance.status = InstanceStatus::Completed;
                    instance.output = Some(output.clone());
                    instance.finished_at = Some(event.timestamp);
                }
                EventKind::OrchestrationFailed { failure } => {
                    instance.status = InstanceStatus::Failed;
                    instance.output = serde_json::to_value(failure).ok();
                    instance.finished_at = Some(event.timestamp);
                }
                EventKind::OrchestrationTerminated { .. } => {
                    instance.status = InstanceStatus::Terminated;
                    instance.finished_at = Some(event.timestamp);
                }
                _ => {}
            }
        }

        Some(instance)
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }
}
