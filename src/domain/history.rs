//! History events for the replay-driven orchestrator.
//!
//! Every decision an orchestration makes and every outcome reported back to
//! it is recorded as an immutable event in an append-only log. The log is
//! the only state that survives a suspension; replaying it reconstructs
//! everything else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::failure::WorkflowFailure;

/// A single event in an instance's append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event was appended
    pub timestamp: DateTime<Utc>,

    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
}

impl HistoryEvent {
    /// Create a new event with the current timestamp
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Linkage from a child instance back to the parent call that spawned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    /// Parent instance id
    pub instance: String,

    /// Sequence id of the parent's sub-orchestration call
    pub seq: u64,
}

/// The kinds of events that can appear in an instance's history.
///
/// `seq` values are assigned by the orchestration's own call order: they
/// increase monotonically, are never reused within an instance, and a
/// `*Scheduled` event always precedes its matching completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The instance was created with an input payload
    OrchestrationStarted {
        orchestration: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
    },

    /// An activity call was handed to the dispatcher
    TaskScheduled { seq: u64, name: String, input: Value },

    /// A worker reported an activity result
    TaskCompleted { seq: u64, result: Value },

    /// A worker reported an activity business failure
    TaskFailed { seq: u64, error: String },

    /// A child orchestration was started on behalf of this instance
    SubOrchestrationScheduled {
        seq: u64,
        orchestration: String,
        child_instance: String,
        input: Value,
    },

    /// A child orchestration completed and returned its output
    SubOrchestrationCompleted { seq: u64, result: Value },

    /// A child orchestration failed
    SubOrchestrationFailed { seq: u64, error: String },

    /// A durable timer was created with a wall-clock deadline
    TimerCreated {
        seq: u64,
        fire_at: DateTime<Utc>,
    },

    /// A durable timer reached its deadline
    TimerFired { seq: u64 },

    /// An external signal arrived, matched to waiters by name in FIFO order
    EventRaised { name: String, payload: Value },

    /// An out-of-band cancel request; the next replay observes it as a fault
    CancelRequested { reason: String },

    /// The instance finished successfully
    OrchestrationCompleted { output: Value },

    /// The instance finished with a structured failure
    OrchestrationFailed { failure: WorkflowFailure },

    /// The instance hit an unrecoverable fault (e.g. non-determinism)
    OrchestrationTerminated { reason: String },
}

impl EventKind {
    /// Sequence id of this event, for the kinds that carry one
    pub fn seq(&self) -> Option<u64> {
        match self {
            EventKind::TaskScheduled { seq, .. }
            | EventKind::TaskCompleted { seq, .. }
            | EventKind::TaskFailed { seq, .. }
            | EventKind::SubOrchestrationScheduled { seq, .. }
            | EventKind::SubOrchestrationCompleted { seq, .. }
            | EventKind::SubOrchestrationFailed { seq, .. }
            | EventKind::TimerCreated { seq, .. }
            | EventKind::TimerFired { seq } => Some(*seq),
            _ => None,
        }
    }

    /// Whether this event ends the instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationTerminated { .. }
        )
    }

    /// Whether this is a `*Scheduled` kind (a recorded scheduling decision)
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            EventKind::TaskScheduled { .. }
                | EventKind::SubOrchestrationScheduled { .. }
                | EventKind::TimerCreated { .. }
        )
    }

    /// Short human-readable description of a scheduling decision,
    /// used in non-determinism reports
    pub fn describe(&self) -> String {
        match self {
            EventKind::TaskScheduled { name, .. } => format!("activity '{}'", name),
            EventKind::SubOrchestrationScheduled { orchestration, .. } => {
                format!("sub-orchestration '{}'", orchestration)
            }
            EventKind::TimerCreated { .. } => "timer".to_string(),
            other => format!("{:?}", other),
        }
    }
}
