//! Compensation coordinator.
//!
//! Wraps an orchestration's main decision sequence: the first failure it
//! surfaces short-circuits the remaining steps, exactly one cleanup
//! activity runs with every artifact location produced so far (`None`
//! markers for steps never reached), and the instance finishes with a
//! structured failure instead of an unhandled fault. The cleanup call is a
//! normal scheduled activity, so replay gives it the same at-most-once
//! effect as any other step; if cleanup itself fails, the failure is
//! recorded in history but nothing compensates the compensation.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::domain::{TaskError, WorkflowFailure};

use super::context::WorkflowContext;

/// Tracks artifact locations as pipeline steps complete, and runs the
/// single cleanup call when the pipeline fails.
///
/// Clones share state, so a recorder handed into the pipeline body updates
/// the coordinator that settles the failure.
#[derive(Clone)]
pub struct Compensation {
    cleanup_activity: String,
    locations: Arc<Mutex<Vec<Option<String>>>>,
}

impl Compensation {
    /// A coordinator with `slots` fixed artifact positions, all initially
    /// absent.
    pub fn new(cleanup_activity: impl Into<String>, slots: usize) -> Self {
        Self {
            cleanup_activity: cleanup_activity.into(),
            locations: Arc::new(Mutex::new(vec![None; slots])),
        }
    }

    /// Record the artifact produced at a fixed slot.
    pub fn record(&self, slot: usize, location: impl Into<String>) {
        let mut locations = self.locations.lock().unwrap();
        if slot < locations.len() {
            locations[slot] = Some(location.into());
        }
    }

    /// Append an artifact discovered at runtime (e.g. the partial results
    /// of a failed fan-out, whose count is not known up front).
    pub fn push(&self, location: impl Into<String>) {
        self.locations.lock().unwrap().push(Some(location.into()));
    }

    /// Snapshot of the recorded locations.
    pub fn locations(&self) -> Vec<Option<String>> {
        self.locations.lock().unwrap().clone()
    }

    /// Run the single cleanup call and translate the cause into the
    /// instance's structured failure output.
    pub async fn settle(&self, ctx: &WorkflowContext, cause: WorkflowFailure) -> WorkflowFailure {
        let locations = self.locations();
        let input = serde_json::to_value(&locations).unwrap_or(Value::Null);

        // A cleanup failure lands in history as an ordinary failed task and
        // stops there: the original cause is still what the instance
        // reports. Under a pending cancel request the await resolves
        // immediately, finalizing the instance in the same turn while the
        // scheduled cleanup still executes exactly once.
        let _ = ctx.schedule_activity(&self.cleanup_activity, input).await;

        cause
    }
}

/// Run `body` under a compensation coordinator.
///
/// On success the body's output becomes the instance output; on failure the
/// coordinator settles and the instance finishes with the structured
/// failure.
pub async fn with_compensation<Fut>(
    ctx: &WorkflowContext,
    comp: &Compensation,
    body: Fut,
) -> Result<Value, WorkflowFailure>
where
    Fut: Future<Output = Result<Value, TaskError>>,
{
    match body.await {
        Ok(output) => Ok(output),
        Err(cause) => Err(comp.settle(ctx, cause.into()).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_start_absent() {
        let comp = Compensation::new("A_Cleanup", 3);
        assert_eq!(comp.locations(), vec![None, None, None]);
    }

    #[test]
    fn test_record_and_push() {
        let comp = Compensation::new("A_Cleanup", 2);
        comp.record(0, "video-1080kbps.mp4");
        comp.push("extra.mp4");

        assert_eq!(
            comp.locations(),
            vec![
                Some("video-1080kbps.mp4".to_string()),
                None,
                Some("extra.mp4".to_string()),
            ]
        );
    }

    #[test]
    fn test_clones_share_recordings() {
        let comp = Compensation::new("A_Cleanup", 1);
        let recorder = comp.clone();
        recorder.record(0, "thumb.png");

        assert_eq!(comp.locations(), vec![Some("thumb.png".to_string())]);
    }

    #[test]
    fn test_out_of_range_slot_is_ignored() {
        let comp = Compensation::new("A_Cleanup", 1);
        comp.record(5, "nowhere.mp4");
        assert_eq!(comp.locations(), vec![None]);
    }
}
