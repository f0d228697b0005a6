//! Fan-out/fan-in behavior under out-of-order and failing members.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use showrunner::activities::media;
use showrunner::core::{HistoryLog, Runtime, RuntimeOptions};
use showrunner::domain::{EventKind, InstanceStatus, TranscodeRequest, VideoFileInfo};
use showrunner::workflows::{video, OrchestrationRegistry};
use showrunner::{Activity, ActivityError, ActivityRegistry};

/// Transcoder with a configurable delay (and optional failure) per bit
/// rate, to control completion arrival order.
struct StaggeredTranscode {
    delays: HashMap<u32, Duration>,
    failing: Option<u32>,
}

#[async_trait]
impl Activity for StaggeredTranscode {
    fn name(&self) -> &str {
        video::activities::TRANSCODE_VIDEO
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let request: TranscodeRequest = serde_json::from_value(input)
            .map_err(|e| ActivityError::Business(format!("bad input: {}", e)))?;

        if let Some(delay) = self.delays.get(&request.bit_rate) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing == Some(request.bit_rate) {
            return Err(ActivityError::Business(format!(
                "codec refused {} kbps",
                request.bit_rate
            )));
        }

        let info = VideoFileInfo {
            location: format!("raw/video1-{}kbps.mp4", request.bit_rate),
            bit_rate: request.bit_rate,
        };
        Ok(serde_json::to_value(info).unwrap())
    }
}

/// Cleanup that records every input it is called with.
struct RecordingCleanup {
    calls: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Activity for RecordingCleanup {
    fn name(&self) -> &str {
        video::activities::CLEANUP
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        self.calls.lock().unwrap().push(input);
        Ok(Value::Null)
    }
}

fn transcode_runtime(root: &Path, activities: ActivityRegistry) -> Runtime {
    let mut orchestrations = OrchestrationRegistry::new();
    video::register(&mut orchestrations, video::VideoPipelineSettings::default());
    Runtime::new(
        root.to_path_buf(),
        activities,
        orchestrations,
        RuntimeOptions::default(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn results_map_back_to_schedule_order_and_highest_wins() {
    let temp = TempDir::new().unwrap();

    // Completions arrive 480, 1080, 720 — not in schedule order.
    let mut activities = media::registry(vec![480, 720, 1080]);
    activities.register(Arc::new(StaggeredTranscode {
        delays: HashMap::from([
            (480, Duration::from_millis(10)),
            (720, Duration::from_millis(250)),
            (1080, Duration::from_millis(100)),
        ]),
        failing: None,
    }));

    let runtime = transcode_runtime(temp.path(), activities);
    let instance = runtime
        .start(video::TRANSCODE_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Completed);

    // Fan-in output keeps schedule order, not arrival order
    let renditions: Vec<VideoFileInfo> =
        serde_json::from_value(state.output.unwrap()).unwrap();
    let bit_rates: Vec<u32> = renditions.iter().map(|r| r.bit_rate).collect();
    assert_eq!(bit_rates, vec![480, 720, 1080]);

    // The selection policy picks 1080 regardless of arrival order
    let best = video::select_best_rendition(&renditions).unwrap();
    assert_eq!(best.bit_rate, 1080);

    // History really did record completions out of schedule order
    let history = HistoryLog::open(temp.path(), &instance)
        .unwrap()
        .read()
        .unwrap();
    let completion_seqs: Vec<u64> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskCompleted { seq, .. } if *seq > 1 => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(completion_seqs, vec![2, 4, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn member_failure_surfaces_without_waiting_and_cleans_partials() {
    let temp = TempDir::new().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    // 480 finishes fast, 720 fails, 1080 is still running when the
    // fan-in fails.
    let mut activities = media::registry(vec![480, 720, 1080]);
    activities.register(Arc::new(StaggeredTranscode {
        delays: HashMap::from([
            (480, Duration::from_millis(10)),
            (720, Duration::from_millis(100)),
            (1080, Duration::from_millis(600)),
        ]),
        failing: Some(720),
    }));
    activities.register(Arc::new(RecordingCleanup {
        calls: Arc::clone(&calls),
    }));

    let runtime = transcode_runtime(temp.path(), activities);
    let instance = runtime
        .start(video::TRANSCODE_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Failed);
    let output = state.output.unwrap();
    assert_eq!(output["error"], "activity");
    assert!(output["message"].as_str().unwrap().contains("codec refused"));

    // Exactly one cleanup, carrying the one rendition that had completed
    let cleanup_calls = calls.lock().unwrap().clone();
    assert_eq!(cleanup_calls.len(), 1);
    assert_eq!(cleanup_calls[0], json!(["raw/video1-480kbps.mp4"]));

    // The slow member is not cancelled: its completion is still recorded
    // against the already-failed instance, just ignored.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let history = HistoryLog::open(temp.path(), &instance)
            .unwrap()
            .read()
            .unwrap();
        let late_arrival = history
            .iter()
            .any(|e| matches!(&e.kind, EventKind::TaskCompleted { seq: 4, .. }));
        if late_arrival {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "late member completion never recorded"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let final_state = runtime.get_status(&instance).unwrap();
    assert_eq!(final_state.status, InstanceStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_bit_rate_list_produces_no_renditions() {
    let temp = TempDir::new().unwrap();
    let activities = media::registry(vec![]);

    let runtime = transcode_runtime(temp.path(), activities);
    let instance = runtime
        .start(video::TRANSCODE_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Completed);
    let renditions: Vec<VideoFileInfo> =
        serde_json::from_value(state.output.unwrap()).unwrap();
    assert!(renditions.is_empty());
}
