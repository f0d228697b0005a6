//! End-to-end video pipeline scenarios.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use showrunner::activities::media;
use showrunner::core::{ClientError, HistoryLog, Runtime, RuntimeOptions};
use showrunner::domain::{EventKind, InstanceStatus};
use showrunner::workflows::{video, OrchestrationRegistry};
use showrunner::{ActivityRegistry, FnActivity};

fn pipeline_runtime(
    root: &Path,
    activities: ActivityRegistry,
    approval_timeout: Option<Duration>,
) -> Runtime {
    let mut orchestrations = OrchestrationRegistry::new();
    video::register(
        &mut orchestrations,
        video::VideoPipelineSettings { approval_timeout },
    );
    Runtime::new(
        root.to_path_buf(),
        activities,
        orchestrations,
        RuntimeOptions::default(),
    )
}

/// Override an activity with one that counts invocations.
fn counted(registry: &mut ActivityRegistry, name: &'static str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    registry.register(Arc::new(FnActivity::new(name, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    })));
    count
}

/// Block until the named activity has a completion recorded for `instance`.
async fn wait_for_activity(root: &Path, instance: &str, activity: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    loop {
        let history = HistoryLog::open(root, instance).unwrap().read().unwrap();
        let seq = history.iter().find_map(|e| match &e.kind {
            EventKind::TaskScheduled { seq, name, .. } if name == activity => Some(*seq),
            _ => None,
        });
        if let Some(seq) = seq {
            let done = history
                .iter()
                .any(|e| matches!(&e.kind, EventKind::TaskCompleted { seq: s, .. } if *s == seq));
            if done {
                return;
            }
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} on {}",
            activity,
            instance
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn approved_video_is_published_exactly_once() {
    let temp = TempDir::new().unwrap();
    let mut activities = media::registry(vec![720, 1080]);
    let publishes = counted(&mut activities, video::activities::PUBLISH_VIDEO);
    let rejections = counted(&mut activities, video::activities::REJECT_VIDEO);

    let runtime = pipeline_runtime(temp.path(), activities, None);
    let instance = runtime
        .start(video::PROCESS_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    wait_for_activity(
        temp.path(),
        &instance,
        video::activities::SEND_APPROVAL_REQUEST_EMAIL,
    )
    .await;

    runtime
        .raise_event(&instance, video::APPROVAL_EVENT, json!("Approved"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Completed);
    let output = state.output.unwrap();
    assert_eq!(output["approvalResult"], "Approved");
    assert_eq!(output["transcodedLocation"], "raw/video1-1080kbps.mp4");
    assert_eq!(
        output["thumbnailLocation"],
        "raw/video1-1080kbps-thumbnail.png"
    );
    assert_eq!(output["introLocation"], "raw/video1-1080kbps-with-intro.mp4");

    assert_eq!(publishes.load(Ordering::SeqCst), 1);
    assert_eq!(rejections.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_video_is_never_published() {
    let temp = TempDir::new().unwrap();
    let mut activities = media::registry(vec![720, 1080]);
    let publishes = counted(&mut activities, video::activities::PUBLISH_VIDEO);
    let rejections = counted(&mut activities, video::activities::REJECT_VIDEO);

    let runtime = pipeline_runtime(temp.path(), activities, None);
    let instance = runtime
        .start(video::PROCESS_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    wait_for_activity(
        temp.path(),
        &instance,
        video::activities::SEND_APPROVAL_REQUEST_EMAIL,
    )
    .await;

    runtime
        .raise_event(&instance, video::APPROVAL_EVENT, json!("Rejected"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Completed);
    assert_eq!(state.output.unwrap()["approvalResult"], "Rejected");
    assert_eq!(publishes.load(Ordering::SeqCst), 0);
    assert_eq!(rejections.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unattended_approval_times_out_to_rejection() {
    let temp = TempDir::new().unwrap();
    let mut activities = media::registry(vec![480]);
    let publishes = counted(&mut activities, video::activities::PUBLISH_VIDEO);
    let rejections = counted(&mut activities, video::activities::REJECT_VIDEO);

    let runtime = pipeline_runtime(temp.path(), activities, Some(Duration::from_millis(200)));
    let instance = runtime
        .start(video::PROCESS_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Completed);
    assert_eq!(state.output.unwrap()["approvalResult"], video::APPROVAL_TIMED_OUT);
    assert_eq!(publishes.load(Ordering::SeqCst), 0);
    assert_eq!(rejections.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn late_approval_after_timeout_is_a_reported_no_op() {
    let temp = TempDir::new().unwrap();
    let activities = media::registry(vec![480]);

    let runtime = pipeline_runtime(temp.path(), activities, Some(Duration::from_millis(150)));
    let instance = runtime
        .start(video::PROCESS_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(state.output.unwrap()["approvalResult"], video::APPROVAL_TIMED_OUT);

    // The decision already stood; a late approval is a reported no-op.
    let err = runtime
        .raise_event(&instance, video::APPROVAL_EVENT, json!("Approved"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InstanceFinished(_)));
}

#[tokio::test]
async fn duplicate_instance_id_is_rejected() {
    let temp = TempDir::new().unwrap();
    let runtime = pipeline_runtime(temp.path(), media::registry(vec![480]), None);

    runtime
        .start(
            video::PROCESS_VIDEO,
            Some("video-1".to_string()),
            json!("raw/video1.mp4"),
        )
        .await
        .unwrap();

    let err = runtime
        .start(
            video::PROCESS_VIDEO,
            Some("video-1".to_string()),
            json!("raw/video1.mp4"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::InstanceAlreadyExists(_)));
}

#[tokio::test]
async fn unknown_orchestration_is_rejected() {
    let temp = TempDir::new().unwrap();
    let runtime = pipeline_runtime(temp.path(), media::registry(vec![480]), None);

    let err = runtime
        .start("O_DoesNotExist", None, json!(null))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::UnknownOrchestration(_)));
}
