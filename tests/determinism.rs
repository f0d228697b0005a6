//! Replay determinism: exactly-once side effects, idempotent wake-ups,
//! non-determinism faults, crash recovery.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use showrunner::activities::media;
use showrunner::core::{HistoryLog, Runtime, RuntimeOptions, WorkflowContext};
use showrunner::domain::{EventKind, HistoryEvent, InstanceStatus, WorkflowFailure};
use showrunner::workflows::{video, OrchestrationRegistry};
use showrunner::{ActivityRegistry, FnActivity, FnOrchestration};

/// Wrap every pipeline activity with an invocation counter.
fn counted_media_registry(
    bit_rates: Vec<u32>,
) -> (ActivityRegistry, Vec<(&'static str, Arc<AtomicUsize>)>) {
    let base = media::registry(bit_rates);
    let mut counted = ActivityRegistry::new();
    let mut counters = Vec::new();

    for name in [
        video::activities::GET_TRANSCODE_BITRATES,
        video::activities::TRANSCODE_VIDEO,
        video::activities::EXTRACT_THUMBNAIL,
        video::activities::PREPEND_INTRO,
        video::activities::SEND_APPROVAL_REQUEST_EMAIL,
        video::activities::PUBLISH_VIDEO,
        video::activities::REJECT_VIDEO,
        video::activities::CLEANUP,
    ] {
        let inner = base.get(name).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        counters.push((name, Arc::clone(&count)));

        counted.register(Arc::new(CountingActivity {
            inner,
            count,
        }));
    }

    (counted, counters)
}

struct CountingActivity {
    inner: Arc<dyn showrunner::Activity>,
    count: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl showrunner::Activity for CountingActivity {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, input: Value) -> Result<Value, showrunner::ActivityError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(input).await
    }
}

fn count_of(counters: &[(&'static str, Arc<AtomicUsize>)], name: &str) -> usize {
    counters
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, c)| c.load(Ordering::SeqCst))
        .unwrap()
}

fn pipeline_runtime(root: &Path, activities: ActivityRegistry) -> Runtime {
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
async fn replay_never_reinvokes_completed_activities() {
    let temp = TempDir::new().unwrap();
    let (activities, counters) = counted_media_registry(vec![480, 720, 1080]);

    let runtime = pipeline_runtime(temp.path(), activities);
    let instance = runtime
        .start(video::PROCESS_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    // Every completion wakes the instance and replays the decision
    // function from the top; none of the many replays may re-run work.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let count = count_of(&counters, video::activities::SEND_APPROVAL_REQUEST_EMAIL);
        if count > 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    runtime
        .raise_event(&instance, video::APPROVAL_EVENT, json!("Approved"))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(state.status, InstanceStatus::Completed);

    assert_eq!(count_of(&counters, video::activities::GET_TRANSCODE_BITRATES), 1);
    assert_eq!(count_of(&counters, video::activities::TRANSCODE_VIDEO), 3);
    assert_eq!(count_of(&counters, video::activities::EXTRACT_THUMBNAIL), 1);
    assert_eq!(count_of(&counters, video::activities::PREPEND_INTRO), 1);
    assert_eq!(
        count_of(&counters, video::activities::SEND_APPROVAL_REQUEST_EMAIL),
        1
    );
    assert_eq!(count_of(&counters, video::activities::PUBLISH_VIDEO), 1);
    assert_eq!(count_of(&counters, video::activities::REJECT_VIDEO), 0);
    assert_eq!(count_of(&counters, video::activities::CLEANUP), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn spurious_wakes_change_nothing() {
    let temp = TempDir::new().unwrap();
    let (activities, counters) = counted_media_registry(vec![720]);

    let runtime = pipeline_runtime(temp.path(), activities);
    let instance = runtime
        .start(video::PROCESS_VIDEO, None, json!("raw/video1.mp4"))
        .await
        .unwrap();

    runtime
        .raise_event(&instance, video::APPROVAL_EVENT, json!("Approved"))
        .await
        .unwrap();
    runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    let history_len = HistoryLog::open(temp.path(), &instance)
        .unwrap()
        .read()
        .unwrap()
        .len();
    let transcodes = count_of(&counters, video::activities::TRANSCODE_VIDEO);

    for _ in 0..5 {
        runtime.wake(&instance).await;
    }

    let after = HistoryLog::open(temp.path(), &instance)
        .unwrap()
        .read()
        .unwrap()
        .len();
    assert_eq!(after, history_len);
    assert_eq!(count_of(&counters, video::activities::TRANSCODE_VIDEO), transcodes);
}

#[tokio::test(flavor = "multi_thread")]
async fn diverging_decision_code_terminates_the_instance() {
    let temp = TempDir::new().unwrap();

    // Schedules a different activity on every re-execution: the second
    // replay disagrees with history and must be fatal.
    let executions = Arc::new(AtomicUsize::new(0));
    let flips = Arc::clone(&executions);

    let mut orchestrations = OrchestrationRegistry::new();
    orchestrations.register(Arc::new(FnOrchestration::new(
        "O_Unstable",
        move |ctx: WorkflowContext, _input: Value| {
            let n = flips.fetch_add(1, Ordering::SeqCst);
            async move {
                let name = if n == 0 { "A_First" } else { "A_Second" };
                ctx.schedule_activity(name, json!(null))
                    .await
                    .map_err(WorkflowFailure::from)?;
                Ok(Value::Null)
            }
        },
    )));

    let mut activities = ActivityRegistry::new();
    activities.register(Arc::new(FnActivity::new("A_First", |_| Ok(Value::Null))));
    activities.register(Arc::new(FnActivity::new("A_Second", |_| Ok(Value::Null))));

    let runtime = Runtime::new(
        temp.path().to_path_buf(),
        activities,
        orchestrations,
        RuntimeOptions::default(),
    );

    let instance = runtime
        .start("O_Unstable", None, json!(null))
        .await
        .unwrap();

    let state = runtime
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Terminated);
    assert!(state.output.is_none());

    let history = HistoryLog::open(temp.path(), &instance)
        .unwrap()
        .read()
        .unwrap();
    let reason = history
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::OrchestrationTerminated { reason } => Some(reason.clone()),
            _ => None,
        })
        .unwrap();
    assert!(reason.contains("A_First"));
    assert!(reason.contains("A_Second"));
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_redispatches_work_lost_in_a_crash() {
    let temp = TempDir::new().unwrap();

    // Hand-build the state a crashed process would leave behind: the
    // instance was started and its first call was recorded, but the work
    // item never got executed.
    let log = HistoryLog::open(temp.path(), "crashed-1").unwrap();
    log.append(&HistoryEvent::new(EventKind::OrchestrationStarted {
        orchestration: "O_TwoSteps".to_string(),
        input: json!("payload"),
        parent: None,
    }))
    .unwrap();
    log.append(&HistoryEvent::new(EventKind::TaskScheduled {
        seq: 1,
        name: "A_One".to_string(),
        input: json!("payload"),
    }))
    .unwrap();

    let first_runs = Arc::new(AtomicUsize::new(0));
    let second_runs = Arc::new(AtomicUsize::new(0));

    let mut activities = ActivityRegistry::new();
    let count = Arc::clone(&first_runs);
    activities.register(Arc::new(FnActivity::new("A_One", move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(json!("one"))
    })));
    let count = Arc::clone(&second_runs);
    activities.register(Arc::new(FnActivity::new("A_Two", move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(json!("two"))
    })));

    let mut orchestrations = OrchestrationRegistry::new();
    orchestrations.register(Arc::new(FnOrchestration::new(
        "O_TwoSteps",
        |ctx: WorkflowContext, _input: Value| async move {
            let one = ctx
                .schedule_activity("A_One", json!("payload"))
                .await
                .map_err(WorkflowFailure::from)?;
            let two = ctx
                .schedule_activity("A_Two", one.clone())
                .await
                .map_err(WorkflowFailure::from)?;
            Ok(json!([one, two]))
        },
    )));

    let runtime = Runtime::new(
        temp.path().to_path_buf(),
        activities,
        orchestrations,
        RuntimeOptions::default(),
    );

    let resumed = runtime.recover().await.unwrap();
    assert_eq!(resumed, 1);

    let state = runtime
        .wait_for_completion("crashed-1", Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Completed);
    assert_eq!(state.output.unwrap(), json!(["one", "two"]));
    assert_eq!(first_runs.load(Ordering::SeqCst), 1);
    assert_eq!(second_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_skips_settled_work() {
    let temp = TempDir::new().unwrap();

    // The first call already completed before the crash; recovery must
    // not re-run it.
    let log = HistoryLog::open(temp.path(), "crashed-2").unwrap();
    log.append(&HistoryEvent::new(EventKind::OrchestrationStarted {
        orchestration: "O_OneStep".to_string(),
        input: json!(null),
        parent: None,
    }))
    .unwrap();
    log.append(&HistoryEvent::new(EventKind::TaskScheduled {
        seq: 1,
        name: "A_One".to_string(),
        input: json!(null),
    }))
    .unwrap();
    log.append(&HistoryEvent::new(EventKind::TaskCompleted {
        seq: 1,
        result: json!("done"),
    }))
    .unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let mut activities = ActivityRegistry::new();
    let count = Arc::clone(&runs);
    activities.register(Arc::new(FnActivity::new("A_One", move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(json!("done"))
    })));

    let mut orchestrations = OrchestrationRegistry::new();
    orchestrations.register(Arc::new(FnOrchestration::new(
        "O_OneStep",
        |ctx: WorkflowContext, _input: Value| async move {
            let one = ctx
                .schedule_activity("A_One", json!(null))
                .await
                .map_err(WorkflowFailure::from)?;
            Ok(one)
        },
    )));

    let runtime = Runtime::new(
        temp.path().to_path_buf(),
        activities,
        orchestrations,
        RuntimeOptions::default(),
    );

    runtime.recover().await.unwrap();

    let state = runtime
        .wait_for_completion("crashed-2", Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(state.status, InstanceStatus::Completed);
    assert_eq!(state.output.unwrap(), json!("done"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}
