//! Runtime hosting orchestration instances.
//!
//! Owns the replay passes: every wake-up (start, activity completion,
//! timer firing, raised event, cancel request) runs the instance's decision
//! function once against its history, materializes any new scheduling
//! decisions, and finalizes the instance when the function returns. A
//! per-instance async mutex keeps replay passes serialized — at most one
//! active pass per instance id — while distinct instances execute fully in
//! parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activities::ActivityRegistry;
use crate::domain::{
    EventKind, FailureCategory, HistoryEvent, Instance, InstanceStatus, ParentLink,
    WorkflowFailure,
};
use crate::workflows::OrchestrationRegistry;

use super::context::Action;
use super::dispatcher::{ActivityDispatcher, CompletionSink, RetryPolicy, WorkItem};
use super::history::HistoryLog;
use super::turn::run_turn;

/// Errors surfaced by the runtime's public operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("instance '{0}' already exists")]
    InstanceAlreadyExists(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("instance '{0}' has already finished")]
    InstanceFinished(String),

    #[error("unknown orchestration '{0}'")]
    UnknownOrchestration(String),

    #[error("timed out waiting for instance '{0}'")]
    WaitTimeout(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Tuning knobs for a runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Worker tasks pulling from the activity work queue
    pub workers: usize,

    /// Retry policy for transient activity failures
    pub retry: RetryPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Hosts orchestration instances under one state root.
///
/// One runtime process owns the replay passes for a root directory;
/// out-of-band writers may only append `EventRaised`/`CancelRequested`
/// lines (see [`append_signal`]).
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    root: PathBuf,
    orchestrations: OrchestrationRegistry,
    dispatcher: OnceLock<ActivityDispatcher>,
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    self_ref: Weak<RuntimeInner>,
}

impl Runtime {
    /// Build a runtime and spawn its worker pool.
    pub fn new(
        root: impl Into<PathBuf>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Self {
        let root = root.into();
        let inner = Arc::new_cyclic(|weak| RuntimeInner {
            root,
            orchestrations,
            dispatcher: OnceLock::new(),
            locks: StdMutex::new(HashMap::new()),
            self_ref: weak.clone(),
        });

        let dispatcher = ActivityDispatcher::start(
            activities,
            Arc::clone(&inner) as Arc<dyn CompletionSink>,
            options.workers,
            options.retry,
        );
        let _ = inner.dispatcher.set(dispatcher);

        Self { inner }
    }

    /// Directory holding instance state
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Start a new orchestration instance.
    ///
    /// With an explicit id, fails with `InstanceAlreadyExists` when state
    /// for that id is already on disk; without one, a fresh UUID is used.
    /// Runs the first replay pass before returning.
    #[instrument(skip(self, input, instance_id))]
    pub async fn start(
        &self,
        orchestration: &str,
        instance_id: Option<String>,
        input: Value,
    ) -> Result<String, ClientError> {
        if !self.inner.orchestrations.contains(orchestration) {
            return Err(ClientError::UnknownOrchestration(orchestration.to_string()));
        }

        let instance = instance_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let lock = self.inner.lock_for(&instance);
        let _guard = lock.lock().await;

        if HistoryLog::exists(&self.inner.root, &instance) {
            return Err(ClientError::InstanceAlreadyExists(instance));
        }

        let log = HistoryLog::open(&self.inner.root, &instance)?;
        log.append(&HistoryEvent::new(EventKind::OrchestrationStarted {
            orchestration: orchestration.to_string(),
            input,
            parent: None,
        }))?;

        info!(%instance, "Instance started");
        self.inner.replay_pass(&instance).await;

        Ok(instance)
    }

    /// Raise a named external event against a running instance.
    ///
    /// The event is appended whether or not anything is currently waiting
    /// for it, then the instance is woken. Raising against a missing or
    /// finished instance is a reported no-op failure.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), ClientError> {
        let lock = self.inner.lock_for(instance);
        let _guard = lock.lock().await;

        append_signal(
            &self.inner.root,
            instance,
            EventKind::EventRaised {
                name: name.to_string(),
                payload,
            },
        )?;

        debug!(%instance, event = %name, "External event raised");
        self.inner.replay_pass(instance).await;
        Ok(())
    }

    /// Request cancellation of a running instance.
    ///
    /// The next replay observes a cancellation fault at the instance's
    /// current suspension point and routes through compensation.
    pub async fn cancel(&self, instance: &str, reason: &str) -> Result<(), ClientError> {
        let lock = self.inner.lock_for(instance);
        let _guard = lock.lock().await;

        append_signal(
            &self.inner.root,
            instance,
            EventKind::CancelRequested {
                reason: reason.to_string(),
            },
        )?;

        info!(%instance, %reason, "Cancel requested");
        self.inner.replay_pass(instance).await;
        Ok(())
    }

    /// Current status and output of an instance.
    pub fn get_status(&self, instance: &str) -> Result<Instance, ClientError> {
        read_status(&self.inner.root, instance)
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Instance, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status = self.get_status(instance)?;
            if status.is_finished() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::WaitTimeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Resume every non-terminal instance under the root after a process
    /// restart: re-enqueue unfinished work items, re-arm unfired timers,
    /// forward unreported child results, and run a replay pass.
    ///
    /// Returns the number of instances resumed.
    pub async fn recover(&self) -> Result<usize, ClientError> {
        let instances = HistoryLog::list_instances(&self.inner.root)?;
        let mut resumed = 0;

        for instance in instances {
            if self.inner.recover_instance(&instance).await? {
                resumed += 1;
            }
        }

        Ok(resumed)
    }

    /// Wake an instance for a replay pass. Spurious wakes are harmless:
    /// replay of an unchanged history produces no new decisions.
    pub async fn wake(&self, instance: &str) {
        self.inner.wake_locked(instance).await;
    }

    pub(crate) fn inner(&self) -> Arc<RuntimeInner> {
        Arc::clone(&self.inner)
    }
}

impl RuntimeInner {
    fn shared(&self) -> Option<Arc<RuntimeInner>> {
        self.self_ref.upgrade()
    }

    fn lock_for(&self, instance: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(instance.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn dispatcher(&self) -> &ActivityDispatcher {
        self.dispatcher
            .get()
            .expect("dispatcher initialized in Runtime::new")
    }

    pub(crate) async fn wake_locked(&self, instance: &str) {
        let lock = self.lock_for(instance);
        let _guard = lock.lock().await;
        self.replay_pass(instance).await;
    }

    /// Run one replay pass for an instance. Caller must hold the
    /// instance's lock.
    async fn replay_pass(&self, instance: &str) {
        if let Err(e) = self.try_replay_pass(instance).await {
            // Storage trouble: leave the history untouched; a later
            // wake-up retries the whole pass.
            error!(%instance, error = %e, "Replay pass failed");
        }
    }

    async fn try_replay_pass(&self, instance: &str) -> Result<()> {
        let log = HistoryLog::open(&self.root, instance)?;
        let history = log.read()?;

        let Some(state) = Instance::from_events(instance, &history) else {
            return Ok(());
        };
        if state.is_finished() {
            return Ok(());
        }

        let Some(handler) = self.orchestrations.get(&state.orchestration) else {
            // Registry no longer knows this orchestration; nothing can ever
            // make progress, so park it as unrecoverable.
            let reason = format!("unknown orchestration '{}'", state.orchestration);
            error!(%instance, %reason, "Terminating instance");
            log.append(&HistoryEvent::new(EventKind::OrchestrationTerminated {
                reason,
            }))?;
            return Ok(());
        };

        let input = state.input.clone();
        let outcome = run_turn(history, |ctx| handler.run(ctx, input));

        if let Some(fault) = outcome.fault {
            let reason = fault.to_string();
            error!(%instance, %reason, "Non-determinism detected, terminating instance");
            log.append(&HistoryEvent::new(EventKind::OrchestrationTerminated {
                reason,
            }))?;
            return Ok(());
        }

        for action in outcome.actions {
            self.materialize(instance, &log, action)?;
        }

        match outcome.output {
            Some(Ok(output)) => {
                log.append(&HistoryEvent::new(EventKind::OrchestrationCompleted {
                    output: output.clone(),
                }))?;
                info!(%instance, "Instance completed");
                self.notify_parent(&state.parent, Ok(output));
            }
            Some(Err(failure)) => {
                log.append(&HistoryEvent::new(EventKind::OrchestrationFailed {
                    failure: failure.clone(),
                }))?;
                warn!(%instance, %failure, "Instance failed");
                self.notify_parent(&state.parent, Err(failure));
            }
            None => {
                debug!(%instance, "Instance suspended");
            }
        }

        Ok(())
    }

    /// Append the `*Scheduled` event for a new decision and perform its
    /// side effect.
    fn materialize(&self, instance: &str, log: &HistoryLog, action: Action) -> Result<()> {
        match action {
            Action::ScheduleTask { seq, name, input } => {
                log.append(&HistoryEvent::new(EventKind::TaskScheduled {
                    seq,
                    name: name.clone(),
                    input: input.clone(),
                }))?;
                self.dispatcher().dispatch(WorkItem {
                    instance: instance.to_string(),
                    seq,
                    activity: name,
                    input,
                })?;
            }
            Action::ScheduleSubOrchestration {
                seq,
                orchestration,
                input,
            } => {
                // The child id is derived from the parent call, so it is
                // stable across replays.
                let child = format!("{}::{}", instance, seq);
                log.append(&HistoryEvent::new(EventKind::SubOrchestrationScheduled {
                    seq,
                    orchestration: orchestration.clone(),
                    child_instance: child.clone(),
                    input: input.clone(),
                }))?;

                if let Some(this) = self.shared() {
                    let parent = ParentLink {
                        instance: instance.to_string(),
                        seq,
                    };
                    tokio::spawn(async move {
                        this.start_child(child, orchestration, input, parent).await;
                    });
                }
            }
            Action::CreateTimer { seq, delay } => {
                let fire_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                log.append(&HistoryEvent::new(EventKind::TimerCreated { seq, fire_at }))?;
                self.arm_timer(instance, seq, fire_at);
            }
        }
        Ok(())
    }

    async fn start_child(
        &self,
        child: String,
        orchestration: String,
        input: Value,
        parent: ParentLink,
    ) {
        let lock = self.lock_for(&child);
        let _guard = lock.lock().await;

        if !HistoryLog::exists(&self.root, &child) {
            let result = HistoryLog::open(&self.root, &child).and_then(|log| {
                log.append(&HistoryEvent::new(EventKind::OrchestrationStarted {
                    orchestration,
                    input,
                    parent: Some(parent),
                }))
            });
            if let Err(e) = result {
                error!(instance = %child, error = %e, "Failed to start child instance");
                return;
            }
            debug!(instance = %child, "Child instance started");
        }

        self.replay_pass(&child).await;
    }

    fn arm_timer(&self, instance: &str, seq: u64, fire_at: DateTime<Utc>) {
        let Some(this) = self.shared() else {
            return;
        };
        let instance = instance.to_string();

        tokio::spawn(async move {
            if let Ok(delay) = (fire_at - Utc::now()).to_std() {
                tokio::time::sleep(delay).await;
            }

            let lock = this.lock_for(&instance);
            let _guard = lock.lock().await;

            let recorded = this
                .record_completion(
                    &instance,
                    EventKind::TimerFired { seq },
                    |kind| matches!(kind, EventKind::TimerFired { seq: s } if *s == seq),
                )
                .await;

            if let Err(e) = recorded {
                error!(%instance, seq, error = %e, "Failed to record timer firing");
            }
        });
    }

    /// Forward a finished child's result into the parent's history.
    fn notify_parent(&self, parent: &Option<ParentLink>, result: Result<Value, WorkflowFailure>) {
        let Some(link) = parent.clone() else {
            return;
        };
        let Some(this) = self.shared() else {
            return;
        };

        tokio::spawn(async move {
            let lock = this.lock_for(&link.instance);
            let _guard = lock.lock().await;

            let seq = link.seq;
            let kind = match result {
                Ok(result) => EventKind::SubOrchestrationCompleted { seq, result },
                Err(failure) => EventKind::SubOrchestrationFailed {
                    seq,
                    error: failure.to_string(),
                },
            };

            let recorded = this
                .record_completion(&link.instance, kind, |k| {
                    matches!(
                        k,
                        EventKind::SubOrchestrationCompleted { seq: s, .. }
                        | EventKind::SubOrchestrationFailed { seq: s, .. } if *s == seq
                    )
                })
                .await;

            if let Err(e) = recorded {
                error!(instance = %link.instance, seq, error = %e, "Failed to record child result");
            }
        });
    }

    /// Append a completion event unless one is already recorded for the
    /// same call, then wake the instance. This is where exactly-once
    /// completion recording lives: duplicate reports are dropped here.
    /// Caller must hold the instance's lock.
    async fn record_completion<P>(
        &self,
        instance: &str,
        kind: EventKind,
        already_recorded: P,
    ) -> Result<()>
    where
        P: Fn(&EventKind) -> bool,
    {
        let log = HistoryLog::open(&self.root, instance)?;
        let history = log.read()?;

        if history.iter().any(|e| already_recorded(&e.kind)) {
            warn!(%instance, "Duplicate completion report dropped");
            return Ok(());
        }

        log.append(&HistoryEvent::new(kind))?;

        // A terminal instance still records late completions (fan-out
        // losers finishing after the wait already failed) but is never
        // replayed again.
        let finished = Instance::from_events(instance, &history)
            .map(|s| s.is_finished())
            .unwrap_or(false);
        if !finished {
            self.replay_pass(instance).await;
        }

        Ok(())
    }

    /// Recover one instance after a restart. Returns whether it was
    /// non-terminal (and therefore resumed).
    async fn recover_instance(&self, instance: &str) -> Result<bool, ClientError> {
        let lock = self.lock_for(instance);
        let _guard = lock.lock().await;

        let log = HistoryLog::open(&self.root, instance)?;
        let history = log.read()?;
        let Some(state) = Instance::from_events(instance, &history) else {
            return Ok(false);
        };

        if state.is_finished() {
            // A finished child may have crashed before its result reached
            // the parent; forward it now.
            if let Some(link) = &state.parent {
                let parent_log = HistoryLog::open(&self.root, &link.instance)?;
                let parent_history = parent_log.read()?;
                let seq = link.seq;
                let reported = parent_history.iter().any(|e| {
                    matches!(
                        &e.kind,
                        EventKind::SubOrchestrationCompleted { seq: s, .. }
                        | EventKind::SubOrchestrationFailed { seq: s, .. } if *s == seq
                    )
                });
                if !reported {
                    let result = match (state.status, state.output.clone()) {
                        (InstanceStatus::Completed, output) => Ok(output.unwrap_or(Value::Null)),
                        (_, Some(output)) => Err(serde_json::from_value::<WorkflowFailure>(output)
                            .unwrap_or_else(|_| {
                                WorkflowFailure::new(
                                    FailureCategory::SubOrchestration,
                                    format!("child instance '{}' did not complete", instance),
                                )
                            })),
                        _ => Err(WorkflowFailure::new(
                            FailureCategory::SubOrchestration,
                            format!("child instance '{}' did not complete", instance),
                        )),
                    };
                    self.notify_parent(&state.parent, result);
                }
            }

            // A terminal instance can still carry an unsettled cleanup
            // call lost in the crash window; re-dispatch it.
            self.redispatch_unsettled_tasks(instance, &history)?;
            return Ok(false);
        }

        info!(%instance, "Recovering instance");

        self.redispatch_unsettled_tasks(instance, &history)?;

        for event in &history {
            match &event.kind {
                // Re-arm timers that never fired
                EventKind::TimerCreated { seq, fire_at } => {
                    let fired = history
                        .iter()
                        .any(|e| matches!(&e.kind, EventKind::TimerFired { seq: s } if s == seq));
                    if !fired {
                        self.arm_timer(instance, *seq, *fire_at);
                    }
                }
                // A crash between recording the scheduling decision and
                // starting the child leaves the child with no state; start
                // it now. Children that do have state are recovered by the
                // outer instance sweep.
                EventKind::SubOrchestrationScheduled {
                    seq,
                    orchestration,
                    child_instance,
                    input,
                } => {
                    let settled = history.iter().any(|e| {
                        matches!(
                            &e.kind,
                            EventKind::SubOrchestrationCompleted { seq: s, .. }
                            | EventKind::SubOrchestrationFailed { seq: s, .. } if s == seq
                        )
                    });
                    if !settled && !HistoryLog::exists(&self.root, child_instance) {
                        if let Some(this) = self.shared() {
                            let child = child_instance.clone();
                            let orchestration = orchestration.clone();
                            let input = input.clone();
                            let parent = ParentLink {
                                instance: instance.to_string(),
                                seq: *seq,
                            };
                            tokio::spawn(async move {
                                this.start_child(child, orchestration, input, parent).await;
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        self.replay_pass(instance).await;
        Ok(true)
    }

    /// Re-enqueue scheduled-but-unfinished activities; delivery is
    /// at-least-once, recording is exactly-once.
    fn redispatch_unsettled_tasks(&self, instance: &str, history: &[HistoryEvent]) -> Result<()> {
        for event in history {
            if let EventKind::TaskScheduled { seq, name, input } = &event.kind {
                let settled = history.iter().any(|e| {
                    matches!(
                        &e.kind,
                        EventKind::TaskCompleted { seq: s, .. }
                        | EventKind::TaskFailed { seq: s, .. } if s == seq
                    )
                });
                if !settled {
                    self.dispatcher().dispatch(WorkItem {
                        instance: instance.to_string(),
                        seq: *seq,
                        activity: name.clone(),
                        input: input.clone(),
                    })?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionSink for RuntimeInner {
    async fn activity_completed(&self, instance: &str, seq: u64, result: Value) {
        let lock = self.lock_for(instance);
        let _guard = lock.lock().await;

        let recorded = self
            .record_completion(instance, EventKind::TaskCompleted { seq, result }, |kind| {
                matches!(
                    kind,
                    EventKind::TaskCompleted { seq: s, .. }
                    | EventKind::TaskFailed { seq: s, .. } if *s == seq
                )
            })
            .await;

        if let Err(e) = recorded {
            error!(%instance, seq, error = %e, "Failed to record activity completion");
        }
    }

    async fn activity_failed(&self, instance: &str, seq: u64, error: String) {
        let lock = self.lock_for(instance);
        let _guard = lock.lock().await;

        let recorded = self
            .record_completion(instance, EventKind::TaskFailed { seq, error }, |kind| {
                matches!(
                    kind,
                    EventKind::TaskCompleted { seq: s, .. }
                    | EventKind::TaskFailed { seq: s, .. } if *s == seq
                )
            })
            .await;

        if let Err(e) = recorded {
            error!(%instance, seq, error = %e, "Failed to record activity failure");
        }
    }
}

/// Append an out-of-band signal (event or cancel) to an instance that must
/// exist and still be running. Usable without a hosting runtime — this is
/// what `showrunner approve` does from a second process; the hosting
/// process picks the append up through its wake watcher.
pub fn append_signal(root: &Path, instance: &str, kind: EventKind) -> Result<(), ClientError> {
    let state = read_status(root, instance)?;
    if state.is_finished() {
        return Err(ClientError::InstanceFinished(instance.to_string()));
    }

    let log = HistoryLog::open(root, instance)?;
    log.append(&HistoryEvent::new(kind))?;
    Ok(())
}

/// Read an instance's status and output without hosting it.
pub fn read_status(root: &Path, instance: &str) -> Result<Instance, ClientError> {
    if !HistoryLog::exists(root, instance) {
        return Err(ClientError::InstanceNotFound(instance.to_string()));
    }

    let log = HistoryLog::open(root, instance)?;
    let history = log.read()?;

    Instance::from_events(instance, &history)
        .ok_or_else(|| ClientError::InstanceNotFound(instance.to_string()))
}

/// All instances under a root, most recently started first.
pub fn list_instances(root: &Path) -> Result<Vec<Instance>> {
    let mut instances = Vec::new();

    for id in HistoryLog::list_instances(root)? {
        let log = HistoryLog::open(root, &id)?;
        let history = log.read()?;
        if let Some(instance) = Instance::from_events(&id, &history) {
            instances.push(instance);
        }
    }

    instances.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(instances)
}
