//! Execution context handed to orchestration decision functions.
//!
//! The context replays scheduling calls against the instance's history:
//! a call whose outcome is already recorded resolves immediately, a call
//! that is recorded but unfinished suspends, and a call history has never
//! seen produces an `Action` for the runtime to materialize. Sequence ids
//! are an explicit counter driven by the orchestration's own call order,
//! which is what makes replay auditable and deterministic.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::domain::{EventKind, HistoryEvent, TaskError};

use super::futures::DurableFuture;

/// A scheduling decision produced by a replay turn that history has not
/// recorded yet. The runtime appends the matching `*Scheduled` event and
/// performs the side effect exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ScheduleTask {
        seq: u64,
        name: String,
        input: Value,
    },
    ScheduleSubOrchestration {
        seq: u64,
        orchestration: String,
        input: Value,
    },
    CreateTimer {
        seq: u64,
        delay: Duration,
    },
}

/// A scheduling call that disagrees with what history recorded at the same
/// sequence id. Fatal: the instance is terminated, never patched up.
#[derive(Debug, Clone)]
pub struct NonDeterminism {
    pub seq: u64,
    pub recorded: String,
    pub requested: String,
}

impl fmt::Display for NonDeterminism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "non-deterministic orchestration: call #{} requested {} but history recorded {}",
            self.seq, self.requested, self.recorded
        )
    }
}

/// Identifies what a `DurableFuture` resolves against in history.
#[derive(Debug, Clone)]
pub(crate) enum CallTarget {
    Activity { seq: u64, name: String },
    SubOrchestration { seq: u64, orchestration: String },
    Timer { seq: u64 },
    ExternalEvent { name: String, index: usize },
}

struct CtxInner {
    history: Vec<HistoryEvent>,
    actions: Vec<Action>,
    next_seq: u64,
    event_cursors: HashMap<String, usize>,
    fault: Option<NonDeterminism>,
    cancelled: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<HistoryEvent>) -> Self {
        let cancelled = history.iter().find_map(|e| match &e.kind {
            EventKind::CancelRequested { reason } => Some(reason.clone()),
            _ => None,
        });

        Self {
            history,
            actions: Vec::new(),
            next_seq: 0,
            event_cursors: HashMap::new(),
            fault: None,
            cancelled,
        }
    }

    /// The recorded scheduling decision at `seq`, if any.
    fn scheduled_at(&self, seq: u64) -> Option<&EventKind> {
        self.history
            .iter()
            .map(|e| &e.kind)
            .find(|k| k.is_scheduling() && k.seq() == Some(seq))
    }

    fn record_fault(&mut self, seq: u64, recorded: String, requested: String) {
        // Keep the first fault; later mismatches are downstream noise
        if self.fault.is_none() {
            self.fault = Some(NonDeterminism {
                seq,
                recorded,
                requested,
            });
        }
    }
}

/// Replay-aware handle orchestration code schedules work through.
///
/// Cheap to clone; all clones share one replay state.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
    pub(crate) fn new(history: Vec<HistoryEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// Schedule an activity call.
    ///
    /// The returned future resolves with the activity's recorded result, or
    /// suspends the turn until a worker reports one.
    pub fn schedule_activity(&self, name: impl Into<String>, input: Value) -> DurableFuture {
        let name = name.into();
        let mut inner = self.inner.lock().unwrap();

        inner.next_seq += 1;
        let seq = inner.next_seq;

        match inner.scheduled_at(seq).cloned() {
            Some(EventKind::TaskScheduled { name: recorded, .. }) if recorded == name => {}
            Some(other) => {
                let recorded = other.describe();
                inner.record_fault(seq, recorded, format!("activity '{}'", name));
            }
            None => {
                inner.actions.push(Action::ScheduleTask {
                    seq,
                    name: name.clone(),
                    input,
                });
            }
        }

        DurableFuture::new(self.clone(), CallTarget::Activity { seq, name })
    }

    /// Schedule a child orchestration call.
    pub fn schedule_sub_orchestration(
        &self,
        orchestration: impl Into<String>,
        input: Value,
    ) -> DurableFuture {
        let orchestration = orchestration.into();
        let mut inner = self.inner.lock().unwrap();

        inner.next_seq += 1;
        let seq = inner.next_seq;

        match inner.scheduled_at(seq).cloned() {
            Some(EventKind::SubOrchestrationScheduled {
                orchestration: recorded,
                ..
            }) if recorded == orchestration => {}
            Some(other) => {
                let recorded = other.describe();
                inner.record_fault(
                    seq,
                    recorded,
                    format!("sub-orchestration '{}'", orchestration),
                );
            }
            None => {
                inner.actions.push(Action::ScheduleSubOrchestration {
                    seq,
                    orchestration: orchestration.clone(),
                    input,
                });
            }
        }

        DurableFuture::new(
            self.clone(),
            CallTarget::SubOrchestration { seq, orchestration },
        )
    }

    /// Create a durable timer that fires after `delay`.
    ///
    /// The deadline is computed by the runtime when the timer is first
    /// materialized and replayed from history thereafter, so orchestration
    /// code never reads the wall clock.
    pub fn create_timer(&self, delay: Duration) -> DurableFuture {
        let mut inner = self.inner.lock().unwrap();

        inner.next_seq += 1;
        let seq = inner.next_seq;

        match inner.scheduled_at(seq).cloned() {
            Some(EventKind::TimerCreated { .. }) => {}
            Some(other) => {
                let recorded = other.describe();
                inner.record_fault(seq, recorded, "timer".to_string());
            }
            None => {
                inner.actions.push(Action::CreateTimer { seq, delay });
            }
        }

        DurableFuture::new(self.clone(), CallTarget::Timer { seq })
    }

    /// Wait for a named external event.
    ///
    /// Each wait call consumes the earliest not-yet-consumed `EventRaised`
    /// with that name, FIFO per name. Events nothing waits for are retained
    /// and inert. Waits consume no sequence id: correlation is purely by
    /// name and arrival order.
    pub fn wait_for_event(&self, name: impl Into<String>) -> DurableFuture {
        let name = name.into();
        let mut inner = self.inner.lock().unwrap();

        let cursor = inner.event_cursors.entry(name.clone()).or_insert(0);
        let index = *cursor;
        *cursor += 1;

        DurableFuture::new(self.clone(), CallTarget::ExternalEvent { name, index })
    }

    /// Resolve a call target against history.
    ///
    /// Returns the position of the resolving event (used for deterministic
    /// ordering decisions in fan-in and races) and the outcome.
    pub(crate) fn resolve(
        &self,
        target: &CallTarget,
    ) -> Option<(usize, Result<Value, TaskError>)> {
        let inner = self.inner.lock().unwrap();

        match target {
            CallTarget::Activity { seq, name } => {
                inner
                    .history
                    .iter()
                    .enumerate()
                    .find_map(|(pos, e)| match &e.kind {
                        EventKind::TaskCompleted { seq: s, result } if s == seq => {
                            Some((pos, Ok(result.clone())))
                        }
                        EventKind::TaskFailed { seq: s, error } if s == seq => Some((
                            pos,
                            Err(TaskError::Activity {
                                name: name.clone(),
                                message: error.clone(),
                            }),
                        )),
                        _ => None,
                    })
            }
            CallTarget::SubOrchestration { seq, orchestration } => inner
                .history
                .iter()
                .enumerate()
                .find_map(|(pos, e)| match &e.kind {
                    EventKind::SubOrchestrationCompleted { seq: s, result } if s == seq => {
                        Some((pos, Ok(result.clone())))
                    }
                    EventKind::SubOrchestrationFailed { seq: s, error } if s == seq => Some((
                        pos,
                        Err(TaskError::SubOrchestration {
                            orchestration: orchestration.clone(),
                            message: error.clone(),
                        }),
                    )),
                    _ => None,
                }),
            CallTarget::Timer { seq } => {
                inner
                    .history
                    .iter()
                    .enumerate()
                    .find_map(|(pos, e)| match &e.kind {
                        EventKind::TimerFired { seq: s } if s == seq => {
                            Some((pos, Ok(Value::Null)))
                        }
                        _ => None,
                    })
            }
            CallTarget::ExternalEvent { name, index } => inner
                .history
                .iter()
                .enumerate()
                .filter_map(|(pos, e)| match &e.kind {
                    EventKind::EventRaised { name: n, payload } if n == name => {
                        Some((pos, Ok(payload.clone())))
                    }
                    _ => None,
                })
                .nth(*index),
        }
    }

    /// Reason for a pending cancel request, if one is recorded.
    pub(crate) fn cancelled(&self) -> Option<String> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    /// The first non-determinism fault detected this turn, if any.
    pub(crate) fn fault(&self) -> Option<NonDeterminism> {
        self.inner.lock().unwrap().fault.clone()
    }

    /// Drain the actions produced this turn.
    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }
}
