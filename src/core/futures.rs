//! Futures that resolve from history instead of the outside world.
//!
//! A `DurableFuture` never registers a waker: the turn runner polls the
//! decision function exactly once per wake-up, and anything still pending
//! simply ends the turn. That is what makes suspension stateless — the
//! only thing carried across turns is the history log.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::TaskError;

use super::context::{CallTarget, WorkflowContext};

/// A scheduled call awaiting its recorded outcome.
///
/// Resolves to the call's result once a matching completion event exists in
/// history; timers resolve to `Value::Null`. While a cancel request is
/// recorded, any call that would suspend resolves to
/// `TaskError::Cancelled` instead, which is how cancellation surfaces at
/// the instance's current suspension point.
pub struct DurableFuture {
    ctx: WorkflowContext,
    target: CallTarget,
}

impl DurableFuture {
    pub(crate) fn new(ctx: WorkflowContext, target: CallTarget) -> Self {
        Self { ctx, target }
    }

    pub(crate) fn target(&self) -> &CallTarget {
        &self.target
    }

    /// Outcome and resolving-event position, without consuming the future.
    fn peek(&self) -> Option<(usize, Result<Value, TaskError>)> {
        self.ctx.resolve(&self.target)
    }

    /// Await the result and decode it into a typed value.
    pub async fn into_typed<T: DeserializeOwned>(self) -> Result<T, TaskError> {
        let target = self.target.clone();
        let value = self.await?;
        serde_json::from_value(value).map_err(|e| match target {
            CallTarget::SubOrchestration { orchestration, .. } => TaskError::SubOrchestration {
                orchestration,
                message: format!("failed to decode result: {}", e),
            },
            CallTarget::Activity { name, .. } => TaskError::Activity {
                name,
                message: format!("failed to decode result: {}", e),
            },
            CallTarget::Timer { .. } | CallTarget::ExternalEvent { .. } => TaskError::Activity {
                name: "decode".to_string(),
                message: format!("failed to decode payload: {}", e),
            },
        })
    }
}

impl Future for DurableFuture {
    type Output = Result<Value, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // A detected fault freezes the turn; the runtime terminates the
        // instance after the poll returns.
        if this.ctx.fault().is_some() {
            return Poll::Pending;
        }

        if let Some((_, outcome)) = this.peek() {
            return Poll::Ready(outcome);
        }

        if let Some(reason) = this.ctx.cancelled() {
            return Poll::Ready(Err(TaskError::Cancelled { reason }));
        }

        Poll::Pending
    }
}

/// Failure surfaced by a fan-in wait.
///
/// Carries the first failure observed plus every member result already
/// recorded at that point, `(member index, result)`, so compensation can
/// clean up partial output. Remaining members are not cancelled; their
/// results still get recorded and are simply ignored.
#[derive(Debug)]
pub struct FanInFailure {
    pub error: TaskError,
    pub completed: Vec<(usize, Value)>,
}

/// Fan-out/fan-in: await every member of a set of scheduled calls.
///
/// Results come back in member (schedule) order regardless of arrival
/// order. Fails as soon as any member has a recorded failure — "first"
/// meaning earliest in history, which keeps the choice stable across
/// replays.
pub struct JoinAll {
    members: Vec<DurableFuture>,
}

pub fn join_all(members: Vec<DurableFuture>) -> JoinAll {
    JoinAll { members }
}

impl Future for JoinAll {
    type Output = Result<Vec<Value>, FanInFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.members.is_empty() {
            return Poll::Ready(Ok(Vec::new()));
        }

        let ctx = this.members[0].ctx.clone();
        if ctx.fault().is_some() {
            return Poll::Pending;
        }

        let mut completed: Vec<(usize, Value)> = Vec::new();
        let mut failures: Vec<(usize, TaskError)> = Vec::new();
        let mut pending = false;

        for (index, member) in this.members.iter().enumerate() {
            match member.peek() {
                Some((_, Ok(value))) => completed.push((index, value)),
                Some((pos, Err(error))) => failures.push((pos, error)),
                None => pending = true,
            }
        }

        if let Some((_, error)) = failures.into_iter().min_by_key(|(pos, _)| *pos) {
            return Poll::Ready(Err(FanInFailure { error, completed }));
        }

        if pending {
            if let Some(reason) = ctx.cancelled() {
                return Poll::Ready(Err(FanInFailure {
                    error: TaskError::Cancelled { reason },
                    completed,
                }));
            }
            return Poll::Pending;
        }

        Poll::Ready(Ok(completed.into_iter().map(|(_, v)| v).collect()))
    }
}

/// Which side of a two-way race resolved first.
#[derive(Debug)]
pub enum RaceWinner {
    First(Result<Value, TaskError>),
    Second(Result<Value, TaskError>),
}

/// Race two scheduled calls; the one whose completion appears earlier in
/// history wins. The loser is not cancelled — its completion is still
/// recorded and ignored, which keeps the race replay-safe.
///
/// The outer error is cancellation while both sides are unresolved.
pub struct Race {
    first: DurableFuture,
    second: DurableFuture,
}

pub fn race(first: DurableFuture, second: DurableFuture) -> Race {
    Race { first, second }
}

impl Future for Race {
    type Output = Result<RaceWinner, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let ctx = this.first.ctx.clone();
        if ctx.fault().is_some() {
            return Poll::Pending;
        }

        match (this.first.peek(), this.second.peek()) {
            (Some((a, out_a)), Some((b, out_b))) => {
                if a <= b {
                    Poll::Ready(Ok(RaceWinner::First(out_a)))
                } else {
                    Poll::Ready(Ok(RaceWinner::Second(out_b)))
                }
            }
            (Some((_, out)), None) => Poll::Ready(Ok(RaceWinner::First(out))),
            (None, Some((_, out))) => Poll::Ready(Ok(RaceWinner::Second(out))),
            (None, None) => {
                if let Some(reason) = ctx.cancelled() {
                    return Poll::Ready(Err(TaskError::Cancelled { reason }));
                }
                Poll::Pending
            }
        }
    }
}
