//! Single-poll turn runner for orchestration decision functions.
//!
//! Each wake-up re-executes the decision function from the top against the
//! current history. The future is polled exactly once with a no-op waker:
//! replay hits resolve synchronously inside that poll, and the first truly
//! unresolved call leaves the future pending, which ends the turn. No
//! in-memory state survives — resume means building a fresh future over a
//! longer history.

use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde_json::Value;

use crate::domain::{HistoryEvent, WorkflowFailure};

use super::context::{Action, NonDeterminism, WorkflowContext};

/// What one replay turn decided.
pub struct TurnOutcome {
    /// New scheduling decisions for the runtime to materialize
    pub actions: Vec<Action>,

    /// Present when the decision function ran to completion this turn
    pub output: Option<Result<Value, WorkflowFailure>>,

    /// Present when the decision function diverged from history; the turn's
    /// actions are discarded and the instance must be terminated
    pub fault: Option<NonDeterminism>,
}

/// Replay the decision function once against `history`.
pub fn run_turn<F, Fut>(history: Vec<HistoryEvent>, decision: F) -> TurnOutcome
where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = Result<Value, WorkflowFailure>>,
{
    let ctx = WorkflowContext::new(history);
    let mut fut = pin!(decision(ctx.clone()));

    let waker = noop_waker();
    let mut poll_cx = Context::from_waker(&waker);

    let output = match fut.as_mut().poll(&mut poll_cx) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };

    if let Some(fault) = ctx.fault() {
        return TurnOutcome {
            actions: Vec::new(),
            output: None,
            fault: Some(fault),
        };
    }

    TurnOutcome {
        actions: ctx.take_actions(),
        output,
        fault: None,
    }
}

pub(crate) fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}
