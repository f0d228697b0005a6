//! Durable orchestration engine.
//!
//! The pieces, leaf-first:
//!
//! - `history`: append-only per-instance history log (JSONL)
//! - `context` + `turn`: deterministic replay of decision functions
//! - `futures`: durable futures, fan-out/fan-in and racing
//! - `dispatcher`: activity work queue, worker pool and retries
//! - `compensation`: single-cleanup failure handling
//! - `runtime`: instance hosting, wake-ups and recovery
//! - `watcher`: filesystem wakes for out-of-band appends

pub mod compensation;
pub mod context;
pub mod dispatcher;
pub mod futures;
pub mod history;
pub mod runtime;
pub mod turn;
pub mod watcher;

pub use compensation::{with_compensation, Compensation};
pub use context::{Action, NonDeterminism, WorkflowContext};
pub use dispatcher::{ActivityDispatcher, CompletionSink, RetryPolicy, WorkItem};
pub use futures::{join_all, race, DurableFuture, FanInFailure, JoinAll, Race, RaceWinner};
pub use history::HistoryLog;
pub use runtime::{
    append_signal, list_instances, read_status, ClientError, Runtime, RuntimeOptions,
};
pub use turn::{run_turn, TurnOutcome};
pub use watcher::WakeWatcher;
