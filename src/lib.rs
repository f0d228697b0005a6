//! showrunner - durable video pipeline orchestrator
//!
//! A replay-based orchestration engine for multi-step media workflows.
//! Orchestration decision logic runs deterministically against an
//! append-only history log: completed calls fast-forward from their
//! recorded results, new calls are handed to a worker pool, and anything
//! unresolved suspends the instance until the outside world reports back.
//!
//! # Architecture
//!
//! - All scheduling decisions and their outcomes are immutable history
//!   events; the log is the only state that survives a suspension
//! - Decision functions are re-executed from the top on every wake-up and
//!   must stay deterministic — divergence from history is fatal, never
//!   patched over
//! - Failures route through a single compensation path and finish the
//!   instance with a structured failure output
//!
//! # Modules
//!
//! - `core`: the engine (history log, replay, dispatcher, fan-in,
//!   compensation, runtime, wake watcher)
//! - `domain`: data structures (history events, instance state, failures,
//!   video value types)
//! - `activities`: the activity seam and the simulated media activities
//! - `workflows`: orchestration registry and the video pipeline
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline (blocks awaiting approval)
//! showrunner run raw/video1.mp4
//!
//! # From another terminal
//! showrunner approve <instance-id>
//!
//! # Inspect
//! showrunner status <instance-id>
//! showrunner list
//! ```

pub mod activities;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod workflows;

// Re-export main types at crate root for convenience
pub use core::{
    join_all, race, with_compensation, ClientError, Compensation, DurableFuture, FanInFailure,
    HistoryLog, RaceWinner, RetryPolicy, Runtime, RuntimeOptions, WakeWatcher, WorkflowContext,
};
pub use domain::{
    EventKind, FailureCategory, HistoryEvent, Instance, InstanceStatus, TaskError, VideoFileInfo,
    WorkflowFailure,
};

pub use activities::{Activity, ActivityError, ActivityRegistry, FnActivity};
pub use workflows::{FnOrchestration, Orchestration, OrchestrationRegistry};
