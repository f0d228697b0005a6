//! Activity dispatcher: work queue, worker pool and retry handling.
//!
//! Scheduled activity calls are placed on a shared queue. Workers pull
//! items, execute the named activity and report the outcome back through a
//! `CompletionSink`. Transient infrastructure failures are retried here
//! with exponential backoff and never reach orchestration code; business
//! failures are reported as task failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::activities::{ActivityError, ActivityRegistry};

/// One unit of work handed to the worker pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub instance: String,
    pub seq: u64,
    pub activity: String,
    pub input: Value,
}

/// Where workers report activity outcomes.
///
/// Exactly-once completion recording is the sink's responsibility: a
/// duplicate report for an already-settled `(instance, seq)` is dropped
/// there, not by workers.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn activity_completed(&self, instance: &str, seq: u64, result: Value);
    async fn activity_failed(&self, instance: &str, seq: u64, error: String);
}

/// Retry policy for transient activity failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier applied after each retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    250
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Hands scheduled work to a pool of worker tasks.
pub struct ActivityDispatcher {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl ActivityDispatcher {
    /// Spawn `workers` worker tasks against a shared queue.
    pub fn start(
        activities: ActivityRegistry,
        sink: Arc<dyn CompletionSink>,
        workers: usize,
        retry: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let activities = activities.clone();
            let sink = Arc::clone(&sink);
            let retry = retry.clone();

            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else {
                        break;
                    };

                    debug!(
                        worker_id,
                        instance = %item.instance,
                        seq = item.seq,
                        activity = %item.activity,
                        "Executing work item"
                    );

                    match execute_with_retry(&activities, &retry, &item).await {
                        Ok(result) => {
                            sink.activity_completed(&item.instance, item.seq, result)
                                .await;
                        }
                        Err(message) => {
                            sink.activity_failed(&item.instance, item.seq, message).await;
                        }
                    }
                }
            });
        }

        Self { tx }
    }

    /// Queue a work item for execution. At-least-once delivery: recovery
    /// after a crash may enqueue the same item again, which is safe because
    /// completion recording deduplicates.
    pub fn dispatch(&self, item: WorkItem) -> Result<()> {
        self.tx
            .send(item)
            .map_err(|e| anyhow::anyhow!("work queue closed: {}", e))
    }
}

/// Run an activity, retrying transient failures per the policy.
async fn execute_with_retry(
    activities: &ActivityRegistry,
    retry: &RetryPolicy,
    item: &WorkItem,
) -> Result<Value, String> {
    let Some(activity) = activities.get(&item.activity) else {
        return Err(format!("unknown activity '{}'", item.activity));
    };

    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match activity.execute(item.input.clone()).await {
            Ok(result) => return Ok(result),
            Err(ActivityError::Business(message)) => {
                error!(
                    activity = %item.activity,
                    instance = %item.instance,
                    seq = item.seq,
                    %message,
                    "Activity failed"
                );
                return Err(message);
            }
            Err(ActivityError::Transient(message)) => {
                if retry.should_retry(attempt) {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        activity = %item.activity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %message,
                        "Transient activity failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                error!(
                    activity = %item.activity,
                    attempt,
                    %message,
                    "Transient failures exhausted retries"
                );
                return Err(format!(
                    "transient failure persisted after {} attempts: {}",
                    attempt, message
                ));
            }
        }
    }
}
