//! Activity interfaces for external units of work.
//!
//! Activities are the opaque collaborators of the orchestrator: named,
//! stateless units that take a JSON input and produce a JSON result. The
//! engine knows nothing about what they do — it only schedules them and
//! records their outcomes.

pub mod media;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// How an activity execution can fail.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    /// Infrastructure hiccup; the dispatcher retries it and orchestration
    /// code never sees it
    #[error("transient: {0}")]
    Transient(String),

    /// Business failure; surfaced to the orchestration as a failed task
    #[error("{0}")]
    Business(String),
}

/// A named unit of work executed by the worker pool.
///
/// Workers are stateless and may be retried on transient infrastructure
/// failure, so implementations should tolerate re-execution.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Name the orchestration schedules this activity under
    fn name(&self) -> &str;

    /// Execute with a JSON input, producing a JSON result
    async fn execute(&self, input: Value) -> Result<Value, ActivityError>;
}

/// Wraps a plain function as an `Activity`. Handy in tests and for
/// activities with trivial bodies.
pub struct FnActivity<F> {
    name: String,
    f: F,
}

impl<F> FnActivity<F>
where
    F: Fn(Value) -> Result<Value, ActivityError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Activity for FnActivity<F>
where
    F: Fn(Value) -> Result<Value, ActivityError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        (self.f)(input)
    }
}

/// Registry mapping activity names to implementations.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    map: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity under its own name, replacing any previous
    /// registration. Replacement is deliberate: tests override individual
    /// activities on top of the standard set.
    pub fn register(&mut self, activity: Arc<dyn Activity>) {
        self.map.insert(activity.name().to_string(), activity);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.map.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}
