//! Orchestration definitions and registry.
//!
//! An orchestration is a deterministic decision function over a
//! `WorkflowContext`. It must schedule the exact same calls in the exact
//! same order for a given input and history prefix, which rules out
//! wall-clock reads, random values and uncoordinated I/O inside the
//! function — anything of that sort has to go through the context so it is
//! recorded and replayed.

pub mod video;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::WorkflowContext;
use crate::domain::WorkflowFailure;

/// A named orchestration decision function.
#[async_trait]
pub trait Orchestration: Send + Sync {
    /// Name instances of this orchestration are started under
    fn name(&self) -> &str;

    /// One replay of the decision function
    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowFailure>;
}

/// Wraps a plain async function as an `Orchestration`.
pub struct FnOrchestration<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnOrchestration<F>
where
    F: Fn(WorkflowContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, WorkflowFailure>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Orchestration for FnOrchestration<F>
where
    F: Fn(WorkflowContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, WorkflowFailure>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowFailure> {
        (self.f)(ctx, input).await
    }
}

/// Registry mapping orchestration names to decision functions.
#[derive(Default, Clone)]
pub struct OrchestrationRegistry {
    map: HashMap<String, Arc<dyn Orchestration>>,
}

impl OrchestrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, orchestration: Arc<dyn Orchestration>) {
        self.map
            .insert(orchestration.name().to_string(), orchestration);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Orchestration>> {
        self.map.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}
