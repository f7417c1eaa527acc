use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::types::JobRecord;

/// User code that runs a claimed job.
///
/// `Ok(())` marks the run completed; an error marks it failed and its
/// rendered chain is stored as the job's `fail_reason`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &JobRecord) -> anyhow::Result<()>;
}

/// Adapter so a plain async closure can be registered as a handler.
pub struct FnHandler<F>(F);

/// Wrap `f` as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, job: &JobRecord) -> anyhow::Result<()> {
        (self.0)(job.clone()).await
    }
}

/// Job name → handler. A worker only claims jobs it has a handler for.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `name`.
    pub fn register(&self, name: &str, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(name.to_string(), handler).is_some() {
            debug!(name, "job handler replaced");
        } else {
            debug!(name, "job handler registered");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}
