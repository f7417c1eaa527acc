use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use pulse_core::SchedulerConfig;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::ceiling::LockCeiling;
use crate::clock::{Clock, SystemClock};
use crate::engine::{DispatchSettings, Dispatcher};
use crate::error::{Result, SchedulerError};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::schedule;
use crate::store::JobStore;
use crate::types::{JobNames, JobRecord, JobType, RepeatOptions, Scheduled};

/// One scheduler instance: job creation, handler definitions and the lock
/// ceiling its dispatch loop runs under.
///
/// Instances share nothing but the store, so several can live in one process.
pub struct Pulse {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    ceiling: Arc<LockCeiling>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
}

impl Pulse {
    pub fn new(store: Arc<dyn JobStore>, config: &SchedulerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn JobStore>,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let ceiling = Arc::new(LockCeiling::new(config.lock_limit));
        let settings = DispatchSettings {
            owner: format!("{}-{}", config.name, Uuid::new_v4().simple()),
            // tokio intervals panic on a zero period.
            process_every: Duration::from_secs(config.process_every_secs.max(1)),
            lock_lifetime: Duration::from_secs(config.lock_lifetime_secs),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            remove_on_complete: config.remove_on_complete,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&handlers),
            Arc::clone(&ceiling),
            Arc::clone(&clock),
            settings,
        ));
        Self {
            store,
            handlers,
            ceiling,
            clock,
            dispatcher,
        }
    }

    /// Set how many jobs this instance may hold locked at once.
    ///
    /// Any integer is accepted. Zero or below stops new claims, which is how
    /// a worker is drained. Running jobs are never interrupted by a lower limit.
    pub fn set_lock_limit(&self, limit: i64) -> &Self {
        self.ceiling.set_limit(limit);
        info!(limit, "lock limit set");
        self
    }

    pub fn lock_limit(&self) -> i64 {
        self.ceiling.limit()
    }

    /// Jobs currently locked by this instance.
    pub fn locked_count(&self) -> usize {
        self.ceiling.locked()
    }

    /// Register the handler that runs jobs called `name`.
    pub fn define(&self, name: &str, handler: impl JobHandler + 'static) -> &Self {
        self.handlers.register(name, Arc::new(handler));
        self
    }

    /// Build an unsaved one-shot job stamped with this instance's clock.
    pub fn create(&self, name: &str, data: Value) -> Result<JobRecord> {
        JobRecord::new(name, data, self.clock.now())
    }

    /// Persist `job`. A `single` job replaces the stored job of the same name.
    pub async fn save(&self, mut job: JobRecord) -> Result<JobRecord> {
        job.updated_at = self.clock.now();
        let name = job.name.clone();
        self.store
            .create_or_replace(job)
            .await
            .map_err(|source| SchedulerError::Persistence {
                name,
                source: Box::new(source),
            })
    }

    /// Create one repeating `single` job per name.
    ///
    /// The interval, timezone and names are checked before anything is
    /// written. With a list of names every job is saved concurrently; if any
    /// save fails the call returns [`SchedulerError::Scheduling`] and the jobs
    /// that did save stay saved.
    #[instrument(skip(self, names, data, options))]
    pub async fn every(
        &self,
        interval: &str,
        names: impl Into<JobNames>,
        data: Option<Value>,
        options: Option<RepeatOptions>,
    ) -> Result<Scheduled> {
        let options = options.unwrap_or_default();
        let data = data.unwrap_or_else(|| json!({}));
        schedule::validate(interval, options.timezone.as_deref(), self.clock.now())?;

        match names.into() {
            JobNames::One(name) => {
                debug!("every() with a single name");
                let job = self.create_repeating(interval, &name, data, &options).await?;
                debug!(job_id = %job.id, name = %job.name, "every() -> job created");
                Ok(Scheduled::One(job))
            }
            JobNames::Many(names) => {
                debug!(count = names.len(), "every() with multiple names");
                if names.iter().any(|n| n.trim().is_empty()) {
                    return Err(SchedulerError::Validation(
                        "job name must not be empty".to_string(),
                    ));
                }

                let results = join_all(
                    names
                        .iter()
                        .map(|name| self.create_repeating(interval, name, data.clone(), &options)),
                )
                .await;

                let mut jobs = Vec::with_capacity(results.len());
                let mut failed = 0usize;
                for result in results {
                    match result {
                        Ok(job) => jobs.push(job),
                        Err(e) => {
                            failed += 1;
                            warn!(code = e.code(), "every() -> {e}");
                        }
                    }
                }
                if failed > 0 {
                    debug!(failed, saved = jobs.len(), "every() -> one or more jobs failed");
                    return Err(SchedulerError::Scheduling);
                }

                debug!("every() -> all jobs created successfully");
                Ok(Scheduled::Many(jobs))
            }
        }
    }

    async fn create_repeating(
        &self,
        interval: &str,
        name: &str,
        data: Value,
        options: &RepeatOptions,
    ) -> Result<JobRecord> {
        let now = self.clock.now();
        let mut job = JobRecord::new(name, data, now)?;
        job.job_type = JobType::Single;
        job.repeat_every(interval, options, now)?;
        self.save(job).await
    }

    /// Save a one-shot job due at `when`.
    #[instrument(skip(self, data))]
    pub async fn schedule(&self, when: DateTime<Utc>, name: &str, data: Value) -> Result<JobRecord> {
        let mut job = self.create(name, data)?;
        job.next_run_at = Some(when);
        self.save(job).await
    }

    /// Save a one-shot job that is due immediately.
    pub async fn now(&self, name: &str, data: Value) -> Result<JobRecord> {
        self.schedule(self.clock.now(), name, data).await
    }

    /// Delete every job called `name`. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn cancel(&self, name: &str) -> Result<usize> {
        let removed = self.store.delete_by_name(name).await?;
        info!(name, removed, "jobs cancelled");
        Ok(removed)
    }

    pub async fn jobs(&self) -> Result<Vec<JobRecord>> {
        self.store.list().await
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Identity this instance writes to `locked_by`.
    pub fn worker_id(&self) -> &str {
        &self.dispatcher.settings().owner
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Spawn the dispatch loop. It runs until `shutdown` broadcasts `true`.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(dispatcher.run(shutdown))
    }
}
