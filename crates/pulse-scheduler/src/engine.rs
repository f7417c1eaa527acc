use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::ceiling::{LockCeiling, LockSlot};
use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::handler::HandlerRegistry;
use crate::schedule;
use crate::store::{ClaimRequest, JobStore, Lease};
use crate::types::JobRecord;

/// Dispatch tuning for one worker.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Written to `locked_by` on every claim.
    pub owner: String,
    pub process_every: Duration,
    /// Locks older than this are considered abandoned.
    pub lock_lifetime: Duration,
    pub shutdown_timeout: Duration,
    /// Delete one-shot jobs after a successful run.
    pub remove_on_complete: bool,
}

/// A job this worker has locked, together with its slot in the lock ceiling.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: JobRecord,
    lease: Lease,
    slot: LockSlot,
}

impl ClaimedJob {
    /// The lock taken by the claim, fixed for the whole run.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    /// One-shot job completed and was deleted.
    Removed,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// The record as written back (or as it was before removal).
    pub job: JobRecord,
    pub outcome: JobOutcome,
    /// `false` if another worker took the lock over before we finished.
    pub lock_held: bool,
}

/// Claims due jobs under the lock ceiling and runs them.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    ceiling: Arc<LockCeiling>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
    running: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        ceiling: Arc<LockCeiling>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            handlers,
            ceiling,
            clock,
            settings,
            running: Mutex::new(JoinSet::new()),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Lock as many due jobs as the ceiling currently allows.
    ///
    /// Hitting the ceiling is backpressure, not an error: nothing is claimed
    /// and the next cycle tries again.
    pub async fn claim(&self) -> Result<Vec<ClaimedJob>> {
        let names = self.handlers.names();
        if names.is_empty() {
            debug!("no job handlers defined; nothing to claim");
            return Ok(Vec::new());
        }

        let mut reservation = self.ceiling.reserve(usize::MAX);
        if reservation.is_empty() {
            debug!(
                locked = self.ceiling.locked(),
                limit = self.ceiling.limit(),
                "lock ceiling reached; skipping claim"
            );
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let lifetime = chrono::Duration::from_std(self.settings.lock_lifetime)
            .map_err(|e| SchedulerError::Internal(format!("lock lifetime out of range: {e}")))?;
        let request = ClaimRequest {
            now,
            limit: reservation.len(),
            stale_before: now - lifetime,
            owner: self.settings.owner.clone(),
            names: Some(names),
        };

        let jobs = self.store.claim_due(request).await?;
        let mut claimed = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Some(lease) = Lease::of(&job) else {
                warn!(job_id = %job.id, "store returned an unlocked job from a claim; skipping");
                continue;
            };
            match reservation.take() {
                Some(slot) => {
                    info!(job_id = %job.id, name = %job.name, "job claimed");
                    claimed.push(ClaimedJob { job, lease, slot });
                }
                None => {
                    // Store returned more than asked; hand the extra back.
                    warn!(job_id = %job.id, "claim exceeded reservation; releasing");
                    self.store.finish(&job, &lease).await?;
                }
            }
        }
        Ok(claimed)
    }

    /// Run one claimed job to completion and write the result back.
    pub async fn run_claimed(&self, claimed: ClaimedJob) -> Result<RunReport> {
        let ClaimedJob { mut job, lease, slot } = claimed;

        // Persisted by `finish`, which is conditional on still owning the lock.
        job.last_run_at = Some(self.clock.now());

        let result = match self.handlers.get(&job.name) {
            Some(handler) => match AssertUnwindSafe(handler.run(&job)).catch_unwind().await {
                Ok(result) => result.map_err(|e| format!("{e:#}")),
                Err(_) => Err("job handler panicked".to_string()),
            },
            None => Err(format!("no handler defined for job '{}'", job.name)),
        };

        let finished_at = self.clock.now();
        job.last_finished_at = Some(finished_at);
        job.updated_at = finished_at;

        let outcome = match result {
            Ok(()) => {
                info!(job_id = %job.id, name = %job.name, "job completed");
                JobOutcome::Completed
            }
            Err(reason) => {
                job.fail_count += 1;
                job.failed_at = Some(finished_at);
                job.fail_reason = Some(reason.clone());
                warn!(job_id = %job.id, name = %job.name, fail_count = job.fail_count, %reason, "job failed");
                JobOutcome::Failed(reason)
            }
        };

        job.next_run_at = if job.is_repeating() {
            match schedule::next_run_after(&job, finished_at) {
                Ok(next) => next,
                Err(e) => {
                    error!(job_id = %job.id, "cannot reschedule job: {e}");
                    None
                }
            }
        } else {
            None
        };

        let lock_held = if !job.is_repeating()
            && outcome == JobOutcome::Completed
            && self.settings.remove_on_complete
        {
            if self.store.delete_owned(&job, &lease).await? {
                info!(job_id = %job.id, name = %job.name, "one-shot job removed");
                drop(slot);
                return Ok(RunReport {
                    job,
                    outcome: JobOutcome::Removed,
                    lock_held: true,
                });
            }
            false
        } else {
            self.store.finish(&job, &lease).await?
        };
        if !lock_held {
            warn!(job_id = %job.id, "lock lost before finish; leaving record to its new owner");
        }
        job.locked_at = None;
        job.locked_by = None;
        drop(slot);

        Ok(RunReport {
            job,
            outcome,
            lock_held,
        })
    }

    /// One dispatch cycle: claim, then run each claimed job in the background.
    ///
    /// Returns the number of jobs claimed.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        let claimed = self.claim().await?;
        let count = claimed.len();

        let mut running = self.running.lock().await;
        while running.try_join_next().is_some() {}
        for job in claimed {
            let dispatcher = Arc::clone(self);
            running.spawn(async move {
                let job_id = job.job.id.clone();
                if let Err(e) = dispatcher.run_claimed(job).await {
                    error!(%job_id, "failed to record job result: {e}");
                }
            });
        }
        Ok(count)
    }

    /// Wait for every job started by [`tick`](Self::tick) to finish.
    pub async fn drain(&self) {
        let mut running = self.running.lock().await;
        while running.join_next().await.is_some() {}
    }

    /// Main event loop. Polls every `process_every` until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            owner = %self.settings.owner,
            every_ms = self.settings.process_every.as_millis() as u64,
            "dispatch loop started"
        );

        let mut interval = tokio::time::interval(self.settings.process_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("dispatch tick error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop accepting work: wait for in-flight jobs, then abort stragglers and
    /// release every lock this worker still holds.
    async fn shutdown(&self) {
        info!("dispatch loop shutting down");
        let mut running = self.running.lock().await;
        let waited = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while running.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            warn!(
                in_flight = running.len(),
                "shutdown timeout elapsed; aborting running jobs"
            );
            running.abort_all();
            while running.join_next().await.is_some() {}
        }

        match self.store.release_owned(&self.settings.owner).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "released locks held at shutdown"),
            Err(e) => error!("failed to release locks at shutdown: {e}"),
        }
        debug!(at = %self.clock.now(), "dispatch loop stopped");
    }
}
