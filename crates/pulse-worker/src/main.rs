use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use pulse_core::PulseConfig;
use pulse_scheduler::{handler_fn, JobRecord, JobStore, Pulse, SqliteJobStore};
use tracing::{info, warn};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_worker=info,pulse_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > PULSE_CONFIG env > ~/.pulse/pulse.toml
    let mut config = PulseConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        PulseConfig::default()
    });
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, "opening SQLite database");
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&config.database.path)?);
    let pulse = Pulse::new(store, &config.scheduler);

    match cli.command {
        Command::Every {
            interval,
            names,
            data,
            timezone,
            skip_immediate,
        } => {
            let options = cli::repeat_options(timezone, skip_immediate);
            let scheduled = pulse
                .every(&interval, cli::job_names(names), data, options)
                .await?;
            for job in scheduled.into_vec() {
                println!("{}  {}  next={}", job.id, job.name, fmt_time(job.next_run_at));
            }
        }
        Command::List => {
            for job in pulse.jobs().await? {
                println!(
                    "{}  {:<24} {:<7} {:<8} every={:<16} next={}  fails={}",
                    job.id,
                    job.name,
                    job.job_type,
                    job.state(),
                    job.repeat_interval.as_deref().unwrap_or("-"),
                    fmt_time(job.next_run_at),
                    job.fail_count,
                );
            }
        }
        Command::Cancel { name } => {
            let removed = pulse.cancel(&name).await?;
            println!("removed {removed} job(s) named {name}");
        }
        Command::Run { lock_limit, jobs } => {
            if let Some(limit) = lock_limit {
                pulse.set_lock_limit(limit);
            }

            let names: BTreeSet<String> = if jobs.is_empty() {
                pulse.jobs().await?.into_iter().map(|j| j.name).collect()
            } else {
                jobs.into_iter().collect()
            };
            if names.is_empty() {
                warn!("no job names to handle; worker will stay idle");
            }
            for name in &names {
                pulse.define(
                    name,
                    handler_fn(|job: JobRecord| async move {
                        info!(job_id = %job.id, name = %job.name, data = %job.data, "running job");
                        Ok(())
                    }),
                );
            }

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let loop_handle = pulse.start(shutdown_rx);
            info!(
                worker = %pulse.worker_id(),
                lock_limit = pulse.lock_limit(),
                jobs = names.len(),
                "Pulse worker running, Ctrl-C to stop"
            );

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            loop_handle.await?;
        }
    }

    Ok(())
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}
