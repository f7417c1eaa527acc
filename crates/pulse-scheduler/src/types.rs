use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::schedule;

/// How many instances of a named job may exist in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Unique by name. Saving again upserts the existing record.
    Single,
    /// Any number of records may share the name.
    Normal,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobType::Single => "single",
            JobType::Normal => "normal",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(JobType::Single),
            "normal" => Ok(JobType::Normal),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Options accepted by `every` when setting up a repeating job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// IANA zone cron expressions are evaluated in. Defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Wait one full interval before the first run instead of running now.
    #[serde(default)]
    pub skip_immediate: bool,
    /// No run is scheduled before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    /// No run is scheduled after this instant; the job goes idle instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

/// Where a job currently sits in its lifecycle, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Has a `next_run_at` and no lock.
    Pending,
    /// Claimed by a worker.
    Locked,
    /// Disabled, or no further run scheduled.
    Idle,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Locked => "locked",
            JobState::Idle => "idle",
        };
        f.pad(s)
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// UUIDv7 string, assigned on construction.
    pub id: String,
    /// Name of the handler definition that runs this job.
    pub name: String,
    pub job_type: JobType,
    /// Higher runs first among jobs due at the same instant.
    pub priority: i32,
    /// Arbitrary JSON payload handed to the handler.
    pub data: Value,
    /// Cron expression or duration. `None` for one-shot jobs.
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Next instant the job becomes due. `None` means never.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Set while a worker owns execution.
    pub locked_at: Option<DateTime<Utc>>,
    /// Worker identity that holds the lock.
    pub locked_by: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_reason: Option<String>,
    pub fail_count: u32,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build an unsaved one-shot `normal` job with no run scheduled.
    pub fn new(name: &str, data: Value, now: DateTime<Utc>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "job name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            job_type: JobType::Normal,
            priority: 0,
            data,
            repeat_interval: None,
            repeat_timezone: None,
            start_date: None,
            end_date: None,
            next_run_at: None,
            last_run_at: None,
            last_finished_at: None,
            locked_at: None,
            locked_by: None,
            failed_at: None,
            fail_reason: None,
            fail_count: 0,
            disabled: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Make this job repeat on `interval` and compute its first `next_run_at`.
    ///
    /// Fails without touching `self` when the interval or timezone is invalid.
    pub fn repeat_every(
        &mut self,
        interval: &str,
        options: &RepeatOptions,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let first = schedule::first_run_at(interval, options, now)?;
        self.repeat_interval = Some(interval.to_string());
        self.repeat_timezone = options.timezone.clone();
        self.start_date = options.start_date;
        self.end_date = options.end_date;
        self.next_run_at = first;
        Ok(())
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat_interval.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn state(&self) -> JobState {
        if self.is_locked() {
            JobState::Locked
        } else if self.disabled || self.next_run_at.is_none() {
            JobState::Idle
        } else {
            JobState::Pending
        }
    }
}

/// The name argument of `every`: one job, or one job per name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobNames {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for JobNames {
    fn from(name: &str) -> Self {
        JobNames::One(name.to_string())
    }
}

impl From<String> for JobNames {
    fn from(name: String) -> Self {
        JobNames::One(name)
    }
}

impl From<Vec<String>> for JobNames {
    fn from(names: Vec<String>) -> Self {
        JobNames::Many(names)
    }
}

impl From<Vec<&str>> for JobNames {
    fn from(names: Vec<&str>) -> Self {
        JobNames::Many(names.into_iter().map(String::from).collect())
    }
}

impl From<&[&str]> for JobNames {
    fn from(names: &[&str]) -> Self {
        JobNames::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for JobNames {
    fn from(names: [&str; N]) -> Self {
        JobNames::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

/// What `every` created: mirrors the shape of the [`JobNames`] it was given.
#[derive(Debug, Clone, PartialEq)]
pub enum Scheduled {
    One(JobRecord),
    Many(Vec<JobRecord>),
}

impl Scheduled {
    pub fn into_vec(self) -> Vec<JobRecord> {
        match self {
            Scheduled::One(job) => vec![job],
            Scheduled::Many(jobs) => jobs,
        }
    }

    /// The single job, or `None` if this came from a list of names.
    pub fn into_one(self) -> Option<JobRecord> {
        match self {
            Scheduled::One(job) => Some(job),
            Scheduled::Many(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Scheduled::One(_) => 1,
            Scheduled::Many(jobs) => jobs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn job_type_round_trips_through_str() {
        assert_eq!("single".parse::<JobType>().unwrap(), JobType::Single);
        assert_eq!(JobType::Normal.to_string(), "normal");
        assert!("bogus".parse::<JobType>().is_err());
    }

    #[test]
    fn new_rejects_blank_name() {
        let err = JobRecord::new("  ", json!({}), at(9, 0)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn repeat_every_runs_immediately_by_default() {
        let mut job = JobRecord::new("report", json!({}), at(9, 0)).unwrap();
        job.repeat_every("5 minutes", &RepeatOptions::default(), at(9, 0))
            .unwrap();
        assert_eq!(job.repeat_interval.as_deref(), Some("5 minutes"));
        assert_eq!(job.next_run_at, Some(at(9, 0)));
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn repeat_every_leaves_job_untouched_on_bad_interval() {
        let mut job = JobRecord::new("report", json!({}), at(9, 0)).unwrap();
        assert!(job
            .repeat_every("whenever", &RepeatOptions::default(), at(9, 0))
            .is_err());
        assert!(job.repeat_interval.is_none());
        assert_eq!(job.state(), JobState::Idle);
    }

    #[test]
    fn job_names_conversions() {
        assert_eq!(JobNames::from("a"), JobNames::One("a".to_string()));
        assert_eq!(
            JobNames::from(["a", "b"]),
            JobNames::Many(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(JobNames::from(Vec::<String>::new()), JobNames::Many(vec![]));
    }
}
