use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};
use crate::types::{JobRecord, RepeatOptions};

/// A parsed repeat interval.
#[derive(Debug, Clone)]
pub enum Interval {
    /// Cron expression; occurrences are computed in the job's timezone.
    Cron(Box<cron::Schedule>),
    /// Fixed period, e.g. "5 minutes" or "90000" (milliseconds).
    Every(Duration),
}

impl Interval {
    /// Parse an interval string.
    ///
    /// Tried in order: bare integer (milliseconds), human duration
    /// ("5 minutes", "1h 30m"), then a 5 to 7 field cron expression.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(SchedulerError::InvalidInterval(
                "interval must not be empty".to_string(),
            ));
        }

        if let Ok(ms) = spec.parse::<i64>() {
            let dur = Duration::try_milliseconds(ms)
                .ok_or_else(|| SchedulerError::InvalidInterval(format!("{spec}: out of range")))?;
            return every(dur, spec);
        }

        if let Ok(std_dur) = humantime::parse_duration(spec) {
            let dur = Duration::from_std(std_dur)
                .map_err(|_| SchedulerError::InvalidInterval(format!("{spec}: out of range")))?;
            return every(dur, spec);
        }

        let fields = spec.split_whitespace().count();
        if (5..=7).contains(&fields) {
            let schedule = cron::Schedule::from_str(&to_cron_crate_format(spec))
                .map_err(|e| SchedulerError::InvalidInterval(format!("{spec}: {e}")))?;
            return Ok(Interval::Cron(Box::new(schedule)));
        }

        Err(SchedulerError::InvalidInterval(format!(
            "{spec}: not a duration or cron expression"
        )))
    }

    /// First occurrence strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Interval::Every(dur) => from.checked_add_signed(*dur),
            Interval::Cron(schedule) => schedule
                .after(&from.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

fn every(dur: Duration, spec: &str) -> Result<Interval> {
    if dur <= Duration::zero() {
        return Err(SchedulerError::InvalidInterval(format!(
            "{spec}: interval must be positive"
        )));
    }
    Ok(Interval::Every(dur))
}

/// The `cron` crate wants seconds (and optionally year) fields; a standard
/// 5-field Unix expression gets `0` seconds and any year.
fn to_cron_crate_format(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression} *")
    } else {
        expression.to_string()
    }
}

/// Resolve an optional IANA timezone name, defaulting to UTC.
pub fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(name.to_string())),
    }
}

/// Check an interval and timezone, and that the interval has a run after `now`.
pub fn validate(interval: &str, timezone: Option<&str>, now: DateTime<Utc>) -> Result<()> {
    let parsed = Interval::parse(interval)?;
    let tz = parse_timezone(timezone)?;
    if parsed.next_after(now, tz).is_none() {
        return Err(SchedulerError::InvalidInterval(format!(
            "{interval}: no run can be scheduled after {now}"
        )));
    }
    Ok(())
}

/// Next run for `interval` strictly after `from`.
///
/// Returns `Ok(None)` only when the schedule has no further occurrence.
pub fn compute_next_run(
    interval: &str,
    from: DateTime<Utc>,
    timezone: Option<&str>,
) -> Result<Option<DateTime<Utc>>> {
    let parsed = Interval::parse(interval)?;
    let tz = parse_timezone(timezone)?;
    Ok(parsed.next_after(from, tz))
}

/// First `next_run_at` for a newly registered repeating job.
///
/// Durations fire immediately unless `skip_immediate` is set; cron
/// expressions always wait for their next occurrence.
pub fn first_run_at(
    interval: &str,
    options: &RepeatOptions,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let parsed = Interval::parse(interval)?;
    let tz = parse_timezone(options.timezone.as_deref())?;

    let mut next = match parsed {
        Interval::Every(_) if !options.skip_immediate => Some(now),
        _ => parsed.next_after(now, tz),
    };

    if let (Some(start), Some(candidate)) = (options.start_date, next) {
        if candidate < start {
            next = match parsed {
                Interval::Every(_) => Some(start),
                // Align to the first occurrence at or after the start date.
                Interval::Cron(_) => parsed.next_after(start - Duration::seconds(1), tz),
            };
        }
    }

    Ok(within_end(next, options.end_date))
}

/// `next_run_at` for a repeating job that just finished at `finished_at`.
///
/// Computed from the completion time rather than the missed `next_run_at`,
/// so a worker that was paused does not replay every skipped occurrence.
pub fn next_run_after(job: &JobRecord, finished_at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let Some(interval) = job.repeat_interval.as_deref() else {
        return Ok(None);
    };
    let parsed = Interval::parse(interval)?;
    let tz = parse_timezone(job.repeat_timezone.as_deref())?;

    let from = match job.start_date {
        Some(start) if start > finished_at => start - Duration::milliseconds(1),
        _ => finished_at,
    };
    Ok(within_end(parsed.next_after(from, tz), job.end_date))
}

fn within_end(next: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (next, end) {
        (Some(candidate), Some(end)) if candidate > end => None,
        _ => next,
    }
}
