//! `pulse-scheduler`: recurring job registration and lock-limited dispatch.
//!
//! # Overview
//!
//! Jobs live in a shared [`store::JobStore`] (SQLite by default) that several
//! worker processes may open at once. [`Pulse::every`] turns an interval and
//! one or more names into `single`-type repeating jobs, upserted by name so
//! re-registering on restart never duplicates them. Each [`Pulse`] owns a
//! [`ceiling::LockCeiling`]; its [`engine::Dispatcher`] claims due jobs only
//! while the ceiling has room, runs them through the registered
//! [`handler::JobHandler`], and writes the result back.
//!
//! # Interval formats
//!
//! | Form                | Example          | First run                      |
//! |---------------------|------------------|--------------------------------|
//! | Human duration      | `"5 minutes"`    | Immediately (or after one period with `skip_immediate`) |
//! | Milliseconds        | `"90000"`        | Same as a duration             |
//! | Cron (5 to 7 field) | `"*/15 * * * *"` | Next occurrence in the job's timezone |
//!
//! The ceiling is per process. Fleet-wide concurrency is the sum of every
//! worker's limit.

pub mod ceiling;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod pulse;
pub mod schedule;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{ClaimedJob, Dispatcher, JobOutcome, RunReport};
pub use error::{Result, SchedulerError};
pub use handler::{handler_fn, JobHandler};
pub use pulse::Pulse;
pub use store::{JobStore, Lease, SqliteJobStore};
pub use types::{JobNames, JobRecord, JobState, JobType, RepeatOptions, Scheduled};
