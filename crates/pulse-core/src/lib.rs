//! `pulse-core`: configuration and error types shared by the Pulse crates.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, PulseConfig, SchedulerConfig};
pub use error::{PulseError, Result};
