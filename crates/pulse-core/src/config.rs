use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOCK_LIMIT: i64 = 20;
pub const DEFAULT_PROCESS_EVERY_SECS: u64 = 5; // dispatch poll cadence
pub const DEFAULT_LOCK_LIFETIME_SECS: u64 = 600; // locks older than this are stale
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Top-level config (pulse.toml + PULSE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl DatabaseConfig {
    /// Create the directory the database file lives in.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatch tuning for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker identity written to `locked_by`. A random suffix is appended at
    /// startup so two processes sharing a name never share lock ownership.
    #[serde(default = "default_worker_name")]
    pub name: String,
    /// Max jobs this process may hold locked at once. Zero or negative pauses dispatch.
    #[serde(default = "default_lock_limit")]
    pub lock_limit: i64,
    #[serde(default = "default_process_every_secs")]
    pub process_every_secs: u64,
    /// A lock held longer than this is treated as abandoned and may be reclaimed.
    #[serde(default = "default_lock_lifetime_secs")]
    pub lock_lifetime_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Delete one-shot jobs after they complete successfully.
    #[serde(default = "bool_true")]
    pub remove_on_complete: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            lock_limit: DEFAULT_LOCK_LIMIT,
            process_every_secs: DEFAULT_PROCESS_EVERY_SECS,
            lock_lifetime_secs: DEFAULT_LOCK_LIFETIME_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            remove_on_complete: true,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_worker_name() -> String {
    "pulse".to_string()
}
fn default_lock_limit() -> i64 {
    DEFAULT_LOCK_LIMIT
}
fn default_process_every_secs() -> u64 {
    DEFAULT_PROCESS_EVERY_SECS
}
fn default_lock_lifetime_secs() -> u64 {
    DEFAULT_LOCK_LIFETIME_SECS
}
fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.pulse/pulse.db", home)
}

impl PulseConfig {
    /// Load config from a TOML file with PULSE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `PULSE_SCHEDULER__LOCK_LIMIT=5`,
    /// so field names that contain `_` survive the split.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: PulseConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PULSE_").split("__"))
            .extract()
            .map_err(|e| crate::error::PulseError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    if let Ok(path) = std::env::var("PULSE_CONFIG") {
        return path;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.pulse/pulse.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = PulseConfig::load(path.to_str()).unwrap();
        assert_eq!(config.scheduler.lock_limit, DEFAULT_LOCK_LIMIT);
        assert_eq!(config.scheduler.process_every_secs, DEFAULT_PROCESS_EVERY_SECS);
        assert!(config.scheduler.remove_on_complete);
        assert!(config.database.path.ends_with("pulse.db"));
    }

    #[test]
    fn toml_overrides_scheduler_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\npath = \"/tmp/jobs.db\"\n\n[scheduler]\nname = \"worker-a\"\nlock_limit = 3\nlock_lifetime_secs = 60\nremove_on_complete = false"
        )
        .unwrap();

        let config = PulseConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.database.path, "/tmp/jobs.db");
        assert_eq!(config.scheduler.name, "worker-a");
        assert_eq!(config.scheduler.lock_limit, 3);
        assert_eq!(config.scheduler.lock_lifetime_secs, 60);
        // untouched keys keep their defaults
        assert_eq!(config.scheduler.shutdown_timeout_secs, DEFAULT_SHUTDOWN_TIMEOUT_SECS);
        assert!(!config.scheduler.remove_on_complete);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nlock_limit = \"lots\"").unwrap();

        let err = PulseConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn ensure_parent_dir_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConfig {
            path: dir.path().join("a/b/pulse.db").to_string_lossy().into_owned(),
        };
        db.ensure_parent_dir().unwrap();
        assert!(dir.path().join("a/b").is_dir());

        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let db = DatabaseConfig {
            path: blocker.join("pulse.db").to_string_lossy().into_owned(),
        };
        assert_eq!(db.ensure_parent_dir().unwrap_err().code(), "IO_ERROR");
    }
}
