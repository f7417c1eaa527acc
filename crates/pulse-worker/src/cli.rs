use clap::{Parser, Subcommand};
use pulse_scheduler::{JobNames, RepeatOptions};
use serde_json::Value;

/// Register recurring jobs and run a Pulse dispatch worker.
#[derive(Parser, Debug)]
#[command(name = "pulse-worker", version)]
pub struct Cli {
    /// Config file (default: $PULSE_CONFIG, then ~/.pulse/pulse.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<String>,

    /// SQLite database file, overriding `[database] path`
    #[arg(long, global = true, value_name = "FILE")]
    pub db: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register one repeating job per NAME
    Every {
        /// Duration ("5 minutes", "90000" ms) or cron expression ("*/15 * * * *")
        interval: String,

        #[arg(required = true)]
        names: Vec<String>,

        /// JSON payload handed to the handler
        #[arg(long, value_parser = parse_json)]
        data: Option<Value>,

        /// IANA timezone cron expressions are evaluated in
        #[arg(long)]
        timezone: Option<String>,

        /// Wait one interval before the first run
        #[arg(long)]
        skip_immediate: bool,
    },

    /// List stored jobs
    List,

    /// Delete every job with NAME
    Cancel { name: String },

    /// Run the dispatch loop until Ctrl-C
    Run {
        /// Max jobs this worker holds locked at once (zero or less pauses dispatch)
        #[arg(long, allow_hyphen_values = true)]
        lock_limit: Option<i64>,

        /// Job names to handle, comma separated (default: every name in the store)
        #[arg(long, value_delimiter = ',')]
        jobs: Vec<String>,
    },
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

/// One name registers a single job; several register a batch.
pub fn job_names(mut names: Vec<String>) -> JobNames {
    if names.len() == 1 {
        JobNames::One(names.remove(0))
    } else {
        JobNames::Many(names)
    }
}

pub fn repeat_options(timezone: Option<String>, skip_immediate: bool) -> Option<RepeatOptions> {
    if timezone.is_none() && !skip_immediate {
        return None;
    }
    Some(RepeatOptions {
        timezone,
        skip_immediate,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_with_options() {
        let cli = Cli::try_parse_from([
            "pulse-worker",
            "--db",
            "/tmp/p.db",
            "every",
            "5 minutes",
            "a",
            "b",
            "--data",
            r#"{"to":"ops"}"#,
            "--skip-immediate",
        ])
        .unwrap();

        assert_eq!(cli.db.as_deref(), Some("/tmp/p.db"));
        match cli.command {
            Command::Every {
                interval,
                names,
                data,
                timezone,
                skip_immediate,
            } => {
                assert_eq!(interval, "5 minutes");
                assert_eq!(job_names(names), JobNames::Many(vec!["a".into(), "b".into()]));
                assert_eq!(data, Some(json!({ "to": "ops" })));
                assert!(timezone.is_none());
                assert!(skip_immediate);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_json_and_missing_names() {
        assert!(Cli::try_parse_from(["pulse-worker", "every", "1h", "a", "--data", "{"]).is_err());
        assert!(Cli::try_parse_from(["pulse-worker", "every", "1h"]).is_err());
    }

    #[test]
    fn run_accepts_negative_limit_and_job_list() {
        let cli =
            Cli::try_parse_from(["pulse-worker", "run", "--lock-limit", "-1", "--jobs", "a,b"])
                .unwrap();
        match cli.command {
            Command::Run { lock_limit, jobs } => {
                assert_eq!(lock_limit, Some(-1));
                assert_eq!(jobs, vec!["a", "b"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn single_name_is_not_a_batch() {
        assert_eq!(job_names(vec!["a".into()]), JobNames::One("a".into()));
        assert!(repeat_options(None, false).is_none());
        assert_eq!(
            repeat_options(Some("Europe/Paris".into()), false).unwrap().timezone.as_deref(),
            Some("Europe/Paris")
        );
    }
}
