use clap::{Args, Parser};
use job_sync::{PollSettings, SyncConfig};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CliError;
use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "synth-watch",
    about = "Follow prompt-learning jobs and their event streams from the terminal",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "SYNTH_BACKEND_URL",
        default_value = "https://api.usesynth.ai",
        help = "Base URL of the Synth backend"
    )]
    pub backend_url: String,

    #[arg(
        long,
        env = "SYNTH_API_KEY",
        hide_env_values = true,
        help = "API key sent as a bearer token"
    )]
    pub api_key: Option<String>,

    #[arg(
        long,
        env = "SYNTH_API_PREFIX",
        help = "Path prefix of the jobs API (default /api/prompt-learning/online)"
    )]
    pub api_prefix: Option<String>,

    #[arg(
        long,
        env = "SYNTH_TUI_JOB_ID",
        value_name = "JOB_ID",
        help = "Job to select on startup"
    )]
    pub job_id: Option<String>,

    #[arg(
        long,
        env = "SYNTH_TUI_REFRESH_INTERVAL",
        value_name = "SECONDS",
        default_value_t = 5.0,
        help = "Job list poll interval"
    )]
    pub refresh_interval: f64,

    #[arg(
        long,
        env = "SYNTH_TUI_EVENT_INTERVAL",
        value_name = "SECONDS",
        default_value_t = 2.0,
        help = "Event page poll interval"
    )]
    pub event_interval: f64,

    #[arg(
        long,
        env = "SYNTH_TUI_LIMIT",
        default_value_t = 50,
        help = "Maximum number of jobs to list"
    )]
    pub limit: usize,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SYNTH_WATCH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SYNTH_WATCH_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn sync_config(&self) -> Result<SyncConfig, CliError> {
        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(CliError::MissingApiKey)?;
        if self.limit == 0 {
            return Err(CliError::InvalidArgument(
                "--limit must be at least 1".into(),
            ));
        }

        let mut config =
            SyncConfig::new(&self.backend_url, api_key)?.with_initial_job(self.job_id.clone());
        if let Some(prefix) = self.api_prefix.as_deref().map(str::trim) {
            if !prefix.is_empty() {
                config.api_prefix = prefix.to_string();
            }
        }
        config.job_poll = poll_settings(
            "--refresh-interval",
            self.refresh_interval,
            PollSettings::jobs(),
        )?;
        config.event_poll = poll_settings(
            "--event-interval",
            self.event_interval,
            PollSettings::events(),
        )?;
        config.job_list_limit = self.limit;
        Ok(config)
    }
}

const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

// The ceiling keeps its default unless the base interval already exceeds it.
fn poll_settings(flag: &str, seconds: f64, defaults: PollSettings) -> Result<PollSettings, CliError> {
    let invalid = || {
        CliError::InvalidArgument(format!(
            "{flag} must be between 0 and {} seconds, got {seconds}",
            MAX_INTERVAL.as_secs()
        ))
    };
    let base = Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
    if base.is_zero() || base > MAX_INTERVAL {
        return Err(invalid());
    }
    Ok(PollSettings {
        base,
        max: defaults.max.max(base),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["synth-watch"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("arguments parse")
    }

    #[test]
    fn builds_config_from_flags() {
        let cli = parse(&[
            "--backend-url",
            "http://localhost:8000",
            "--api-key",
            "sk-local",
            "--job-id",
            "pl_123",
            "--refresh-interval",
            "2.5",
            "--event-interval",
            "30",
            "--limit",
            "10",
            "--api-prefix",
            "/api/eval",
        ]);
        let config = cli.sync_config().expect("config");
        assert_eq!(config.backend_url.as_str(), "http://localhost:8000/");
        assert_eq!(config.api_key, "sk-local");
        assert_eq!(config.initial_job_id.as_deref(), Some("pl_123"));
        assert_eq!(config.job_poll.base, Duration::from_millis(2500));
        assert_eq!(config.job_poll.max, Duration::from_secs(60));
        assert_eq!(config.event_poll.base, Duration::from_secs(30));
        assert_eq!(config.event_poll.max, Duration::from_secs(30));
        assert_eq!(config.job_list_limit, 10);
        assert_eq!(config.api_prefix, "/api/eval");
    }

    #[test]
    fn rejects_non_positive_intervals() {
        let cli = parse(&["--api-key", "sk", "--event-interval", "0"]);
        assert!(matches!(
            cli.sync_config(),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_intervals() {
        for value in ["1e20", "3601", "0.0", "NaN", "inf"] {
            let cli = parse(&["--api-key", "sk", "--refresh-interval", value]);
            assert!(
                matches!(cli.sync_config(), Err(CliError::InvalidArgument(_))),
                "accepted {value}"
            );
        }
        let cli = parse(&["--api-key", "sk", "--refresh-interval", "3600"]);
        let config = cli.sync_config().expect("an hour is allowed");
        assert_eq!(config.job_poll.base, MAX_INTERVAL);
    }

    #[test]
    fn blank_api_key_is_missing() {
        let cli = parse(&["--api-key", "  "]);
        assert!(matches!(cli.sync_config(), Err(CliError::MissingApiKey)));
    }

    #[test]
    fn log_level_parses_from_flag() {
        let cli = parse(&["--api-key", "sk", "--log-level", "debug"]);
        assert_eq!(cli.logging.to_config().level, LogLevel::Debug);
    }
}
