//! Command-line surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{ScheduleConfig, parse_duration};
use crate::resilience::BackoffStrategy;
use crate::task::TaskSpec;
use crate::{Error, Result};

/// Default wait for `stop` before giving up on the running instance.
const DEFAULT_STOP_TIMEOUT: &str = "30s";

#[derive(Debug, Parser)]
#[command(name = "quake-scheduler", version)]
#[command(about = "Run an earthquake/fault data collection task on a fixed interval")]
pub struct Cli {
    /// TOML config file.
    #[arg(long, short = 'c', global = true, env = "QUAKE_SCHEDULER_CONFIG")]
    pub config: Option<PathBuf>,

    /// More log output (repeatable).
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Less log output (repeatable).
    #[arg(long, short = 'q', global = true, action = ArgAction::Count)]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn verbosity(&self) -> i8 {
        let verbose = i8::try_from(self.verbose).unwrap_or(i8::MAX);
        let quiet = i8::try_from(self.quiet).unwrap_or(i8::MAX);
        verbose.saturating_sub(quiet)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler (foreground unless --daemon).
    Run(RunArgs),
    /// Show whether an instance is running and its last published status.
    Status(StatusArgs),
    /// Ask a running instance to shut down.
    Stop(StopArgs),
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Time between ticks, e.g. "30s", "5m".
    #[arg(long, short = 'i', value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// Stop after this much time.
    #[arg(long, value_parser = parse_duration)]
    pub max_runtime: Option<Duration>,

    /// Stop after this many executions.
    #[arg(long)]
    pub max_executions: Option<u64>,

    /// Backoff between retries: none, linear or exponential.
    #[arg(long)]
    pub backoff: Option<BackoffStrategy>,

    #[arg(long, value_parser = parse_duration)]
    pub base_backoff: Option<Duration>,

    #[arg(long, value_parser = parse_duration)]
    pub max_backoff: Option<Duration>,

    /// Attempts per tick, including the first.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Keep scheduling after a failed tick (`--continue-on-error=false` to stop).
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub continue_on_error: Option<bool>,

    /// Skip the tick after one that produced nothing.
    #[arg(long)]
    pub skip_empty: bool,

    #[arg(long, value_parser = parse_duration)]
    pub health_interval: Option<Duration>,

    /// Per-attempt timeout for the task.
    #[arg(long, value_parser = parse_duration)]
    pub task_timeout: Option<Duration>,

    /// Detach into the background.
    #[arg(long, short = 'd')]
    pub daemon: bool,

    #[arg(long, env = "QUAKE_SCHEDULER_PID_FILE")]
    pub pid_file: Option<PathBuf>,

    #[arg(long, env = "QUAKE_SCHEDULER_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long)]
    pub status_file: Option<PathBuf>,

    /// Serve health, status and metrics over HTTP on this address.
    #[arg(long, env = "QUAKE_SCHEDULER_HTTP_ADDR")]
    pub http_addr: Option<SocketAddr>,

    /// Working directory for the task.
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Task command and arguments, after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Layer the flags that were given over `config`.
    pub fn apply(&self, config: &mut ScheduleConfig) {
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if self.max_runtime.is_some() {
            config.max_runtime = self.max_runtime;
        }
        if self.max_executions.is_some() {
            config.max_executions = self.max_executions;
        }
        if let Some(backoff) = self.backoff {
            config.backoff = backoff;
        }
        if let Some(base) = self.base_backoff {
            config.base_backoff = base;
        }
        if let Some(max) = self.max_backoff {
            config.max_backoff = max;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }
        if let Some(continue_on_error) = self.continue_on_error {
            config.continue_on_error = continue_on_error;
        }
        if self.skip_empty {
            config.skip_empty = true;
        }
        if let Some(interval) = self.health_interval {
            config.health_check_interval = interval;
        }
        if self.task_timeout.is_some() {
            config.task_timeout = self.task_timeout;
        }
        if self.daemon {
            config.daemon.enabled = true;
        }
        if let Some(path) = &self.pid_file {
            config.daemon.pid_file = Some(path.clone());
        }
        if let Some(path) = &self.log_file {
            config.daemon.log_file = Some(path.clone());
        }
        if let Some(path) = &self.status_file {
            config.status_file = Some(path.clone());
        }
        if self.http_addr.is_some() {
            config.http_addr = self.http_addr;
        }
        if let Some(dir) = &self.working_dir {
            config.task.working_dir = Some(dir.clone());
        }
        if let Some((program, args)) = self.command.split_first() {
            config.task.program = Some(program.clone());
            config.task.args = args.to_vec();
        }
    }
}

/// The task to schedule, from the merged config.
pub fn task_spec(config: &ScheduleConfig) -> Result<TaskSpec> {
    let program = config
        .task
        .program
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            Error::config("no task command given (pass it after `--` or set [task] program)")
        })?;
    Ok(TaskSpec::new(program, config.task.args.iter()))
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long, env = "QUAKE_SCHEDULER_PID_FILE")]
    pub pid_file: Option<PathBuf>,

    #[arg(long)]
    pub status_file: Option<PathBuf>,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    #[arg(long, env = "QUAKE_SCHEDULER_PID_FILE")]
    pub pid_file: Option<PathBuf>,

    /// How long to wait for the instance to exit.
    #[arg(long, value_parser = parse_duration, default_value = DEFAULT_STOP_TIMEOUT)]
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("quake-scheduler").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_run_flags_override_config() {
        let cli = parse(&[
            "run",
            "--interval",
            "5m",
            "--max-executions",
            "10",
            "--backoff",
            "linear",
            "--max-backoff",
            "2m",
            "--continue-on-error=false",
            "--skip-empty",
            "--daemon",
            "--pid-file",
            "/tmp/quake.pid",
            "--",
            "./fetch-usgs.sh",
            "--min-magnitude",
            "4.5",
        ]);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };

        let mut config = ScheduleConfig::default();
        run.apply(&mut config);

        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.max_executions, Some(10));
        assert_eq!(config.backoff, BackoffStrategy::Linear);
        assert_eq!(config.max_backoff, Duration::from_secs(120));
        assert!(!config.continue_on_error);
        assert!(config.skip_empty);
        assert!(config.daemon.enabled);
        assert!(config.validate().is_ok());

        let spec = task_spec(&config).unwrap();
        assert_eq!(spec.name, "./fetch-usgs.sh");
        assert_eq!(spec.args, vec!["--min-magnitude", "4.5"]);
    }

    #[test]
    fn test_absent_flags_keep_config_values() {
        let cli = parse(&["run"]);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };
        let mut config = ScheduleConfig {
            skip_empty: true,
            continue_on_error: false,
            ..Default::default()
        };
        let before = config.clone();
        run.apply(&mut config);
        assert_eq!(config, before);
        assert_eq!(task_spec(&config).unwrap_err().exit_code(), 78);
    }

    #[test]
    fn test_verbosity_and_stop_defaults() {
        let cli = parse(&["-vv", "stop", "-q", "--pid-file", "/run/quake.pid"]);
        assert_eq!(cli.verbosity(), 1);
        let Command::Stop(stop) = cli.command else {
            panic!("expected stop");
        };
        assert_eq!(stop.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        assert!(Cli::try_parse_from(["quake-scheduler", "run", "--interval", "soon"]).is_err());
    }
}
