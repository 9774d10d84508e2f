use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use quake_scheduler::api::{self, ApiState};
use quake_scheduler::cli::{Cli, Command, RunArgs, StatusArgs, StopArgs, task_spec};
use quake_scheduler::config::ScheduleConfig;
use quake_scheduler::daemon::{
    DaemonHandle, DaemonManager, InstanceState, StopOutcome, query_status, stop_running,
};
use quake_scheduler::logging::{LoggingOptions, init_logging};
use quake_scheduler::scheduler::Scheduler;
use quake_scheduler::task::{CommandRunner, TaskSpec};
use quake_scheduler::{Error, Result, panic_hook};

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let verbosity = cli.verbosity();
    let config = ScheduleConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => run(config, &args, verbosity),
        Command::Status(args) => status(config, &args, verbosity),
        Command::Stop(args) => stop(config, &args, verbosity),
    }
}

fn run(mut config: ScheduleConfig, args: &RunArgs, verbosity: i8) -> Result<()> {
    args.apply(&mut config);
    config.validate()?;
    let spec = task_spec(&config)?;

    // Forking is only sound while single-threaded: claim the process before
    // the logging worker or the runtime start any threads.
    let handle = DaemonManager::new(config.daemon.clone()).prepare()?;

    let _guard = init_logging(&LoggingOptions {
        verbosity,
        log_file: config.daemon.log_file.clone(),
        detached: handle.is_detached(),
    })?;
    panic_hook::install(config.daemon.log_file.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_scheduler(config, spec, handle))
}

async fn run_scheduler(config: ScheduleConfig, spec: TaskSpec, handle: DaemonHandle) -> Result<()> {
    let mut runner = CommandRunner::new();
    if let Some(dir) = &config.task.working_dir {
        runner = runner.with_working_dir(dir);
    }

    let scheduler = Arc::new(
        Scheduler::builder(config.clone(), Arc::new(runner))
            .cancellation_token(handle.cancellation_token())
            .build()?,
    );

    let listener = match config.http_addr {
        Some(addr) => Some(api::bind(addr).await?),
        None => None,
    };
    let api = listener.map(|listener| {
        tokio::spawn(api::serve(
            listener,
            ApiState::new(scheduler.clone()),
            handle.cancellation_token(),
        ))
    });

    let result = handle.supervise(scheduler, spec).await;

    if let Some(api) = api {
        match api.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("HTTP observer failed: {}", e),
            Err(e) => warn!("HTTP observer task failed: {}", e),
        }
    }
    result
}

fn status(config: ScheduleConfig, args: &StatusArgs, verbosity: i8) -> Result<()> {
    let _guard = init_logging(&LoggingOptions {
        verbosity,
        ..Default::default()
    })?;
    let pid_file = args
        .pid_file
        .clone()
        .or(config.daemon.pid_file)
        .ok_or_else(|| Error::config("status needs --pid-file or [daemon] pid_file"))?;
    let status_file = args.status_file.clone().or(config.status_file);

    let report = query_status(&pid_file, status_file.as_deref())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match report.instance {
        InstanceState::Running { pid } => println!("running (pid {pid})"),
        InstanceState::Stale { pid } => println!("not running (stale pid file names {pid})"),
        InstanceState::NotRunning => println!("not running"),
    }
    if let Some(status) = report.status {
        println!("  state:       {}", status.state);
        println!("  task:        {}", status.task.as_deref().unwrap_or("-"));
        println!(
            "  executions:  {} ({} ok, {} failed, {} skipped)",
            status.executions, status.successes, status.failures, status.skipped_ticks
        );
        println!("  success:     {:.1}%", status.success_rate * 100.0);
        if let Some(at) = status.last_execution_at {
            println!("  last run:    {at}");
        }
        if let Some(at) = status.next_execution_at {
            println!("  next run:    {at}");
        }
        if let Some(err) = status.last_error {
            println!("  last error:  {err}");
        }
    }
    Ok(())
}

fn stop(config: ScheduleConfig, args: &StopArgs, verbosity: i8) -> Result<()> {
    let _guard = init_logging(&LoggingOptions {
        verbosity,
        ..Default::default()
    })?;
    let pid_file = args
        .pid_file
        .clone()
        .or(config.daemon.pid_file)
        .ok_or_else(|| Error::config("stop needs --pid-file or [daemon] pid_file"))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    match runtime.block_on(stop_running(&pid_file, args.timeout))? {
        StopOutcome::NotRunning => println!("not running"),
        StopOutcome::StaleRemoved { pid } => println!("removed stale pid file (pid {pid})"),
        StopOutcome::Stopped { pid } => {
            info!(pid, "Instance stopped");
            println!("stopped (pid {pid})");
        }
    }
    Ok(())
}
