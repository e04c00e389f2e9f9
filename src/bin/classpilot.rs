// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use classpilot::{
    config::AssignmentConfig,
    forge::gh::GhForge,
    orchestrator::{Orchestrator, RunOptions, RunStatus, Step},
    path::{default_config_path, default_run_log, default_workdir, NoWayHome},
    schedule::{orchestrate_command, CronSchedule, RunLog, Scheduler, UserCrontab},
    secrets::SourceResolver,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    fmt::Display,
    io::IsTerminal,
    path::{Path, PathBuf},
    process::exit,
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status for aborted runs and partial failures.
const EXIT_FAILURE: i32 = 1;

/// Exit status for configuration and preflight errors.
const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  classpilot [options] orchestrate [options]\n  classpilot [options] schedule <command> [options]",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Log debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<i32> {
        match self.command {
            Command::Orchestrate(opts) => run_orchestrate(opts).await,
            Command::Schedule(opts) => run_schedule(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run workflow steps over an assignment.
    #[command(override_usage = "classpilot orchestrate [options]")]
    Orchestrate(OrchestrateOptions),

    /// Manage scheduled unattended runs.
    #[command(override_usage = "classpilot schedule <command> [options]")]
    Schedule(ScheduleOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct OrchestrateOptions {
    /// Path to assignment configuration.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Only run these steps.
    #[arg(long, value_delimiter = ',', value_name = "step")]
    pub steps: Option<Vec<Step>>,

    /// Report what would change without changing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Redeploy every secret and cycle every collaborator.
    #[arg(long)]
    pub force: bool,

    /// Keep going after template sync or discovery fail.
    #[arg(long)]
    pub continue_on_error: bool,

    /// Never prompt, and append the run summary to the run log.
    #[arg(long)]
    pub unattended: bool,

    /// Print run report as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Clone, Debug)]
struct ScheduleOptions {
    /// Path to assignment configuration.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ScheduleCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ScheduleCommand {
    /// Install or update scheduled run for a step set.
    Install(InstallOptions),

    /// Remove scheduled runs.
    Remove(RemoveOptions),

    /// List scheduled runs.
    Status,

    /// Show last lines of the run log.
    Logs(LogsOptions),
}

#[derive(Parser, Clone, Debug)]
struct InstallOptions {
    /// Five field cron expression.
    #[arg(long, value_name = "expr")]
    pub cron: String,

    /// Steps to run, every enabled step if omitted.
    #[arg(long, value_delimiter = ',', value_name = "step")]
    pub steps: Vec<Step>,
}

#[derive(Parser, Clone, Debug)]
struct RemoveOptions {
    /// Remove scheduled run of this step set.
    #[arg(long, group = "target", value_delimiter = ',', value_name = "step")]
    pub steps: Vec<Step>,

    /// Remove every scheduled run.
    #[arg(long, group = "target")]
    pub all: bool,
}

#[derive(Parser, Clone, Debug)]
struct LogsOptions {
    /// Number of lines to show.
    #[arg(short = 'n', long, default_value_t = 20, value_name = "count")]
    pub lines: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match cli.run().await {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(EXIT_FAILURE);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<(PathBuf, AssignmentConfig)> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };
    let config = AssignmentConfig::load(&path)?;

    Ok((path, config))
}

fn run_log_of(config: Option<&AssignmentConfig>) -> Result<RunLog, NoWayHome> {
    let path = match config.and_then(|config| config.run_log.clone()) {
        Some(path) => path,
        None => default_run_log()?,
    };

    Ok(RunLog::new(path))
}

fn workdir_of(config: &AssignmentConfig) -> Result<PathBuf, NoWayHome> {
    match &config.workdir {
        Some(path) => Ok(path.clone()),
        None => default_workdir(),
    }
}

/// Log problem with the configuration, and exit with the matching status.
fn or_config_exit<T, E: Display>(result: Result<T, E>) -> Result<T, i32> {
    result.map_err(|err| {
        error!("{err:#}");
        EXIT_CONFIG
    })
}

async fn run_orchestrate(opts: OrchestrateOptions) -> Result<i32> {
    let config = match or_config_exit(load_config(opts.config.as_deref())) {
        Ok((_, config)) => config,
        Err(code) => return Ok(code),
    };

    let interactive = !opts.unattended && std::io::stderr().is_terminal();
    let located = workdir_of(&config).and_then(|workdir| Ok((workdir, run_log_of(Some(&config))?)));
    let (workdir, run_log) = match or_config_exit(located) {
        Ok(located) => located,
        Err(code) => return Ok(code),
    };
    let resolver = SourceResolver::new(config.token_store.clone());
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        Arc::new(GhForge::new(interactive)),
        Arc::new(resolver),
        workdir,
    );

    if let Err(err) = orchestrator.preflight().await {
        error!("{err}");
        if opts.unattended {
            run_log.append(Level::ERROR, &format!("preflight failed: {err}"))?;
        }
        return Ok(EXIT_CONFIG);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current step");
            let _ = cancel_tx.send(true);
        }
    });

    let options = RunOptions {
        steps: opts.steps,
        dry_run: opts.dry_run,
        force: opts.force,
        continue_on_error: opts.continue_on_error,
        interactive,
    };
    let report = orchestrator.run(&options, cancel_rx).await;

    if opts.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{report}");
    }

    if opts.unattended {
        let level = match report.status {
            RunStatus::Succeeded => Level::INFO,
            RunStatus::PartialFailure => Level::WARN,
            RunStatus::Aborted => Level::ERROR,
        };
        run_log.append(level, &report.summary())?;
    }

    Ok(report.exit_code())
}

fn run_schedule(opts: ScheduleOptions) -> Result<i32> {
    let config = match opts.config.as_deref() {
        Some(path) => match or_config_exit(load_config(Some(path))) {
            Ok((path, config)) => Some((std::path::absolute(path)?, config)),
            Err(code) => return Ok(code),
        },
        None => None,
    };

    let program = std::env::current_exe().context("cannot locate classpilot binary")?;
    let command = orchestrate_command(&program, config.as_ref().map(|(path, _)| path.as_path()));
    let run_log = match or_config_exit(run_log_of(config.as_ref().map(|(_, config)| config))) {
        Ok(run_log) => run_log,
        Err(code) => return Ok(code),
    };
    let scheduler = Scheduler::new(UserCrontab::new(), run_log, command);

    match opts.command {
        ScheduleCommand::Install(opts) => {
            let schedule = match opts.cron.parse::<CronSchedule>() {
                Ok(schedule) => schedule,
                Err(err) => {
                    error!("{err}");
                    return Ok(EXIT_CONFIG);
                }
            };
            let job = scheduler.install(&schedule, &opts.steps)?;
            info!("scheduled {} at {:?}", job.signature, job.schedule);
        }
        ScheduleCommand::Remove(opts) => {
            let removed = if opts.all {
                scheduler.remove(None)?
            } else if opts.steps.is_empty() {
                error!("pass --steps or --all to choose what to remove");
                return Ok(EXIT_CONFIG);
            } else {
                scheduler.remove(Some(&opts.steps))?
            };
            info!("removed {removed} scheduled runs");
        }
        ScheduleCommand::Status => {
            let jobs = scheduler.status()?;
            if jobs.is_empty() {
                info!("no scheduled runs");
            }
            for job in jobs {
                println!("{:<16} {}", job.schedule, job.signature);
            }
        }
        ScheduleCommand::Logs(opts) => {
            let lines = scheduler.tail_logs(opts.lines)?;
            if lines.is_empty() {
                info!("no runs logged at {}", scheduler.log().path().display());
            }
            for line in lines {
                println!("{line}");
            }
        }
    }

    Ok(0)
}
