// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scheduler bridge.
//!
//! Turn the orchestrator into a periodic unattended job by managing entries
//! in the OS scheduler. Every entry classpilot writes carries a marker
//! comment naming the set of steps it runs:
//!
//! ```text
//! 0 3 * * * '/usr/bin/classpilot' orchestrate --unattended --steps manage-secrets # classpilot:manage-secrets
//! ```
//!
//! The marker is what lets the bridge tell its own entries apart from
//! everything else in the crontab, which it never touches. There is at most
//! one entry per step set, so installing the same step set twice replaces
//! the existing entry in place.
//!
//! # See Also
//!
//! 1. [`cron`]
//! 2. [`crontab`]
//! 3. [`log`]

pub mod cron;
pub mod crontab;
pub mod log;

pub use cron::{CronError, CronSchedule};
pub use crontab::{CrontabBackend, CrontabError, MemoryCrontab, UserCrontab};
pub use log::{RunLog, RunLogError};

use crate::orchestrator::Step;

use serde::Serialize;
use std::{collections::BTreeSet, path::Path};
use tracing::{info, instrument, Level};

/// Marker that tags entries managed by classpilot.
pub const MARKER: &str = "# classpilot:";

/// Scheduled job entry as found in the crontab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    pub schedule: String,
    pub command: String,
    pub signature: String,
}

/// Signature of a step set.
///
/// Steps are sorted in execution order, so the same set always yields the
/// same signature regardless of how it was spelled.
pub fn signature(steps: &[Step]) -> String {
    let steps = if steps.is_empty() {
        Step::ALL.iter().copied().collect::<BTreeSet<_>>()
    } else {
        steps.iter().copied().collect::<BTreeSet<_>>()
    };

    steps
        .into_iter()
        .map(|step| step.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

/// Quote argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Base command line for unattended runs.
pub fn orchestrate_command(program: &Path, config: Option<&Path>) -> String {
    let mut command = format!(
        "{} orchestrate --unattended",
        shell_quote(&program.to_string_lossy())
    );
    if let Some(config) = config {
        command.push_str(&format!(" -c {}", shell_quote(&config.to_string_lossy())));
    }

    command
}

/// Manage scheduled orchestrator runs.
pub struct Scheduler {
    backend: Box<dyn CrontabBackend>,
    log: RunLog,
    command: String,
}

impl Scheduler {
    /// Construct new scheduler.
    ///
    /// Installed entries run `command` with the step filter appended.
    pub fn new(
        backend: impl CrontabBackend + 'static,
        log: RunLog,
        command: impl Into<String>,
    ) -> Self {
        Self {
            backend: Box::new(backend),
            log,
            command: command.into(),
        }
    }

    /// Run log shared with unattended runs.
    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Install or update entry for step set.
    ///
    /// An empty step set means every step.
    ///
    /// # Errors
    ///
    /// - Return [`SchedulerError::DuplicateEntries`] if the crontab already
    ///   holds more than one entry for the step set.
    /// - Return [`SchedulerError::Backend`] if the crontab cannot be read or
    ///   written.
    #[instrument(skip(self, schedule), fields(schedule = %schedule))]
    pub fn install(&self, schedule: &CronSchedule, steps: &[Step]) -> Result<ScheduledJob> {
        let signature = signature(steps);
        let contents = self.backend.read()?;
        let mut lines = contents.lines().map(String::from).collect::<Vec<_>>();

        let matching = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| marker_of(line) == Some(signature.as_str()))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        if matching.len() > 1 {
            return Err(SchedulerError::DuplicateEntries {
                signature,
                count: matching.len(),
            });
        }

        let mut command = self.command.clone();
        if !steps.is_empty() {
            command.push_str(&format!(" --steps {}", signature.replace('+', ",")));
        }
        let job = ScheduledJob {
            schedule: schedule.to_string(),
            command,
            signature,
        };
        let entry = format!(
            "{} {} {}{}",
            job.schedule, job.command, MARKER, job.signature
        );

        match matching.first() {
            Some(index) => {
                info!("update scheduled job {}", job.signature);
                lines[*index] = entry;
            }
            None => {
                info!("install scheduled job {}", job.signature);
                lines.push(entry);
            }
        }

        self.backend.write(&join_lines(&lines))?;
        self.log.append(
            Level::INFO,
            &format!("scheduled {} at {}", job.signature, job.schedule),
        )?;

        Ok(job)
    }

    /// Remove entries for a step set, or every classpilot entry.
    ///
    /// Returns number of entries removed.
    ///
    /// # Errors
    ///
    /// - Return [`SchedulerError::Backend`] if the crontab cannot be read or
    ///   written.
    #[instrument(skip(self))]
    pub fn remove(&self, steps: Option<&[Step]>) -> Result<usize> {
        let target = steps.map(signature);
        let contents = self.backend.read()?;

        let mut removed = 0;
        let kept = contents
            .lines()
            .filter(|line| {
                let doomed = match (marker_of(line), target.as_deref()) {
                    (Some(found), Some(target)) => found == target,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if doomed {
                    removed += 1;
                }
                !doomed
            })
            .map(String::from)
            .collect::<Vec<_>>();

        if removed > 0 {
            self.backend.write(&join_lines(&kept))?;
            self.log
                .append(Level::INFO, &format!("removed {removed} scheduled jobs"))?;
        }
        info!("removed {removed} scheduled jobs");

        Ok(removed)
    }

    /// List installed entries.
    ///
    /// # Errors
    ///
    /// - Return [`SchedulerError::Backend`] if the crontab cannot be read.
    pub fn status(&self) -> Result<Vec<ScheduledJob>> {
        let contents = self.backend.read()?;
        Ok(contents.lines().filter_map(parse_entry).collect())
    }

    /// Last lines of the run log.
    ///
    /// # Errors
    ///
    /// - Return [`SchedulerError::Log`] if the run log cannot be read.
    pub fn tail_logs(&self, count: usize) -> Result<Vec<String>> {
        Ok(self.log.tail(count)?)
    }
}

fn marker_of(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }

    line.rsplit_once(MARKER)
        .map(|(_, signature)| signature.trim())
}

fn parse_entry(line: &str) -> Option<ScheduledJob> {
    let signature = marker_of(line)?;
    let (entry, _) = line.rsplit_once(MARKER)?;

    let mut rest = entry.trim();
    let mut fields = Vec::new();
    for _ in 0..5 {
        let (field, tail) = rest.split_once(char::is_whitespace)?;
        fields.push(field);
        rest = tail.trim_start();
    }

    Some(ScheduledJob {
        schedule: fields.join(" "),
        command: rest.trim_end().to_string(),
        signature: signature.to_string(),
    })
}

fn join_lines(lines: &[String]) -> String {
    let mut contents = lines.join("\n");
    if !contents.is_empty() {
        // INVARIANT: Cron ignores a final line without a newline.
        contents.push('\n');
    }

    contents
}

/// Scheduler bridge error types.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Cron expression is invalid.
    #[error(transparent)]
    InvalidCron(#[from] CronError),

    /// More than one entry carries the same signature.
    #[error("found {count} scheduled jobs for {signature}, remove them before installing again")]
    DuplicateEntries { signature: String, count: usize },

    /// Crontab cannot be accessed.
    #[error(transparent)]
    Backend(#[from] CrontabError),

    /// Run log cannot be accessed.
    #[error(transparent)]
    Log(#[from] RunLogError),
}

/// Friendly result alias :3
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
