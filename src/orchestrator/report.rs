// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run reports.
//!
//! A [`RunReport`] is the only artifact a run leaves behind. It lists every
//! step in order, and for batch steps every repository the step touched,
//! successful or not.

use crate::{batch::BatchResult, orchestrator::Step};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{Display, Formatter, Result as FmtResult, Write};

/// Final status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl Display for StepStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        fmt.write_str(name)
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Succeeded,
    PartialFailure,
    Aborted,
}

impl Display for RunStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial failure",
            Self::Aborted => "aborted",
        };
        fmt.write_str(name)
    }
}

/// Outcome of one repository within a batch step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryLine {
    pub repository: String,
    pub ok: bool,
    pub detail: String,
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: Step,
    pub status: StepStatus,

    /// Reason for skips and failures, or a short summary of the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Step ran only because a later step depends on it.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub implied: bool,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositoryLine>,
}

impl StepReport {
    /// Step that did not run.
    pub fn skipped(step: Step, reason: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Skipped, Some(reason.into()))
    }

    /// Step that completed.
    pub fn succeeded(step: Step, detail: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Succeeded, Some(detail.into()))
    }

    /// Step that raised an error of its own.
    pub fn failed(step: Step, reason: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Failed, Some(reason.into()))
    }

    /// Batch step that completed, whatever its repositories reported.
    pub fn from_batch<T: Display>(step: Step, batch: &BatchResult<T>) -> Self {
        let repositories = batch
            .outcomes
            .iter()
            .map(|outcome| RepositoryLine {
                repository: outcome.handle.full_name.clone(),
                ok: outcome.is_success(),
                detail: match &outcome.result {
                    Ok(value) => value.to_string(),
                    Err(err) => err.to_string(),
                },
            })
            .collect();

        let mut report = Self::succeeded(
            step,
            format!(
                "{} repositories, {} failed",
                batch.len(),
                batch.failures().count()
            ),
        );
        report.repositories = repositories;
        report
    }

    /// Mark step as implied by a later step.
    pub fn implied(mut self, implied: bool) -> Self {
        self.implied = implied;
        self
    }

    /// Number of repositories that failed.
    pub fn failed_repositories(&self) -> usize {
        self.repositories.iter().filter(|line| !line.ok).count()
    }

    fn new(step: Step, status: StepStatus, detail: Option<String>) -> Self {
        Self {
            step,
            status,
            detail,
            implied: false,
            repositories: Vec::new(),
        }
    }
}

/// Aggregate result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    /// Construct new empty report for a run starting now.
    pub fn new(dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            status: RunStatus::Succeeded,
            steps: Vec::new(),
        }
    }

    /// Append step result.
    pub fn push(&mut self, step: StepReport) {
        self.steps.push(step);
    }

    /// Seal report and compute overall status.
    pub fn finish(&mut self, aborted: bool) {
        self.finished_at = Some(Utc::now());
        let failed = self.steps.iter().any(|step| {
            step.status == StepStatus::Failed || step.failed_repositories() > 0
        });

        self.status = if aborted {
            RunStatus::Aborted
        } else if failed {
            RunStatus::PartialFailure
        } else {
            RunStatus::Succeeded
        };
    }

    /// Result of target step, if it was recorded.
    pub fn step(&self, step: Step) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.step == step)
    }

    /// Process exit status matching run status.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::PartialFailure | RunStatus::Aborted => 1,
        }
    }

    /// Render report as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// One line summary for logs.
    pub fn headline(&self) -> String {
        let failed = self
            .steps
            .iter()
            .map(StepReport::failed_repositories)
            .sum::<usize>();
        let mut line = format!("run {}", self.status);
        if self.dry_run {
            line.push_str(" (dry-run)");
        }

        let steps = self
            .steps
            .iter()
            .filter(|step| step.status != StepStatus::Skipped)
            .map(|step| format!("{}={}", step.step, step.status))
            .collect::<Vec<_>>();
        if !steps.is_empty() {
            let _ = write!(line, ": {}", steps.join(" "));
        }
        if failed > 0 {
            let _ = write!(line, ", {failed} repository failures");
        }

        line
    }

    /// Human readable summary listing every step and repository.
    pub fn summary(&self) -> String {
        let mut out = self.headline();
        out.push('\n');

        for step in &self.steps {
            let _ = write!(out, "  {:<20} {:<10}", step.step.to_string(), step.status);
            if let Some(detail) = &step.detail {
                let _ = write!(out, " {detail}");
            }
            if step.implied {
                out.push_str(" (implied)");
            }
            out.push('\n');

            for line in &step.repositories {
                let mark = if line.ok { "ok" } else { "FAILED" };
                let _ = writeln!(out, "    {mark:<6} {}: {}", line.repository, line.detail);
            }
        }

        out
    }
}

impl Display for RunReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.summary())
    }
}
