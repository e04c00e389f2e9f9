// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use classpilot::{
    orchestrator::{RunReport, Step, StepReport},
    schedule::{orchestrate_command, MemoryCrontab, RunLog, Scheduler},
};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::path::Path;
use tracing::Level;

#[sealed_test]
fn schedule_unattended_runs() -> Result<()> {
    let command = orchestrate_command(
        Path::new("/opt/class pilot/classpilot"),
        Some(Path::new("/home/prof/hw1.toml")),
    );
    let crontab = MemoryCrontab::new(indoc! {"
        SHELL=/bin/sh
        0 * * * * /usr/bin/true
    "});
    let scheduler = Scheduler::new(crontab, RunLog::new("logs/runs.log"), command);

    scheduler.install(&"0 3 * * *".parse()?, &[Step::CycleCollaborators, Step::ManageSecrets])?;
    scheduler.install(&"*/30 8-18 * * mon-fri".parse()?, &[Step::AssistStudents])?;

    let jobs = scheduler.status()?;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].signature, "manage-secrets+cycle-collaborators");
    assert_eq!(jobs[0].schedule, "0 3 * * *");
    assert_eq!(
        jobs[0].command,
        "'/opt/class pilot/classpilot' orchestrate --unattended -c '/home/prof/hw1.toml' \
         --steps manage-secrets,cycle-collaborators"
    );
    assert_eq!(jobs[1].signature, "assist-students");

    // Unattended runs leave their summary behind for `schedule logs`.
    let mut report = RunReport::new(false);
    report.push(StepReport::succeeded(Step::Discover, "2 repositories (2 students), 1 excluded"));
    report.finish(false);
    scheduler.log().append(Level::INFO, &report.summary())?;

    let lines = scheduler.tail_logs(2)?;
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains(" INFO run succeeded"));
    assert!(lines[1].contains("discover"));

    assert_eq!(scheduler.remove(None)?, 2);
    assert!(scheduler.status()?.is_empty());

    Ok(())
}
