// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use classpilot::{
    config::AssignmentConfig,
    forge::memory::MemoryForge,
    orchestrator::{Orchestrator, RunOptions, RunReport, RunStatus, Step, StepStatus},
    secrets::SourceResolver,
};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{env::current_dir, path::Path, sync::Arc};
use tokio::{runtime::Runtime, sync::watch};

const TEMPLATE_URL: &str = "https://forge.invalid/cs101/hw1-template.git";
const CLASSROOM_URL: &str = "https://forge.invalid/cs101/hw1-classroom.git";
const ALICE_URL: &str = "https://forge.invalid/cs101/hw1-alice.git";

struct Course {
    template: RepoFixture,
    classroom: RepoFixture,
    alice: RepoFixture,
    forge: Arc<MemoryForge>,
    config: Arc<AssignmentConfig>,
}

impl Course {
    fn new(root: &Path) -> Result<Self> {
        let template = RepoFixture::new(root.join("forge/hw1-template.git"))?;
        template.stage_and_commit("README.md", "Homework 1, revised\n")?;
        template.stage_and_commit("solution.py", "def solve():\n    raise NotImplementedError\n")?;
        template.stage_and_commit(
            "tests/test_solution.py",
            "def test_solve():\n    assert solve() == 42\n",
        )?;

        let classroom = RepoFixture::new(root.join("forge/hw1-classroom.git"))?;

        let alice = RepoFixture::new(root.join("forge/hw1-alice.git"))?;
        alice.stage_and_commit("README.md", "Homework 1\n")?;
        alice.stage_and_commit("solution.py", "def solve():\n    return 42\n")?;

        let forge = MemoryForge::new()
            .with_repository("cs101", "hw1-template")
            .with_repository("cs101", "hw1-alice")
            .with_clone_source(TEMPLATE_URL, template.path())
            .with_clone_source(CLASSROOM_URL, classroom.path())
            .with_clone_source(ALICE_URL, alice.path());

        let config: AssignmentConfig = indoc! {r#"
            organization = "cs101"
            assignment_prefix = "hw1"
            template_repo_url = "https://forge.invalid/cs101/hw1-template.git"
            classroom_repo_url = "https://forge.invalid/cs101/hw1-classroom.git"
            step_manage_secrets_enabled = false
            step_cycle_collaborators_enabled = false
            preserve_files = ["solution.py"]
        "#}
        .parse()?;

        Ok(Self {
            template,
            classroom,
            alice,
            forge: Arc::new(forge),
            config: Arc::new(config),
        })
    }

    fn run(&self, root: &Path, options: &RunOptions) -> Result<RunReport> {
        let orchestrator = Orchestrator::new(
            self.config.clone(),
            self.forge.clone(),
            Arc::new(SourceResolver::default()),
            root.join("work"),
        );
        let (_cancel, cancelled) = watch::channel(false);

        Ok(Runtime::new()?.block_on(orchestrator.run(options, cancelled)))
    }
}

fn assist_detail(report: &RunReport) -> String {
    report
        .step(Step::AssistStudents)
        .and_then(|step| step.repositories.first())
        .map(|line| line.detail.clone())
        .unwrap_or_default()
}

#[sealed_test]
fn sync_and_offer_template_updates() -> Result<()> {
    let root = current_dir()?;
    let course = Course::new(&root)?;
    let student_head = course.alice.branch_head("main");

    let report = course.run(&root, &RunOptions::default())?;
    assert_eq!(report.status, RunStatus::Succeeded, "{report}");
    assert_eq!(
        report.step(Step::SyncTemplate).map(|step| step.status),
        Some(StepStatus::Succeeded)
    );
    assert!(assist_detail(&report).starts_with("offered update"));

    // Classroom copy now mirrors the template.
    assert_eq!(
        course.classroom.branch_head("main"),
        course.template.branch_head("main")
    );

    // Student work stays untouched on their own branch.
    assert_eq!(course.alice.branch_head("main"), student_head);
    assert_eq!(course.alice.read_file("main", "README.md")?, "Homework 1\n");

    let offer = course
        .alice
        .branch_head("template-updates")
        .ok_or_else(|| anyhow::anyhow!("no update branch"))?;
    let parents = course.alice.parents_of(offer)?;
    assert_eq!(
        parents,
        vec![
            student_head.ok_or_else(|| anyhow::anyhow!("no student head"))?,
            course
                .template
                .branch_head("main")
                .ok_or_else(|| anyhow::anyhow!("no template head"))?,
        ]
    );
    assert_eq!(
        course.alice.read_file("template-updates", "README.md")?,
        "Homework 1, revised\n"
    );
    assert_eq!(
        course.alice.read_file("template-updates", "solution.py")?,
        "def solve():\n    return 42\n"
    );
    assert!(course
        .alice
        .read_file("template-updates", "tests/test_solution.py")
        .is_ok());

    // Nothing new to offer on the next run.
    let report = course.run(&root, &RunOptions::default())?;
    assert_eq!(report.status, RunStatus::Succeeded, "{report}");
    assert_eq!(assist_detail(&report), "up to date");
    assert_eq!(course.alice.branch_head("template-updates"), Some(offer));

    Ok(())
}

#[sealed_test]
fn dry_run_offers_nothing() -> Result<()> {
    let root = current_dir()?;
    let course = Course::new(&root)?;
    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };

    let report = course.run(&root, &options)?;
    assert_eq!(report.status, RunStatus::Succeeded, "{report}");
    assert!(assist_detail(&report).starts_with("would offer update"));
    assert!(course.forge.mutating_calls().is_empty());
    assert_eq!(course.classroom.branch_head("main"), None);
    assert_eq!(course.alice.branch_head("template-updates"), None);

    Ok(())
}

#[sealed_test]
fn unreachable_template_fails_step() -> Result<()> {
    let root = current_dir()?;
    let course = Course::new(&root)?;
    let forge = MemoryForge::new()
        .with_repository("cs101", "hw1-alice")
        .with_clone_source(ALICE_URL, course.alice.path());
    let orchestrator = Orchestrator::new(
        course.config.clone(),
        Arc::new(forge),
        Arc::new(SourceResolver::default()),
        root.join("work"),
    );
    let (_cancel, cancelled) = watch::channel(false);

    let report = Runtime::new()?.block_on(orchestrator.run(&RunOptions::default(), cancelled));
    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        report.step(Step::SyncTemplate).map(|step| step.status),
        Some(StepStatus::Failed)
    );
    assert_eq!(
        report.step(Step::AssistStudents).map(|step| step.status),
        Some(StepStatus::Skipped)
    );

    Ok(())
}
