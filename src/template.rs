// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Template distribution.
//!
//! The template repository is the source of truth for an assignment. This
//! module keeps the classroom copy of the template in sync with it, and
//! offers template changes to students that started from an older template.
//!
//! # Offering Updates
//!
//! Students own their repositories, so template changes are never pushed onto
//! the branch they work on. Instead, a merge commit joining the student's
//! head and the template's head is pushed to a separate update branch, where
//! students can review and merge it on their own terms. The merge tree is the
//! student's tree with every template file laid over it, except for files
//! matching the preservation patterns, which always keep the student's
//! version.

use crate::{
    catalog::RepositoryHandle,
    config::AssignmentConfig,
    forge::{ForgeClient, ForgeError},
};

use git2::{
    BranchType, Commit, Index, IndexEntry, IndexTime, ObjectType, Oid, Repository, Signature,
    Tree, TreeWalkMode, TreeWalkResult,
};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::remove_dir_all,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};

/// Local clone of the template at a known head.
#[derive(Debug, Clone)]
pub struct TemplateClone {
    pub path: PathBuf,
    pub branch: String,
    pub head: Oid,
}

/// Result of syncing the classroom copy of the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum SyncOutcome {
    Pushed { commit: String },
    WouldPush { commit: String },
}

impl Display for SyncOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Pushed { commit } => write!(fmt, "pushed {commit}"),
            Self::WouldPush { commit } => write!(fmt, "would push {commit} (dry-run)"),
        }
    }
}

/// Result of offering template updates to one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum AssistOutcome {
    UpToDate,
    UpdatePushed { commit: String },
    WouldPush { commit: String },
}

impl Display for AssistOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::UpToDate => fmt.write_str("up to date"),
            Self::UpdatePushed { commit } => write!(fmt, "offered update {commit}"),
            Self::WouldPush { commit } => write!(fmt, "would offer update {commit} (dry-run)"),
        }
    }
}

/// Distribute template changes.
pub struct TemplateManager {
    forge: Arc<dyn ForgeClient>,
    workdir: PathBuf,
    template_url: String,
    template_branch: String,
    update_branch: String,
    preserve: Gitignore,
}

impl TemplateManager {
    /// Construct new template manager working under target directory.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::PreservePattern`] if a preservation pattern
    ///   is not valid gitignore syntax.
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        config: &AssignmentConfig,
        workdir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let workdir = workdir.into();
        let mut builder = GitignoreBuilder::new(&workdir);
        for pattern in &config.preserve_files {
            builder.add_line(None, pattern)?;
        }
        let preserve = builder.build()?;

        Ok(Self {
            forge,
            workdir,
            template_url: config.template_repo_url.clone(),
            template_branch: config.template_branch.clone(),
            update_branch: config.update_branch.clone(),
            preserve,
        })
    }

    /// Clone fresh copy of the template.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::Forge`] if the template cannot be cloned.
    /// - Return [`TemplateError::MissingBranch`] if the template lacks the
    ///   template branch.
    #[instrument(skip(self), level = "debug")]
    pub async fn prepare(&self) -> Result<TemplateClone> {
        let path = self.workdir.join("template");
        fresh_dir(&path)?;
        self.forge.clone_repository(&self.template_url, &path).await?;

        let branch = self.template_branch.clone();
        let repo_path = path.clone();
        let head = spawn_blocking(move || local_branch_head(&repo_path, &branch))
            .await
            .map_err(|err| TemplateError::Join(err.to_string()))??;
        debug!("template {} is at {head}", self.template_branch);

        Ok(TemplateClone {
            path,
            branch: self.template_branch.clone(),
            head,
        })
    }

    /// Push template branch to the classroom copy of the template.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::Forge`] if cloning or pushing fails.
    #[instrument(skip(self, template), level = "debug")]
    pub async fn sync_template(
        &self,
        template: &TemplateClone,
        classroom_url: &str,
        dry_run: bool,
    ) -> Result<SyncOutcome> {
        let commit = short_id(template.head);
        if dry_run {
            info!("would push template {commit} to {classroom_url}");
            return Ok(SyncOutcome::WouldPush { commit });
        }

        self.forge
            .push(&template.path, classroom_url, &template.branch)
            .await?;
        info!("pushed template {commit} to {classroom_url}");

        Ok(SyncOutcome::Pushed { commit })
    }

    /// Offer template changes to student.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::Forge`] if cloning or pushing fails.
    /// - Return [`TemplateError::Git2`] if the update cannot be built.
    #[instrument(skip(self, handle, template), fields(repo = %handle.full_name))]
    pub async fn assist_student(
        &self,
        handle: &RepositoryHandle,
        template: &TemplateClone,
        dry_run: bool,
    ) -> Result<AssistOutcome> {
        let path = self.workdir.join("students").join(&handle.name);
        fresh_dir(&path)?;
        self.forge.clone_repository(&handle.clone_url, &path).await?;

        let update = {
            let path = path.clone();
            let template = template.clone();
            let update_branch = self.update_branch.clone();
            let preserve = self.preserve.clone();
            spawn_blocking(move || {
                build_update(&path, &template, &update_branch, &preserve)
            })
            .await
            .map_err(|err| TemplateError::Join(err.to_string()))??
        };

        let outcome = match update {
            None => AssistOutcome::UpToDate,
            Some(oid) if dry_run => AssistOutcome::WouldPush {
                commit: short_id(oid),
            },
            Some(oid) => {
                self.forge
                    .push(&path, &handle.clone_url, &self.update_branch)
                    .await?;
                AssistOutcome::UpdatePushed {
                    commit: short_id(oid),
                }
            }
        };

        if let Err(err) = remove_dir_all(&path) {
            warn!("failed to clean up {:?}: {err}", path.display());
        }

        Ok(outcome)
    }
}

fn fresh_dir(path: &Path) -> Result<()> {
    if path.exists() {
        remove_dir_all(path).map_err(|err| TemplateError::Workdir {
            source: err,
            path: path.to_path_buf(),
        })?;
    }

    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent).map_err(|err| TemplateError::Workdir {
            source: err,
            path: parent.to_path_buf(),
        })?;
    }

    Ok(())
}

fn short_id(oid: Oid) -> String {
    let mut id = oid.to_string();
    id.truncate(8);
    id
}

/// Head of local branch, created from the remote tracking branch if needed.
fn local_branch_head(path: &Path, branch: &str) -> Result<Oid> {
    let repo = Repository::open(path)?;
    if let Ok(local) = repo.find_branch(branch, BranchType::Local) {
        return Ok(local.get().peel_to_commit()?.id());
    }

    let remote = repo
        .find_branch(&format!("origin/{branch}"), BranchType::Remote)
        .map_err(|_| TemplateError::MissingBranch {
            branch: branch.into(),
        })?;
    let commit = remote.get().peel_to_commit()?;
    repo.branch(branch, &commit, false)?;

    Ok(commit.id())
}

fn is_merged(repo: &Repository, head: Oid, candidate: Oid) -> Result<bool> {
    Ok(head == candidate || repo.graph_descendant_of(head, candidate)?)
}

/// Build merge commit offering template changes on the update branch.
///
/// Returns `None` if the student already has everything the template has to
/// offer.
fn build_update(
    student: &Path,
    template: &TemplateClone,
    update_branch: &str,
    preserve: &Gitignore,
) -> Result<Option<Oid>> {
    let repo = Repository::open(student)?;

    let tracking = format!("refs/remotes/template/{}", template.branch);
    let refspec = format!("+refs/heads/{}:{tracking}", template.branch);
    let mut remote = repo.remote_anonymous(&template.path.to_string_lossy())?;
    remote.fetch(&[refspec.as_str()], None, None)?;

    let template_head = repo.find_reference(&tracking)?.peel_to_commit()?;
    let student_head = repo.head()?.peel_to_commit()?;
    if is_merged(&repo, student_head.id(), template_head.id())? {
        return Ok(None);
    }

    // INVARIANT: An earlier offer that was never merged stays in the history of the new one.
    let previous = repo
        .find_reference(&format!("refs/remotes/origin/{update_branch}"))
        .ok()
        .and_then(|reference| reference.peel_to_commit().ok());
    let mut pending = None;
    if let Some(previous) = previous {
        if is_merged(&repo, previous.id(), template_head.id())? {
            debug!("template head already offered on {update_branch}");
            return Ok(None);
        }

        if !is_merged(&repo, student_head.id(), previous.id())? {
            pending = Some(previous);
        }
    }

    let mut index = Index::new()?;
    index.read_tree(&student_head.tree()?)?;
    overlay(&repo, &mut index, &template_head.tree()?, preserve)?;
    let tree_id = index.write_tree_to(&repo)?;
    if tree_id == student_head.tree_id() {
        return Ok(None);
    }
    let tree = repo.find_tree(tree_id)?;

    let signature = repo
        .signature()
        .or_else(|_| Signature::now("classpilot", "classpilot@localhost"))?;
    let mut parents: Vec<&Commit<'_>> = vec![&student_head];
    if let Some(pending) = pending.as_ref() {
        parents.push(pending);
    }
    parents.push(&template_head);

    let message = format!(
        "Merge template updates from {}\n\nTemplate head: {}",
        template.branch,
        template_head.id()
    );
    let oid = repo.commit(
        Some(&format!("refs/heads/{update_branch}")),
        &signature,
        &signature,
        &message,
        &tree,
        &parents,
    )?;

    Ok(Some(oid))
}

/// Lay every template blob over the index, skipping preserved paths.
fn overlay(repo: &Repository, index: &mut Index, tree: &Tree<'_>, preserve: &Gitignore) -> Result<()> {
    let mut blobs = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                blobs.push((format!("{root}{name}"), entry.id(), entry.filemode()));
            }
        }
        TreeWalkResult::Ok
    })?;

    for (path, id, mode) in blobs {
        if preserve
            .matched_path_or_any_parents(Path::new(&path), false)
            .is_ignore()
        {
            debug!("preserve student version of {path}");
            continue;
        }

        let blob = repo.find_blob(id)?;
        let entry = IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: mode as u32,
            uid: 0,
            gid: 0,
            file_size: blob.size() as u32,
            id,
            flags: 0,
            flags_extended: 0,
            path: path.into_bytes(),
        };
        index.add(&entry)?;
    }

    Ok(())
}

/// Template distribution error types.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// Work directory cannot be prepared.
    #[error("failed to prepare work directory {:?}", path.display())]
    Workdir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Template lacks the template branch.
    #[error("template has no branch {branch:?}")]
    MissingBranch { branch: String },

    /// Preservation pattern is invalid.
    #[error(transparent)]
    PreservePattern(#[from] ignore::Error),

    /// Blocking git task did not finish.
    #[error("git task failed: {0}")]
    Join(String),

    /// Forge refused a clone or push.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
type Result<T, E = TemplateError> = std::result::Result<T, E>;
