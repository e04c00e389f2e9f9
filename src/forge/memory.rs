// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! In-memory forge.
//!
//! Keeps repositories, secrets, and collaborators in plain maps. Every call
//! is recorded so tests can assert on exactly what the engine asked the forge
//! to do, e.g., that a dry run never issued a mutating call.
//!
//! Clones are served from local repositories registered through
//! [`MemoryForge::with_clone_source`], and pushes to a registered URL land in
//! that local repository. This keeps template tests honest without any
//! network access.

use crate::{
    forge::{ForgeClient, ForgeError, Permission, RepoInfo, Result, SecretMetadata, SecretTarget},
    secrets::SecretValue,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{build::RepoBuilder, Repository};
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::debug;

/// Forge operations that failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    ListRepositories,
    SecretMetadata,
    DeploySecret,
    CheckPermission,
    AddCollaborator,
    RemoveCollaborator,
    Clone,
    Push,
    TokenScopes,
}

/// One recorded forge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForgeCall {
    ListRepositories { org: String, prefix: String },
    GetSecretMetadata { target: SecretTarget, name: String },
    CreateOrUpdateSecret { target: SecretTarget, name: String },
    GetCollaboratorPermission { repo: String, user: String },
    AddCollaborator { repo: String, user: String, level: Permission },
    RemoveCollaborator { repo: String, user: String },
    Clone { url: String },
    Push { remote_url: String, branch: String },
    TokenScopes,
}

impl ForgeCall {
    /// Check if call changes state on the forge.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::CreateOrUpdateSecret { .. }
                | Self::AddCollaborator { .. }
                | Self::RemoveCollaborator { .. }
                | Self::Push { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct StoredSecret {
    value: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    organizations: BTreeSet<String>,
    repositories: Vec<(String, RepoInfo)>,
    secrets: HashMap<(SecretTarget, String), StoredSecret>,
    permissions: HashMap<(String, String), Permission>,
    scripted: HashMap<(String, String), VecDeque<Result<Permission>>>,
    lagging: HashSet<(String, String)>,
    failures: HashMap<(FailOn, String), ForgeError>,
    clone_sources: HashMap<String, PathBuf>,
    scopes: Option<Vec<String>>,
    calls: Vec<ForgeCall>,
}

impl State {
    fn check(&self, op: FailOn, key: &str) -> Result<()> {
        match self.failures.get(&(op, key.to_string())) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Forge client that lives entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryForge {
    state: Mutex<State>,
}

impl MemoryForge {
    /// Construct new empty forge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an organization without any repositories.
    pub fn with_organization(self, org: impl Into<String>) -> Self {
        self.state().organizations.insert(org.into());
        self
    }

    /// Register repository in organization.
    pub fn with_repository(self, org: impl Into<String>, name: impl Into<String>) -> Self {
        let org = org.into();
        let name = name.into();
        let info = RepoInfo {
            full_name: format!("{org}/{name}"),
            clone_url: format!("https://forge.invalid/{org}/{name}.git"),
            name,
        };

        let mut state = self.state();
        state.organizations.insert(org.clone());
        state.repositories.push((org, info));
        drop(state);
        self
    }

    /// Seed existing secret last written at target time.
    pub fn with_secret(
        self,
        target: SecretTarget,
        name: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        self.state().secrets.insert(
            (target, name.into()),
            StoredSecret {
                value: None,
                updated_at,
            },
        );
        self
    }

    /// Seed collaborator at permission level.
    pub fn with_collaborator(
        self,
        repo: impl Into<String>,
        user: impl Into<String>,
        level: Permission,
    ) -> Self {
        self.state()
            .permissions
            .insert((repo.into(), user.into()), level);
        self
    }

    /// Answer permission queries from a script before falling back to
    /// recorded state.
    pub fn script_permissions(
        self,
        repo: impl Into<String>,
        user: impl Into<String>,
        answers: impl IntoIterator<Item = Result<Permission>>,
    ) -> Self {
        self.state()
            .scripted
            .entry((repo.into(), user.into()))
            .or_default()
            .extend(answers);
        self
    }

    /// Accept collaborator additions without them ever taking effect.
    pub fn with_lagging_adds(self, repo: impl Into<String>, user: impl Into<String>) -> Self {
        self.state().lagging.insert((repo.into(), user.into()));
        self
    }

    /// Fail every call of an operation against a target.
    ///
    /// The target is the organization for listings, the repository or
    /// organization name for secrets, the owner qualified repository name for
    /// collaborators, and the URL for clones and pushes.
    pub fn fail(self, op: FailOn, target: impl Into<String>, err: ForgeError) -> Self {
        self.state().failures.insert((op, target.into()), err);
        self
    }

    /// Report target scopes for the token in use.
    pub fn with_scopes<I, S>(self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    /// Serve clones of URL from a local repository, and push to it.
    pub fn with_clone_source(self, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.state().clone_sources.insert(url.into(), path.into());
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ForgeCall> {
        self.state().calls.clone()
    }

    /// Every mutating call made so far, in order.
    pub fn mutating_calls(&self) -> Vec<ForgeCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.is_mutating())
            .cloned()
            .collect()
    }

    /// Value of secret written through this forge.
    pub fn secret_value(&self, target: &SecretTarget, name: &str) -> Option<String> {
        self.state()
            .secrets
            .get(&(target.clone(), name.to_string()))
            .and_then(|secret| secret.value.clone())
    }

    /// Recorded permission of collaborator.
    pub fn permission_of(&self, repo: &str, user: &str) -> Permission {
        self.state()
            .permissions
            .get(&(repo.to_string(), user.to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: ForgeCall) -> MutexGuard<'_, State> {
        let mut state = self.state();
        debug!("memory forge call {call:?}");
        state.calls.push(call);
        state
    }
}

fn target_key(target: &SecretTarget) -> &str {
    match target {
        SecretTarget::Repository(name) | SecretTarget::Organization(name) => name.as_str(),
    }
}

fn git_failure(err: git2::Error) -> ForgeError {
    ForgeError::Transport(err.message().to_string())
}

#[async_trait]
impl ForgeClient for MemoryForge {
    async fn list_repositories(&self, org: &str, name_prefix: &str) -> Result<Vec<RepoInfo>> {
        let state = self.record(ForgeCall::ListRepositories {
            org: org.into(),
            prefix: name_prefix.into(),
        });
        state.check(FailOn::ListRepositories, org)?;

        if !state.organizations.contains(org) {
            return Err(ForgeError::NotFound(format!("organization {org}")));
        }

        Ok(state
            .repositories
            .iter()
            .filter(|(owner, info)| owner == org && info.name.starts_with(name_prefix))
            .map(|(_, info)| info.clone())
            .collect())
    }

    async fn get_secret_metadata(
        &self,
        target: &SecretTarget,
        name: &str,
    ) -> Result<Option<SecretMetadata>> {
        let state = self.record(ForgeCall::GetSecretMetadata {
            target: target.clone(),
            name: name.into(),
        });
        state.check(FailOn::SecretMetadata, target_key(target))?;

        Ok(state
            .secrets
            .get(&(target.clone(), name.to_string()))
            .map(|secret| SecretMetadata {
                name: name.into(),
                updated_at: secret.updated_at,
            }))
    }

    async fn create_or_update_secret(
        &self,
        target: &SecretTarget,
        name: &str,
        value: &SecretValue,
    ) -> Result<()> {
        let mut state = self.record(ForgeCall::CreateOrUpdateSecret {
            target: target.clone(),
            name: name.into(),
        });
        state.check(FailOn::DeploySecret, target_key(target))?;

        state.secrets.insert(
            (target.clone(), name.to_string()),
            StoredSecret {
                value: Some(value.expose().to_string()),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_collaborator_permission(&self, repo: &str, user: &str) -> Result<Permission> {
        let mut state = self.record(ForgeCall::GetCollaboratorPermission {
            repo: repo.into(),
            user: user.into(),
        });
        state.check(FailOn::CheckPermission, repo)?;

        let key = (repo.to_string(), user.to_string());
        if let Some(answer) = state.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
            return answer;
        }

        Ok(state.permissions.get(&key).copied().unwrap_or_default())
    }

    async fn add_collaborator(&self, repo: &str, user: &str, level: Permission) -> Result<()> {
        let mut state = self.record(ForgeCall::AddCollaborator {
            repo: repo.into(),
            user: user.into(),
            level,
        });
        state.check(FailOn::AddCollaborator, repo)?;

        let key = (repo.to_string(), user.to_string());
        if !state.lagging.contains(&key) {
            state.permissions.insert(key, level);
        }
        Ok(())
    }

    async fn remove_collaborator(&self, repo: &str, user: &str) -> Result<()> {
        let mut state = self.record(ForgeCall::RemoveCollaborator {
            repo: repo.into(),
            user: user.into(),
        });
        state.check(FailOn::RemoveCollaborator, repo)?;

        state.permissions.remove(&(repo.to_string(), user.to_string()));
        Ok(())
    }

    async fn clone_repository(&self, url: &str, dest: &Path) -> Result<()> {
        let source = {
            let state = self.record(ForgeCall::Clone { url: url.into() });
            state.check(FailOn::Clone, url)?;
            state
                .clone_sources
                .get(url)
                .cloned()
                .ok_or_else(|| ForgeError::NotFound(format!("repository {url}")))?
        };

        let source = source.to_string_lossy().into_owned();
        RepoBuilder::new()
            .clone(&source, dest)
            .map_err(git_failure)?;
        Ok(())
    }

    async fn push(&self, local: &Path, remote_url: &str, branch: &str) -> Result<()> {
        let destination = {
            let state = self.record(ForgeCall::Push {
                remote_url: remote_url.into(),
                branch: branch.into(),
            });
            state.check(FailOn::Push, remote_url)?;
            state.clone_sources.get(remote_url).cloned()
        };

        // INVARIANT: Pushes to unregistered URLs are only recorded.
        if let Some(destination) = destination {
            let repository = Repository::open(local).map_err(git_failure)?;
            let mut remote = repository
                .remote_anonymous(&destination.to_string_lossy())
                .map_err(git_failure)?;
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            remote.push(&[refspec.as_str()], None).map_err(git_failure)?;
        }

        Ok(())
    }

    async fn token_scopes(&self) -> Result<Option<Vec<String>>> {
        let state = self.record(ForgeCall::TokenScopes);
        state.check(FailOn::TokenScopes, "")?;
        Ok(state.scopes.clone())
    }
}
