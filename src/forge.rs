// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Forge client capability interface.
//!
//! A __forge__ is the hosting service that owns the organization, its
//! repositories, their collaborators, and their secrets. Classpilot never
//! talks to the forge directly. Every network operation goes through the
//! [`ForgeClient`] trait so that the engine can be driven by the `gh` CLI in
//! production, and by an in-memory forge in tests.
//!
//! Each call may fail with [`ForgeError`]. The engine does not retry failed
//! calls itself, except where collaborator access verification explicitly
//! polls the forge.
//!
//! # See Also
//!
//! 1. [`gh`]
//! 2. [`memory`]

pub mod gh;
pub mod git;
pub mod memory;

use crate::secrets::SecretValue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
    str::FromStr,
};

/// Repository entry as listed by the forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    /// Short name, e.g., "hw1-alice".
    pub name: String,

    /// Owner qualified name, e.g., "cs101/hw1-alice".
    pub full_name: String,

    /// URL to clone repository from.
    pub clone_url: String,
}

/// Where a secret lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SecretTarget {
    /// Owner qualified repository name.
    Repository(String),

    /// Organization name.
    Organization(String),
}

impl Display for SecretTarget {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Repository(name) => write!(fmt, "repository {name}"),
            Self::Organization(name) => write!(fmt, "organization {name}"),
        }
    }
}

/// Secret metadata reported by the forge.
///
/// The forge never reveals secret values, only when they were last written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMetadata {
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

/// Effective permission of a collaborator on a repository.
///
/// Ordered from weakest to strongest so that access checks can compare
/// against a required level.
#[derive(
    Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    None,
    Read,
    Write,
    Admin,
}

impl Permission {
    /// Name of permission level as the forge's collaborator API expects it.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Read => "pull",
            Self::Write => "push",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Permission {
    type Err = ForgeError;

    /// Parse both our names and the forge's role names.
    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "read" | "pull" | "triage" => Ok(Self::Read),
            "write" | "push" | "maintain" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(ForgeError::Transport(format!(
                "unrecognized permission level {other:?}"
            ))),
        }
    }
}

impl Display for Permission {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        };
        fmt.write_str(name)
    }
}

/// Capability calls consumed by the automation engine.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// List repositories of organization whose name starts with a prefix.
    async fn list_repositories(&self, org: &str, name_prefix: &str) -> Result<Vec<RepoInfo>>;

    /// Fetch metadata of a secret, or `None` if it does not exist.
    async fn get_secret_metadata(
        &self,
        target: &SecretTarget,
        name: &str,
    ) -> Result<Option<SecretMetadata>>;

    /// Create secret, or overwrite its value if it already exists.
    async fn create_or_update_secret(
        &self,
        target: &SecretTarget,
        name: &str,
        value: &SecretValue,
    ) -> Result<()>;

    /// Effective permission of user on repository.
    ///
    /// Users without any access report [`Permission::None`].
    async fn get_collaborator_permission(&self, repo: &str, user: &str) -> Result<Permission>;

    /// Grant user access to repository at given level.
    async fn add_collaborator(&self, repo: &str, user: &str, level: Permission) -> Result<()>;

    /// Revoke all access of user to repository.
    async fn remove_collaborator(&self, repo: &str, user: &str) -> Result<()>;

    /// Clone repository into an empty destination directory.
    async fn clone_repository(&self, url: &str, dest: &Path) -> Result<()>;

    /// Push local branch to the branch of the same name on a remote.
    async fn push(&self, local: &Path, remote_url: &str, branch: &str) -> Result<()>;

    /// Scopes granted to the token in use, if the token type reports them.
    async fn token_scopes(&self) -> Result<Option<Vec<String>>>;
}

/// Forge call error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForgeError {
    /// Forge throttled the caller.
    #[error("rate limited by forge: {0}")]
    RateLimited(String),

    /// Target resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks permission for the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Anything else between us and the forge went wrong.
    #[error("forge transport failure: {0}")]
    Transport(String),
}

/// Friendly result alias :3
pub type Result<T, E = ForgeError> = std::result::Result<T, E>;
