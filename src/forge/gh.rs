// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Forge client backed by the GitHub CLI.
//!
//! Every API call is a `gh` subprocess. Letting `gh` own authentication means
//! classpilot never handles the operator's token itself: `gh auth login`, or
//! the `GH_TOKEN` environment variable for unattended runs, is all that needs
//! to be configured. Secret values are written through stdin so they never
//! show up in a process listing.
//!
//! Clones and pushes go through libgit2 instead, see [`GitTransport`].

use crate::{
    forge::{
        git::GitTransport, ForgeClient, ForgeError, Permission, RepoInfo, Result, SecretMetadata,
        SecretTarget,
    },
    secrets::SecretValue,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command, task::spawn_blocking};
use tracing::{debug, instrument};

/// Forge client that drives the `gh` binary.
#[derive(Debug, Clone)]
pub struct GhForge {
    program: OsString,
    git: GitTransport,
}

impl GhForge {
    /// Construct new forge client using `gh` from `$PATH`.
    pub fn new(interactive: bool) -> Self {
        Self::with_program("gh", interactive)
    }

    /// Construct new forge client using a specific `gh` binary.
    pub fn with_program(program: impl Into<OsString>, interactive: bool) -> Self {
        Self {
            program: program.into(),
            git: GitTransport::new(interactive),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        syscall(&self.program, args, None).await
    }

    async fn gh_json<T>(&self, args: &[&str]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let output = self.gh(args).await?;
        serde_json::from_str(&output).map_err(|err| {
            ForgeError::Transport(format!("unexpected output from gh {}: {err}", args[0]))
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhRepo {
    name: String,
    name_with_owner: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct GhSecret {
    name: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhPermission {
    permission: String,
    #[serde(default)]
    role_name: Option<String>,
}

#[async_trait]
impl ForgeClient for GhForge {
    #[instrument(skip(self), level = "debug")]
    async fn list_repositories(&self, org: &str, name_prefix: &str) -> Result<Vec<RepoInfo>> {
        let repos: Vec<GhRepo> = self
            .gh_json(&[
                "repo",
                "list",
                org,
                "--no-archived",
                "--limit",
                "10000",
                "--json",
                "name,nameWithOwner,url",
            ])
            .await?;

        Ok(repos
            .into_iter()
            .filter(|repo| repo.name.starts_with(name_prefix))
            .map(|repo| RepoInfo {
                name: repo.name,
                full_name: repo.name_with_owner,
                clone_url: format!("{}.git", repo.url),
            })
            .collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_secret_metadata(
        &self,
        target: &SecretTarget,
        name: &str,
    ) -> Result<Option<SecretMetadata>> {
        let endpoint = match target {
            SecretTarget::Repository(repo) => format!("repos/{repo}/actions/secrets/{name}"),
            SecretTarget::Organization(org) => format!("orgs/{org}/actions/secrets/{name}"),
        };

        match self.gh_json::<GhSecret>(&["api", endpoint.as_str()]).await {
            Ok(secret) => Ok(Some(SecretMetadata {
                name: secret.name,
                updated_at: secret.updated_at,
            })),
            Err(ForgeError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn create_or_update_secret(
        &self,
        target: &SecretTarget,
        name: &str,
        value: &SecretValue,
    ) -> Result<()> {
        let args = match target {
            SecretTarget::Repository(repo) => vec!["secret", "set", name, "--repo", repo.as_str()],
            SecretTarget::Organization(org) => {
                vec!["secret", "set", name, "--org", org.as_str(), "--visibility", "all"]
            }
        };

        syscall(&self.program, &args, Some(value.expose().as_bytes())).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_collaborator_permission(&self, repo: &str, user: &str) -> Result<Permission> {
        let endpoint = format!("repos/{repo}/collaborators/{user}/permission");
        let answer: GhPermission = self.gh_json(&["api", endpoint.as_str()]).await?;

        // INVARIANT: Role name distinguishes triage and maintain, permission does not.
        answer.role_name.unwrap_or(answer.permission).parse()
    }

    #[instrument(skip(self), level = "debug")]
    async fn add_collaborator(&self, repo: &str, user: &str, level: Permission) -> Result<()> {
        let endpoint = format!("repos/{repo}/collaborators/{user}");
        let permission = format!("permission={}", level.as_api_str());
        self.gh(&["api", "--method", "PUT", endpoint.as_str(), "-f", permission.as_str(), "--silent"])
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove_collaborator(&self, repo: &str, user: &str) -> Result<()> {
        let endpoint = format!("repos/{repo}/collaborators/{user}");
        self.gh(&["api", "--method", "DELETE", endpoint.as_str(), "--silent"])
            .await?;
        Ok(())
    }

    async fn clone_repository(&self, url: &str, dest: &Path) -> Result<()> {
        let git = self.git;
        let url = url.to_string();
        let dest = dest.to_path_buf();
        spawn_blocking(move || git.clone_repository(&url, &dest).map(|_| ()))
            .await
            .map_err(|err| ForgeError::Transport(err.to_string()))?
            .map_err(|err| ForgeError::Transport(err.to_string()))
    }

    async fn push(&self, local: &Path, remote_url: &str, branch: &str) -> Result<()> {
        let git = self.git;
        let local: PathBuf = local.to_path_buf();
        let remote_url = remote_url.to_string();
        let branch = branch.to_string();
        spawn_blocking(move || git.push(&local, &remote_url, &branch))
            .await
            .map_err(|err| ForgeError::Transport(err.to_string()))?
            .map_err(|err| ForgeError::Transport(err.to_string()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn token_scopes(&self) -> Result<Option<Vec<String>>> {
        let output = self.gh(&["api", "--include", "user"]).await?;
        Ok(parse_scopes_header(&output))
    }
}

/// Extract the OAuth scope header from a `gh api --include` response.
fn parse_scopes_header(response: &str) -> Option<Vec<String>> {
    response
        .lines()
        .take_while(|line| !line.trim().is_empty())
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("x-oauth-scopes")
                .then(|| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|scope| !scope.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
        })
}

/// Map `gh` diagnostics onto forge error types.
fn classify(message: String) -> ForgeError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("rate limit") || lowered.contains("http 429") {
        ForgeError::RateLimited(message)
    } else if lowered.contains("http 404") || lowered.contains("could not resolve to a") {
        ForgeError::NotFound(message)
    } else if lowered.contains("http 403")
        || lowered.contains("http 401")
        || lowered.contains("must have admin rights")
        || lowered.contains("resource not accessible")
    {
        ForgeError::PermissionDenied(message)
    } else {
        ForgeError::Transport(message)
    }
}

async fn syscall(
    cmd: impl AsRef<OsStr>,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<String> {
    debug!("run {:?} {}", cmd.as_ref(), args.join(" "));
    let mut child = Command::new(cmd.as_ref())
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            ForgeError::Transport(format!("failed to run {:?}: {err}", cmd.as_ref()))
        })?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data)
            .await
            .map_err(|err| ForgeError::Transport(err.to_string()))?;
        // INVARIANT: Close stdin so the child sees end of input.
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| ForgeError::Transport(err.to_string()))?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        // INVARIANT: Chomp trailing newlines.
        let message = stderr.trim_end().to_string();
        return Err(classify(if message.is_empty() {
            format!("command {:?} failed with {}", cmd.as_ref(), output.status)
        } else {
            message
        }));
    }

    Ok(stdout)
}
