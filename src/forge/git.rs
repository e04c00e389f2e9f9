// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Clone and push through libgit2.
//!
//! Credentials are resolved through [`auth_git2`], which consults git
//! credential helpers and the ssh agent. Interactive runs fall back to
//! prompting the user, suspending the clone progress bar while the prompt is
//! on screen. Unattended runs never prompt.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{build::RepoBuilder, Config, FetchOptions, PushOptions, RemoteCallbacks, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    cell::RefCell,
    path::Path,
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument};

/// Blocking git transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitTransport {
    interactive: bool,
}

impl GitTransport {
    /// Construct new git transport.
    ///
    /// Interactive transports draw progress bars and may prompt for
    /// credentials.
    pub fn new(interactive: bool) -> Self {
        Self { interactive }
    }

    /// Clone repository at target URL into target path.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::Git2`] if libgit2 operations fail.
    /// - Return [`GitError::IndicatifStyleTemplate`] if progress bar cannot
    ///   be styled.
    #[instrument(skip(self, path), level = "debug")]
    pub fn clone_repository(&self, url: &str, path: &Path) -> Result<Repository> {
        let bar = if self.interactive {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(url.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = self.authenticator(prompter);
        let config = Config::open_default()?;

        let progress_bar = bar.clone();
        let mut throttle = Instant::now();
        let mut rc = RemoteCallbacks::new();
        rc.credentials(authenticator.credentials(&config));
        rc.transfer_progress(move |progress| {
            if throttle.elapsed() > Duration::from_millis(10) {
                throttle = Instant::now();
                progress_bar.set_length(progress.total_objects() as u64);
                progress_bar.set_position(progress.received_objects() as u64);
            }
            true
        });

        let mut fo = FetchOptions::new();
        fo.remote_callbacks(rc);
        let repository = RepoBuilder::new().fetch_options(fo).clone(url, path);
        bar.finish_and_clear();
        let repository = repository?;

        debug!("cloned {url} into {:?}", path.display());
        Ok(repository)
    }

    /// Push local branch to the branch of the same name on remote URL.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::Git2`] if libgit2 operations fail.
    /// - Return [`GitError::Rejected`] if the remote refuses the update.
    #[instrument(skip(self, local), level = "debug")]
    pub fn push(&self, local: &Path, remote_url: &str, branch: &str) -> Result<()> {
        let repository = Repository::open(local)?;
        let mut remote = repository.remote_anonymous(remote_url)?;
        let prompter = IndicatifPrompter::new(ProgressBar::hidden());
        let authenticator = self.authenticator(prompter);
        let config = repository.config()?;

        // INVARIANT: Rejections are only reported through the callback, not the push result.
        let rejection = RefCell::new(None);
        let mut rc = RemoteCallbacks::new();
        rc.credentials(authenticator.credentials(&config));
        rc.push_update_reference(|refname, status| {
            if let Some(reason) = status {
                *rejection.borrow_mut() = Some((refname.to_string(), reason.to_string()));
            }
            Ok(())
        });

        let mut po = PushOptions::new();
        po.remote_callbacks(rc);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], Some(&mut po))?;
        drop(po);

        if let Some((refname, reason)) = rejection.into_inner() {
            return Err(GitError::Rejected { refname, reason });
        }

        info!("pushed {branch} to {remote_url}");
        Ok(())
    }

    fn authenticator(&self, prompter: IndicatifPrompter) -> GitAuthenticator {
        let authenticator = GitAuthenticator::default();
        if self.interactive {
            authenticator.set_prompter(prompter)
        } else {
            authenticator
                .try_password_prompt(0)
                .prompt_ssh_key_password(false)
        }
    }
}

/// Held while a credential prompt owns the terminal.
static PROMPT_LOCK: Mutex<()> = Mutex::new(());

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }

    /// Run prompt with the progress bar hidden, one prompt at a time across
    /// every concurrent clone and push.
    fn exclusive<T>(&self, prompt: impl FnOnce() -> Option<T>) -> Option<T> {
        let _guard = PROMPT_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.bar.suspend(prompt)
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.exclusive(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.exclusive(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.exclusive(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Git transport error types.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Remote refused to update a reference.
    #[error("remote rejected {refname}: {reason}")]
    Rejected { refname: String, reason: String },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
type Result<T, E = GitError> = std::result::Result<T, E>;
