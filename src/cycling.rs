// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Collaborator access cycling.
//!
//! Forges propagate collaborator changes asynchronously, and now and then a
//! student ends up stuck with stale access to their own repository. Simply
//! adding them again rarely helps. What does help is to remove the student,
//! wait until the removal is visible, add them back, and wait until the
//! addition is visible. This module runs that sequence as a small state
//! machine:
//!
//! ```text
//! Checking -> Done(AlreadyCorrect)
//!          -> NeedsRepair -> Removing -> VerifyingRemoved -> Readding
//!                         -> VerifyingAdded -> Done(Repaired | RepairFailed)
//! ```
//!
//! Verification polls the forge a bounded number of times with exponential
//! backoff between polls.

use crate::{
    batch::RepositoryError,
    catalog::RepositoryHandle,
    config::VerifySettings,
    forge::{ForgeClient, ForgeError, Permission},
};

use async_trait::async_trait;
use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Observed access of a user on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessCheckResult {
    pub has_access: bool,
    pub permission_level: Permission,
}

impl AccessCheckResult {
    /// Access of a user that is not a collaborator at all.
    pub fn no_access() -> Self {
        Self {
            has_access: false,
            permission_level: Permission::None,
        }
    }

    /// Access implied by a permission level.
    pub fn from_permission(level: Permission) -> Self {
        Self {
            has_access: level > Permission::None,
            permission_level: level,
        }
    }

    /// Check if observed access meets required level.
    pub fn satisfies(&self, required: Permission) -> bool {
        self.has_access && self.permission_level >= required
    }
}

impl Display for AccessCheckResult {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if self.has_access {
            write!(fmt, "{} access", self.permission_level)
        } else {
            fmt.write_str("no access")
        }
    }
}

/// Terminal result of cycling one collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CyclingOutcome {
    /// Access was already correct, nothing was touched.
    AlreadyCorrect,

    /// Access was broken and is now correct.
    Repaired,

    /// Access is still broken after the repair sequence.
    RepairFailed(AccessCheckResult),

    /// We are not allowed to administer the repository.
    SkippedNoAccess,

    /// Dry run found access that would be repaired.
    RepairPlanned,

    /// Student is not on the collaborator allowlist.
    NotAllowlisted,
}

impl Display for CyclingOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::AlreadyCorrect => fmt.write_str("already correct"),
            Self::Repaired => fmt.write_str("repaired"),
            Self::RepairFailed(last) => write!(fmt, "repair failed ({last})"),
            Self::SkippedNoAccess => fmt.write_str("skipped, no admin access"),
            Self::RepairPlanned => fmt.write_str("repair planned (dry-run)"),
            Self::NotAllowlisted => fmt.write_str("skipped, not on allowlist"),
        }
    }
}

/// Longest wait between two verification queries.
pub const MAX_VERIFY_DELAY: Duration = Duration::from_secs(300);

/// Verification polling policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Number of queries made before giving up.
    pub attempts: u32,

    /// Wait after the first query.
    pub delay: Duration,

    /// Factor applied to the wait after every further query.
    pub backoff: f64,
}

impl RetryPolicy {
    /// Wait between query `attempt` and the next one, counting from zero.
    ///
    /// Never exceeds [`MAX_VERIFY_DELAY`], however steep the backoff.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.delay.as_secs_f64() * self.backoff.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_VERIFY_DELAY, |delay| delay.min(MAX_VERIFY_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(2000),
            backoff: 2.0,
        }
    }
}

impl From<VerifySettings> for RetryPolicy {
    fn from(settings: VerifySettings) -> Self {
        Self {
            attempts: settings.attempts,
            delay: settings.delay,
            backoff: settings.backoff,
        }
    }
}

/// Wait between verification queries.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleep on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleState {
    Checking,
    NeedsRepair(AccessCheckResult),
    Removing,
    VerifyingRemoved(AccessCheckResult),
    Readding,
    VerifyingAdded,
    Done(CyclingOutcome),
}

/// Cycle collaborator access of students.
pub struct CollaboratorCycler<S: Sleeper = TokioSleeper> {
    forge: Arc<dyn ForgeClient>,
    retry: RetryPolicy,
    sleeper: S,
}

impl CollaboratorCycler<TokioSleeper> {
    /// Construct new collaborator cycler that sleeps on the tokio timer.
    pub fn new(forge: Arc<dyn ForgeClient>, retry: RetryPolicy) -> Self {
        Self::with_sleeper(forge, retry, TokioSleeper)
    }
}

impl<S: Sleeper> CollaboratorCycler<S> {
    /// Construct new collaborator cycler with custom sleeper.
    pub fn with_sleeper(forge: Arc<dyn ForgeClient>, retry: RetryPolicy, sleeper: S) -> Self {
        Self {
            forge,
            retry,
            sleeper,
        }
    }

    /// Sleeper in use.
    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Make sure user holds at least the required permission on repository.
    ///
    /// Forcing skips the initial short-circuit and always runs the repair
    /// sequence. Dry runs still check access, but report a planned repair
    /// instead of performing it.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::AccessCheck`] if the initial check fails
    ///   for any reason other than missing administrative rights.
    /// - Return [`RepositoryError::CollaboratorUpdate`] if the forge refuses
    ///   to remove or add the collaborator.
    #[instrument(skip(self, handle), fields(repo = %handle.full_name), level = "debug")]
    pub async fn cycle(
        &self,
        handle: &RepositoryHandle,
        username: &str,
        required: Permission,
        force: bool,
        dry_run: bool,
    ) -> Result<CyclingOutcome> {
        let repo = handle.full_name.as_str();
        let mut state = CycleState::Checking;

        loop {
            debug!("{repo}: {username} is {state:?}");
            state = match state {
                CycleState::Checking => match self.check(repo, username).await {
                    Ok(access) if access.satisfies(required) && !force => {
                        CycleState::Done(CyclingOutcome::AlreadyCorrect)
                    }
                    Ok(access) => CycleState::NeedsRepair(access),
                    Err(ForgeError::PermissionDenied(reason)) => {
                        warn!("{repo}: cannot administer repository: {reason}");
                        CycleState::Done(CyclingOutcome::SkippedNoAccess)
                    }
                    Err(err) => {
                        return Err(RepositoryError::AccessCheck {
                            user: username.into(),
                            source: err,
                        })
                    }
                },
                CycleState::NeedsRepair(access) if dry_run => {
                    info!("{repo}: would cycle {username}, currently {access}");
                    CycleState::Done(CyclingOutcome::RepairPlanned)
                }
                CycleState::NeedsRepair(access) => {
                    info!("{repo}: cycle {username}, currently {access}");
                    CycleState::Removing
                }
                CycleState::Removing => {
                    match self.forge.remove_collaborator(repo, username).await {
                        Ok(()) | Err(ForgeError::NotFound(_)) => {}
                        Err(err) => return Err(self.update_failure(username, err)),
                    }
                    CycleState::VerifyingRemoved(AccessCheckResult::no_access())
                }
                CycleState::VerifyingRemoved(initial) => {
                    let (confirmed, last) = self
                        .verify(repo, username, initial, |access| !access.has_access)
                        .await;
                    if !confirmed {
                        warn!("{repo}: removal of {username} not visible yet ({last}), re-adding anyway");
                    }
                    CycleState::Readding
                }
                CycleState::Readding => {
                    self.forge
                        .add_collaborator(repo, username, required)
                        .await
                        .map_err(|err| self.update_failure(username, err))?;
                    CycleState::VerifyingAdded
                }
                CycleState::VerifyingAdded => {
                    let (confirmed, last) = self
                        .verify(repo, username, AccessCheckResult::no_access(), |access| {
                            access.satisfies(required)
                        })
                        .await;
                    if confirmed {
                        info!("{repo}: repaired access of {username}");
                        CycleState::Done(CyclingOutcome::Repaired)
                    } else {
                        warn!("{repo}: access of {username} still broken ({last})");
                        CycleState::Done(CyclingOutcome::RepairFailed(last))
                    }
                }
                CycleState::Done(outcome) => return Ok(outcome),
            };
        }
    }

    async fn check(&self, repo: &str, username: &str) -> Result<AccessCheckResult, ForgeError> {
        match self.forge.get_collaborator_permission(repo, username).await {
            Ok(level) => Ok(AccessCheckResult::from_permission(level)),
            Err(ForgeError::NotFound(_)) => Ok(AccessCheckResult::no_access()),
            Err(err) => Err(err),
        }
    }

    /// Poll access until it matches, making exactly the configured number
    /// of queries at most. Failed queries count as unconfirmed.
    async fn verify<P>(
        &self,
        repo: &str,
        username: &str,
        mut last: AccessCheckResult,
        confirmed: P,
    ) -> (bool, AccessCheckResult)
    where
        P: Fn(&AccessCheckResult) -> bool,
    {
        let attempts = self.retry.attempts.max(1);
        for attempt in 0..attempts {
            match self.check(repo, username).await {
                Ok(access) if confirmed(&access) => return (true, access),
                Ok(access) => last = access,
                Err(err) => warn!("{repo}: verification query failed: {err}"),
            }

            if attempt + 1 < attempts {
                self.sleeper.sleep(self.retry.delay_after(attempt)).await;
            }
        }

        (false, last)
    }

    fn update_failure(&self, username: &str, err: ForgeError) -> RepositoryError {
        RepositoryError::CollaboratorUpdate {
            user: username.into(),
            source: err,
        }
    }
}

/// Friendly result alias :3
type Result<T, E = RepositoryError> = std::result::Result<T, E>;
