// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Batch execution over student repositories.
//!
//! A batch runs one unit of work per repository with bounded parallelism.
//! Every unit runs in its own task and is given a fixed amount of time to
//! finish. A unit that fails, panics, or runs out of time only ever affects
//! its own outcome, never the rest of the batch.
//!
//! Units that run out of time are abandoned rather than cancelled. Their
//! task keeps running in the background and whatever it eventually produces
//! is discarded.

use crate::{catalog::RepositoryHandle, cycling::AccessCheckResult, forge::ForgeError};

use futures::{stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    any::Any,
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    time::Duration,
};
use tokio::{task::JoinError, time::timeout};
use tracing::{debug, info, instrument, warn};

/// Default number of repositories worked on at once.
pub const DEFAULT_PARALLELISM: usize = 5;

/// Default time a single repository may take.
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounded parallel executor.
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    parallelism: usize,
    item_timeout: Duration,
    interactive: bool,
}

impl BatchExecutor {
    /// Construct new batch executor.
    ///
    /// A parallelism of zero is treated as one.
    pub fn new(parallelism: usize, item_timeout: Duration) -> Self {
        Self {
            parallelism: parallelism.max(1),
            item_timeout,
            interactive: false,
        }
    }

    /// Draw a progress bar while batches run.
    pub fn with_progress(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Run unit of work against every handle.
    ///
    /// Outcomes are returned in the same order as the handles, one outcome
    /// per handle, no matter in which order the units finish.
    #[instrument(skip(self, handles, work), fields(count = handles.len()))]
    pub async fn run_batch<T, F, Fut>(
        &self,
        label: &str,
        handles: &[RepositoryHandle],
        work: F,
    ) -> BatchResult<T>
    where
        F: Fn(RepositoryHandle) -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>> + Send + 'static,
        T: Send + 'static,
    {
        info!("run {label} over {} repositories", handles.len());
        let bar = self.progress_bar(label, handles.len());
        let item_timeout = self.item_timeout;

        let mut slots: Vec<Option<Outcome<T>>> = handles.iter().map(|_| None).collect();
        let mut pending = stream::iter(handles.iter().cloned().enumerate())
            .map(|(index, handle)| {
                let task = tokio::spawn(work(handle.clone()));
                async move {
                    let result = match timeout(item_timeout, task).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(err)) => Err(RepositoryError::Panicked(join_failure(err))),
                        Err(_) => Err(RepositoryError::Timeout(item_timeout)),
                    };
                    (index, Outcome { handle, result })
                }
            })
            .buffer_unordered(self.parallelism);

        while let Some((index, outcome)) = pending.next().await {
            match &outcome.result {
                Ok(_) => debug!("{}: done", outcome.handle.full_name),
                Err(err) => warn!("{}: {err}", outcome.handle.full_name),
            }
            bar.inc(1);
            slots[index] = Some(outcome);
        }
        bar.finish_and_clear();

        // INVARIANT: Every slot is filled exactly once by the stream above.
        let outcomes = slots.into_iter().flatten().collect::<Vec<_>>();
        let result = BatchResult { outcomes };
        info!(
            "{label}: {} succeeded, {} failed",
            result.successes().count(),
            result.failures().count()
        );

        result
    }

    fn progress_bar(&self, label: &str, len: usize) -> ProgressBar {
        if !self.interactive {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<24}  [{wide_bar:.yellow/blue}]  {pos}/{len}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(label.to_string());
        bar
    }
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLELISM, DEFAULT_ITEM_TIMEOUT)
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }

    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".into()
    }
}

/// Outcome of one unit of work.
#[derive(Debug)]
pub struct Outcome<T> {
    pub handle: RepositoryHandle,
    pub result: Result<T, RepositoryError>,
}

impl<T> Outcome<T> {
    /// Check if unit of work succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of a whole batch, in input order.
#[derive(Debug)]
pub struct BatchResult<T> {
    pub outcomes: Vec<Outcome<T>>,
}

impl<T> BatchResult<T> {
    /// Outcomes that succeeded.
    pub fn successes(&self) -> impl Iterator<Item = &Outcome<T>> {
        self.outcomes.iter().filter(|outcome| outcome.is_success())
    }

    /// Outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &Outcome<T>> {
        self.outcomes.iter().filter(|outcome| !outcome.is_success())
    }

    /// Check if every unit of work succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Per repository error types.
///
/// Recorded as the outcome of the failing repository. Never aborts a batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// Secret value cannot be resolved or is malformed.
    #[error("secret {secret} has no usable value: {reason}")]
    TokenInvalid { secret: String, reason: String },

    /// Some secrets of a repository failed to rotate.
    #[error("{detail}")]
    SecretRotation { detail: String },

    /// Secret state cannot be queried.
    #[error("failed to look up secret {secret}: {source}")]
    SecretLookup { secret: String, source: ForgeError },

    /// Forge refused to store a secret.
    #[error("failed to deploy secret {secret}: {source}")]
    Deploy { secret: String, source: ForgeError },

    /// Collaborator access cannot be queried.
    #[error("failed to check access of {user}: {source}")]
    AccessCheck { user: String, source: ForgeError },

    /// Collaborator cannot be removed or added.
    #[error("failed to update collaborator {user}: {source}")]
    CollaboratorUpdate { user: String, source: ForgeError },

    /// Access is still broken after the repair sequence.
    #[error("access of {user} still broken after repair, last observed {last}")]
    RepairFailed {
        user: String,
        last: AccessCheckResult,
    },

    /// Template update cannot be offered.
    #[error("failed to offer template update: {0}")]
    AssistFailed(String),

    /// Unit of work ran out of time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Unit of work panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl<T: Display> Display for Outcome<T> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match &self.result {
            Ok(value) => write!(fmt, "{}: {value}", self.handle.full_name),
            Err(err) => write!(fmt, "{}: error: {err}", self.handle.full_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Role;
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    fn handles(count: usize) -> Vec<RepositoryHandle> {
        (0..count)
            .map(|index| RepositoryHandle {
                organization: "cs101".into(),
                name: format!("hw1-student{index}"),
                full_name: format!("cs101/hw1-student{index}"),
                student: format!("student{index}"),
                clone_url: format!("https://example.org/cs101/hw1-student{index}.git"),
                role: Role::Student,
            })
            .collect()
    }

    #[tokio::test]
    async fn failures_never_abort_siblings() {
        let handles = handles(8);
        let failing: HashSet<String> = ["student1", "student4", "student5"]
            .into_iter()
            .map(String::from)
            .collect();
        let touched = Arc::new(Mutex::new(Vec::new()));

        let executor = BatchExecutor::new(3, Duration::from_secs(5));
        let result = executor
            .run_batch("isolation", &handles, |handle| {
                let failing = failing.contains(&handle.student);
                let touched = touched.clone();
                async move {
                    touched.lock().unwrap().push(handle.student.clone());
                    if failing {
                        Err(RepositoryError::AssistFailed("boom".into()))
                    } else {
                        Ok(handle.student)
                    }
                }
            })
            .await;

        assert_eq!(result.len(), 8);
        assert_eq!(result.failures().count(), 3);
        assert_eq!(touched.lock().unwrap().len(), 8);

        let order = result
            .outcomes
            .iter()
            .map(|outcome| outcome.handle.student.clone())
            .collect::<Vec<_>>();
        let expect = handles.iter().map(|h| h.student.clone()).collect::<Vec<_>>();
        assert_eq!(order, expect);

        for outcome in result.failures() {
            assert!(failing.contains(&outcome.handle.student));
        }
    }

    #[tokio::test]
    async fn slow_unit_times_out_without_blocking_batch() {
        let handles = handles(3);
        let executor = BatchExecutor::new(3, Duration::from_millis(100));
        let result = executor
            .run_batch("timeout", &handles, |handle| async move {
                if handle.student == "student1" {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(())
            })
            .await;

        assert_eq!(result.len(), 3);
        assert!(matches!(
            result.outcomes[1].result,
            Err(RepositoryError::Timeout(_))
        ));
        assert!(result.outcomes[0].is_success());
        assert!(result.outcomes[2].is_success());
    }

    #[tokio::test]
    async fn panic_becomes_outcome() {
        let handles = handles(2);
        let executor = BatchExecutor::default();
        let result = executor
            .run_batch("panic", &handles, |handle| async move {
                if handle.student == "student0" {
                    panic!("student0 exploded");
                }
                Ok(())
            })
            .await;

        match &result.outcomes[0].result {
            Err(RepositoryError::Panicked(message)) => assert!(message.contains("exploded")),
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert!(result.outcomes[1].is_success());
    }

    #[tokio::test]
    async fn parallelism_bounds_units_in_flight() {
        let handles = handles(10);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let executor = BatchExecutor::new(2, Duration::from_secs(5));
        let result = executor
            .run_batch("bounded", &handles, |_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(result.is_clean());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn empty_batch_is_clean() {
        let result = BatchExecutor::default()
            .run_batch("empty", &[], |_| async { Ok(()) })
            .await;
        assert!(result.is_empty());
        assert!(result.is_clean());
    }
}
