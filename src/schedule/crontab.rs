// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! OS scheduler backends.
//!
//! The scheduler only ever reads and writes a whole crontab at once. Keeping
//! the backend this small means the entry bookkeeping can be tested against
//! an in-memory crontab, and the user's real crontab is only touched by two
//! `crontab` invocations.

use std::{
    ffi::{OsStr, OsString},
    io::Write,
    process::{Command, Stdio},
    sync::Mutex,
};
use tracing::debug;

/// Whole-table access to a crontab.
pub trait CrontabBackend: Send + Sync {
    /// Read current crontab. A missing crontab reads as empty.
    fn read(&self) -> Result<String>;

    /// Replace current crontab.
    fn write(&self, contents: &str) -> Result<()>;
}

/// Crontab of the current user, managed through `crontab(1)`.
#[derive(Debug, Clone)]
pub struct UserCrontab {
    program: OsString,
}

impl UserCrontab {
    /// Construct new user crontab backend using `crontab` from `$PATH`.
    pub fn new() -> Self {
        Self::with_program("crontab")
    }

    /// Construct new user crontab backend using a specific binary.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for UserCrontab {
    fn default() -> Self {
        Self::new()
    }
}

impl CrontabBackend for UserCrontab {
    fn read(&self) -> Result<String> {
        match syscall(&self.program, ["-l"], None) {
            Ok(contents) => Ok(contents),
            // INVARIANT: Users without a crontab get an error instead of an empty listing.
            Err(CrontabError::Syscall { reason, .. }) if reason.contains("no crontab for") => {
                Ok(String::new())
            }
            Err(err) => Err(err),
        }
    }

    fn write(&self, contents: &str) -> Result<()> {
        syscall(&self.program, ["-"], Some(contents.as_bytes()))?;
        Ok(())
    }
}

/// Crontab held in memory.
#[derive(Debug, Default)]
pub struct MemoryCrontab {
    contents: Mutex<String>,
}

impl MemoryCrontab {
    /// Construct new in-memory crontab with initial contents.
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(contents.into()),
        }
    }

    /// Current contents.
    pub fn contents(&self) -> String {
        self.contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl CrontabBackend for MemoryCrontab {
    fn read(&self) -> Result<String> {
        Ok(self.contents())
    }

    fn write(&self, contents: &str) -> Result<()> {
        *self
            .contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = contents.into();
        Ok(())
    }
}

fn syscall(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    stdin: Option<&[u8]>,
) -> Result<String> {
    let program = cmd.as_ref().to_string_lossy().into_owned();
    debug!("run {program}");
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
        .map_err(|err| CrontabError::Syscall {
            program: program.clone(),
            reason: err.to_string(),
        })?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data).map_err(|err| CrontabError::Syscall {
            program: program.clone(),
            reason: err.to_string(),
        })?;
    }

    let output = child.wait_with_output().map_err(|err| CrontabError::Syscall {
        program: program.clone(),
        reason: err.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(output.stderr.as_slice());
        return Err(CrontabError::Syscall {
            program,
            reason: stderr.trim_end().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(output.stdout.as_slice()).into_owned())
}

/// Crontab backend error types.
#[derive(Debug, thiserror::Error)]
pub enum CrontabError {
    /// Crontab binary failed.
    #[error("{program} failed: {reason}")]
    Syscall { program: String, reason: String },
}

/// Friendly result alias :3
pub type Result<T, E = CrontabError> = std::result::Result<T, E>;
