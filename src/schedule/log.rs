// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Size rotated run log.
//!
//! Unattended runs have nobody watching their output, so every run appends
//! its summary here. Each line reads `<RFC 3339 timestamp> <LEVEL> <message>`.
//! Once the log would grow past its size limit, it is rotated: the current
//! file becomes `.1`, the old `.1` becomes `.2`, and so on, dropping the
//! oldest file beyond the retention count.

use chrono::{SecondsFormat, Utc};
use std::{
    fs::{read_to_string, remove_file, rename, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, Level};

/// Rotate once the log would grow past this many bytes.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Number of rotated files kept around.
pub const DEFAULT_KEEP: usize = 3;

/// Append-only run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
}

impl RunLog {
    /// Construct new run log at target path with default limits.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limits(path, DEFAULT_MAX_BYTES, DEFAULT_KEEP)
    }

    /// Construct new run log with custom limits.
    pub fn with_limits(path: impl Into<PathBuf>, max_bytes: u64, keep: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            keep,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Append message, one log line per message line.
    ///
    /// # Errors
    ///
    /// - Return [`RunLogError`] if the log cannot be rotated or written.
    pub fn append(&self, level: Level, message: &str) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut entry = String::new();
        for line in message.lines().filter(|line| !line.trim().is_empty()) {
            entry.push_str(&format!("{timestamp} {level} {line}\n"));
        }
        if entry.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(|err| self.io_error(parent, err))?;
        }

        let size = self.path.metadata().map(|meta| meta.len()).unwrap_or(0);
        if size > 0 && size + entry.len() as u64 > self.max_bytes {
            self.rotate()?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.io_error(&self.path, err))?;
        file.write_all(entry.as_bytes())
            .map_err(|err| self.io_error(&self.path, err))?;

        Ok(())
    }

    /// Last lines of the log, oldest first, reaching into rotated files when
    /// the current one is short.
    ///
    /// # Errors
    ///
    /// - Return [`RunLogError`] if an existing log file cannot be read.
    pub fn tail(&self, count: usize) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for index in 0..=self.keep {
            if lines.len() >= count {
                break;
            }

            let path = self.generation(index);
            if !path.exists() {
                continue;
            }
            let data = read_to_string(&path).map_err(|err| self.io_error(&path, err))?;
            let mut older = data.lines().map(String::from).collect::<Vec<_>>();
            older.append(&mut lines);
            lines = older;
        }

        let skip = lines.len().saturating_sub(count);
        Ok(lines.split_off(skip))
    }

    /// Path of a log generation, zero being the current file.
    pub fn generation(&self, index: usize) -> PathBuf {
        if index == 0 {
            return self.path.clone();
        }

        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&self) -> Result<()> {
        debug!("rotate run log {:?}", self.path.display());
        if self.keep == 0 {
            return remove_file(&self.path).map_err(|err| self.io_error(&self.path, err));
        }

        for index in (1..self.keep).rev() {
            let from = self.generation(index);
            if from.exists() {
                let to = self.generation(index + 1);
                rename(&from, &to).map_err(|err| self.io_error(&from, err))?;
            }
        }

        rename(&self.path, self.generation(1)).map_err(|err| self.io_error(&self.path, err))
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> RunLogError {
        RunLogError {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Run log error.
#[derive(Debug, thiserror::Error)]
#[error("failed to access run log at {:?}", path.display())]
pub struct RunLogError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

/// Friendly result alias :3
type Result<T, E = RunLogError> = std::result::Result<T, E>;
