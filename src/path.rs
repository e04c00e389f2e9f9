// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations for the files classpilot reads and writes when
//! the assignment configuration does not name them explicitly.

use std::path::PathBuf;

/// Determine default absolute path to the assignment configuration file.
///
/// Uses `$XDG_CONFIG_HOME/classpilot/assignment.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("classpilot").join("assignment.toml"))
        .ok_or(NoWayHome)
}

/// Determine default work directory for repository clones.
///
/// Uses `$XDG_CACHE_HOME/classpilot`. Clones placed here are scratch data
/// and get replaced on every run.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_workdir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|path| path.join("classpilot"))
        .ok_or(NoWayHome)
}

/// Determine default path of the unattended run log.
///
/// Uses `$XDG_DATA_HOME/classpilot/runs.log`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_run_log() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("classpilot").join("runs.log"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
