// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository catalog.
//!
//! Resolve an assignment into the repositories it consists of. Classroom
//! style forges create one repository per student named
//! `{assignment_prefix}-{student}`, next to a handful of repositories that
//! share the prefix but do not belong to any student, e.g., the template
//! itself or an instructor's solution. Those are recognized through
//! configurable exclusion patterns.

use crate::{
    config::{AssignmentConfig, DiscoverySettings},
    forge::{ForgeClient, ForgeError},
};

use glob::Pattern;
use serde::Serialize;
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};
use tracing::{debug, info, instrument};

/// What a repository is to the assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Student,
    Template,
    Instructor,
    Excluded,
}

impl Display for Role {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Student => "student",
            Self::Template => "template",
            Self::Instructor => "instructor",
            Self::Excluded => "excluded",
        };
        fmt.write_str(name)
    }
}

/// One repository of the assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RepositoryHandle {
    pub organization: String,

    /// Short name, e.g., "hw1-alice".
    pub name: String,

    /// Owner qualified name, e.g., "cs101/hw1-alice".
    pub full_name: String,

    /// Everything after the assignment prefix, e.g., "alice".
    pub student: String,

    pub clone_url: String,
    pub role: Role,
}

/// Result of a discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// One handle per unique repository that made it through the filters.
    pub handles: Vec<RepositoryHandle>,

    /// Names carrying the prefix that were filtered out.
    pub excluded: Vec<String>,

    /// Number of listed names that do not carry the prefix at all.
    pub unmatched: usize,
}

impl Discovery {
    /// Student handles, the only ones batches ever run against.
    pub fn students(&self) -> Vec<RepositoryHandle> {
        self.handles
            .iter()
            .filter(|handle| handle.role == Role::Student)
            .cloned()
            .collect()
    }

    /// Number of unique repositories the forge listed.
    pub fn total(&self) -> usize {
        self.handles.len() + self.excluded.len() + self.unmatched
    }
}

impl Display for Discovery {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{} repositories ({} students), {} excluded",
            self.handles.len(),
            self.handles
                .iter()
                .filter(|handle| handle.role == Role::Student)
                .count(),
            self.excluded.len()
        )
    }
}

#[derive(Debug, Clone)]
struct Exclusion {
    pattern: Pattern,
    role: Role,
}

/// Resolve assignment into repository handles.
pub struct RepositoryCatalog {
    forge: Arc<dyn ForgeClient>,
    organization: String,
    prefix: String,
    settings: DiscoverySettings,
    exclusions: Vec<Exclusion>,
}

impl RepositoryCatalog {
    /// Construct new repository catalog for assignment.
    ///
    /// # Errors
    ///
    /// - Return [`DiscoveryError::InvalidPattern`] if an exclusion pattern is
    ///   not a valid glob.
    pub fn new(forge: Arc<dyn ForgeClient>, config: &AssignmentConfig) -> Result<Self> {
        let exclusions = config
            .discovery
            .exclude_suffixes
            .iter()
            .map(|suffix| {
                // INVARIANT: Suffixes match the end of the name, wherever they start.
                let pattern = Pattern::new(&format!("*{suffix}")).map_err(|err| {
                    DiscoveryError::InvalidPattern {
                        pattern: suffix.clone(),
                        source: err,
                    }
                })?;
                Ok(Exclusion {
                    pattern,
                    role: role_of_suffix(suffix),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            forge,
            organization: config.organization.clone(),
            prefix: config.assignment_prefix.clone(),
            settings: config.discovery.clone(),
            exclusions,
        })
    }

    /// Discover repositories of the assignment.
    ///
    /// Only queries the forge, so it is safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// - Return [`DiscoveryError::Unreachable`] if the forge cannot list the
    ///   organization.
    /// - Return [`DiscoveryError::NoMatches`] if matches are required but
    ///   nothing matched.
    #[instrument(skip(self), fields(org = %self.organization, prefix = %self.prefix))]
    pub async fn discover(&self) -> Result<Discovery> {
        let listed = self
            .forge
            .list_repositories(&self.organization, &self.prefix)
            .await
            .map_err(|err| DiscoveryError::Unreachable {
                organization: self.organization.clone(),
                source: err,
            })?;

        let lead = format!("{}-", self.prefix);
        let mut seen = BTreeSet::new();
        let mut discovery = Discovery::default();

        for repo in listed {
            if !seen.insert(repo.name.clone()) {
                debug!("skip duplicate listing of {}", repo.name);
                continue;
            }

            let Some(student) = repo.name.strip_prefix(lead.as_str()) else {
                discovery.unmatched += 1;
                continue;
            };

            let role = self.classify(&repo.name[self.prefix.len()..]);
            let keep = match role {
                Role::Student => true,
                Role::Template => self.settings.include_template,
                Role::Instructor | Role::Excluded => false,
            };

            if !keep {
                debug!("exclude {} as {role}", repo.name);
                discovery.excluded.push(repo.name);
                continue;
            }

            discovery.handles.push(RepositoryHandle {
                organization: self.organization.clone(),
                student: student.to_string(),
                full_name: repo.full_name,
                clone_url: repo.clone_url,
                name: repo.name,
                role,
            });
        }

        info!("discovered {discovery}");
        if discovery.handles.is_empty() && self.settings.require_matches {
            return Err(DiscoveryError::NoMatches {
                organization: self.organization.clone(),
                prefix: self.prefix.clone(),
            });
        }

        Ok(discovery)
    }

    fn classify(&self, suffix: &str) -> Role {
        self.exclusions
            .iter()
            .find(|exclusion| exclusion.pattern.matches(suffix))
            .map(|exclusion| exclusion.role)
            .unwrap_or(Role::Student)
    }
}

fn role_of_suffix(suffix: &str) -> Role {
    if suffix.starts_with("-template") {
        Role::Template
    } else if suffix.starts_with("-instructor") {
        Role::Instructor
    } else {
        Role::Excluded
    }
}

/// Repository discovery error types.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Organization cannot be listed.
    #[error("failed to list repositories of organization {organization}")]
    Unreachable {
        organization: String,
        #[source]
        source: ForgeError,
    },

    /// No repository matched the assignment prefix.
    #[error("no repositories in {organization} match prefix {prefix:?}")]
    NoMatches { organization: String, prefix: String },

    /// Exclusion pattern is not a valid glob.
    #[error("invalid exclusion pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Friendly result alias :3
type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
