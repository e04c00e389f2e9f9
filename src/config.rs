// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the assignment configuration file that drives every
//! classpilot run. The file is a flat TOML document that names the
//! organization, the assignment prefix, the template repository, which steps
//! are enabled, and which secrets to distribute:
//!
//! ```toml
//! organization = "cs101-fall"
//! assignment_prefix = "hw1"
//! template_repo_url = "https://github.com/cs101-fall/hw1-template.git"
//! step_assist_students_enabled = false
//!
//! [[secrets]]
//! name = "INSTRUCTOR_TESTS_TOKEN"
//! description = "Read access to the private test suite"
//! kind = "github-token"
//! source = { env = "INSTRUCTOR_TESTS_TOKEN" }
//! ```
//!
//! The configuration is validated once when loaded and is immutable for the
//! rest of the run.

use crate::{forge::Permission, orchestrator::Step};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

static SECRET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("secret name pattern is valid")
});

/// Most verification queries allowed per collaborator check.
const MAX_VERIFY_ATTEMPTS: u32 = 20;

/// Assignment configuration.
///
/// Everything one run needs to know about a single assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentConfig {
    /// Organization that owns the student repositories.
    pub organization: String,

    /// Prefix shared by every repository of the assignment.
    pub assignment_prefix: String,

    /// Clone URL of the template repository.
    pub template_repo_url: String,

    /// Clone URL of the classroom copy of the template, if any.
    pub classroom_repo_url: Option<String>,

    /// Branch of the template that gets synchronized.
    pub template_branch: String,

    /// Branch that template updates are offered on in student repositories.
    pub update_branch: String,

    /// Per-step enable flags.
    pub steps: StepFlags,

    /// Repository discovery filters.
    pub discovery: DiscoverySettings,

    /// Secrets to distribute.
    pub secrets: Vec<SecretDefinition>,

    /// Secrets older than this many days are redeployed.
    pub secret_max_age_days: u32,

    /// Collaborator access settings.
    pub collaborators: CollaboratorSettings,

    /// Gitignore-style patterns of student files that template updates never
    /// overwrite.
    pub preserve_files: Vec<String>,

    /// Bounds for batch execution.
    pub batch: BatchSettings,

    /// Bounds for collaborator access verification.
    pub verify: VerifySettings,

    /// Scratch directory for clones.
    pub workdir: Option<PathBuf>,

    /// Run log used by unattended runs.
    pub run_log: Option<PathBuf>,

    /// Centralized token store.
    pub token_store: Option<PathBuf>,
}

impl AssignmentConfig {
    /// Load assignment configuration from a file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file cannot be read.
    /// - Return any validation error produced by parsing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_to_string(path.as_ref()).map_err(|err| ConfigError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Repository secrets, i.e., those rotated once per student repository.
    pub fn repository_secrets(&self) -> impl Iterator<Item = &SecretDefinition> {
        self.secrets.iter().filter(|secret| !secret.org_level)
    }

    /// Organization secrets, i.e., those rotated once per run.
    pub fn organization_secrets(&self) -> impl Iterator<Item = &SecretDefinition> {
        self.secrets.iter().filter(|secret| secret.org_level)
    }
}

impl FromStr for AssignmentConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let file: ConfigFile = toml::de::from_str(data)?;
        AssignmentConfig::try_from(file)
    }
}

impl TryFrom<ConfigFile> for AssignmentConfig {
    type Error = ConfigError;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        require("organization", &file.organization)?;
        require("assignment_prefix", &file.assignment_prefix)?;
        require("template_repo_url", &file.template_repo_url)?;
        require("template_branch", &file.template_branch)?;
        require("update_branch", &file.update_branch)?;

        if file.parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "parallelism".into(),
                reason: "must be at least 1".into(),
            });
        }

        if !(1..=MAX_VERIFY_ATTEMPTS).contains(&file.verify_attempts) {
            return Err(ConfigError::InvalidValue {
                field: "verify_attempts".into(),
                reason: format!("must be between 1 and {MAX_VERIFY_ATTEMPTS}"),
            });
        }

        if !file.verify_backoff.is_finite() || file.verify_backoff < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "verify_backoff".into(),
                reason: format!("{} is not a finite factor of at least 1.0", file.verify_backoff),
            });
        }

        if file.collaborator_permission == Permission::None {
            return Err(ConfigError::InvalidValue {
                field: "collaborator_permission".into(),
                reason: "required permission cannot be \"none\"".into(),
            });
        }

        for pattern in &file.exclude_suffixes {
            glob::Pattern::new(pattern).map_err(|err| ConfigError::InvalidValue {
                field: "exclude_suffixes".into(),
                reason: format!("{pattern:?}: {err}"),
            })?;
        }

        let mut seen = HashSet::new();
        let mut secrets = Vec::with_capacity(file.secrets.len());
        for mut secret in file.secrets {
            secret.validate()?;
            if !seen.insert(secret.name.clone()) {
                return Err(ConfigError::DuplicateSecret { name: secret.name });
            }

            // INVARIANT: Legacy token file paths are shell expanded like every other path.
            if let SecretSource::File(path) = &secret.source {
                let expanded = expand_path(path)?;
                secret.source = SecretSource::File(expanded);
            }
            secrets.push(secret);
        }

        Ok(Self {
            organization: file.organization,
            assignment_prefix: file.assignment_prefix,
            template_repo_url: file.template_repo_url,
            classroom_repo_url: file.classroom_repo_url.filter(|url| !url.trim().is_empty()),
            template_branch: file.template_branch,
            update_branch: file.update_branch,
            steps: StepFlags {
                sync_template: file.step_sync_template_enabled,
                discover: file.step_discover_enabled,
                manage_secrets: file.step_manage_secrets_enabled,
                assist_students: file.step_assist_students_enabled,
                cycle_collaborators: file.step_cycle_collaborators_enabled,
            },
            discovery: DiscoverySettings {
                exclude_suffixes: file.exclude_suffixes,
                include_template: file.include_template,
                require_matches: file.require_matches,
            },
            secrets,
            secret_max_age_days: file.secret_max_age_days,
            collaborators: CollaboratorSettings {
                permission: file.collaborator_permission,
                allowlist: file.collaborator_allowlist,
            },
            preserve_files: file.preserve_files,
            batch: BatchSettings {
                parallelism: file.parallelism,
                item_timeout: Duration::from_secs(file.item_timeout_secs),
            },
            verify: VerifySettings {
                attempts: file.verify_attempts,
                delay: Duration::from_millis(file.verify_delay_ms),
                backoff: file.verify_backoff,
            },
            workdir: file.workdir.as_deref().map(expand_path).transpose()?,
            run_log: file.run_log.as_deref().map(expand_path).transpose()?,
            token_store: file.token_store.as_deref().map(expand_path).transpose()?,
        })
    }
}

/// Enable flags for the fixed set of workflow steps.
///
/// Every step defaults to enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFlags {
    pub sync_template: bool,
    pub discover: bool,
    pub manage_secrets: bool,
    pub assist_students: bool,
    pub cycle_collaborators: bool,
}

impl StepFlags {
    /// Check if target step is enabled.
    pub fn is_enabled(&self, step: Step) -> bool {
        match step {
            Step::SyncTemplate => self.sync_template,
            Step::Discover => self.discover,
            Step::ManageSecrets => self.manage_secrets,
            Step::AssistStudents => self.assist_students,
            Step::CycleCollaborators => self.cycle_collaborators,
        }
    }
}

impl Default for StepFlags {
    fn default() -> Self {
        Self {
            sync_template: true,
            discover: true,
            manage_secrets: true,
            assist_students: true,
            cycle_collaborators: true,
        }
    }
}

/// Repository discovery filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Glob patterns matched against the part of a name after the prefix.
    pub exclude_suffixes: Vec<String>,

    /// Return template repositories even though they match an exclusion.
    pub include_template: bool,

    /// Treat an empty discovery as an error.
    pub require_matches: bool,
}

/// Collaborator access settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorSettings {
    /// Permission level every student must hold on their repository.
    pub permission: Permission,

    /// Students whose access may be cycled. Empty means everyone.
    pub allowlist: Vec<String>,
}

impl CollaboratorSettings {
    /// Check if access of target student may be cycled.
    pub fn allows(&self, student: &str) -> bool {
        self.allowlist.is_empty()
            || self
                .allowlist
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(student))
    }
}

/// Bounds for batch execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub parallelism: usize,
    pub item_timeout: Duration,
}

/// Bounds for collaborator access verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifySettings {
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: f64,
}

/// Secret definition.
///
/// Names a secret, where its value comes from, and whether it lives on the
/// organization or on each repository.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SecretDefinition {
    /// Secret name as the forge stores it.
    pub name: String,

    /// Human description of the secret.
    #[serde(default)]
    pub description: String,

    /// Deploy once to the organization instead of to every repository.
    #[serde(default)]
    pub org_level: bool,

    /// Shape of the secret value.
    #[serde(default)]
    pub kind: SecretKind,

    /// Where to resolve the secret value from.
    pub source: SecretSource,
}

impl SecretDefinition {
    /// Validate secret name.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidSecretName`] if name is not made of
    ///   upper-case letters, digits, and underscores, starts with a digit, or
    ///   uses the reserved `GITHUB_` prefix.
    pub fn validate(&self) -> Result<()> {
        if !SECRET_NAME.is_match(&self.name) || self.name.starts_with("GITHUB_") {
            return Err(ConfigError::InvalidSecretName {
                name: self.name.clone(),
            });
        }

        Ok(())
    }
}

/// Shape of a secret value.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretKind {
    /// Arbitrary non-empty value.
    #[default]
    Opaque,

    /// Personal access or app token issued by the forge.
    GithubToken,
}

/// Where a secret value is resolved from.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// Environment variable.
    Env(String),

    /// Literal value written in the configuration.
    Value(String),

    /// Legacy token file holding the value on its first line.
    File(PathBuf),

    /// Key in the centralized token store.
    Store(String),
}

/// On-disk layout of the assignment configuration.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    organization: String,
    assignment_prefix: String,
    template_repo_url: String,
    #[serde(default)]
    classroom_repo_url: Option<String>,
    #[serde(default = "default_template_branch")]
    template_branch: String,
    #[serde(default = "default_update_branch")]
    update_branch: String,

    #[serde(default = "enabled")]
    step_sync_template_enabled: bool,
    #[serde(default = "enabled")]
    step_discover_enabled: bool,
    #[serde(default = "enabled")]
    step_manage_secrets_enabled: bool,
    #[serde(default = "enabled")]
    step_assist_students_enabled: bool,
    #[serde(default = "enabled")]
    step_cycle_collaborators_enabled: bool,

    #[serde(default = "default_exclude_suffixes")]
    exclude_suffixes: Vec<String>,
    #[serde(default)]
    include_template: bool,
    #[serde(default = "enabled")]
    require_matches: bool,

    #[serde(default = "default_max_age_days")]
    secret_max_age_days: u32,

    #[serde(default = "default_permission")]
    collaborator_permission: Permission,
    #[serde(default)]
    collaborator_allowlist: Vec<String>,

    #[serde(default)]
    preserve_files: Vec<String>,

    #[serde(default = "default_parallelism")]
    parallelism: usize,
    #[serde(default = "default_item_timeout_secs")]
    item_timeout_secs: u64,
    #[serde(default = "default_verify_attempts")]
    verify_attempts: u32,
    #[serde(default = "default_verify_delay_ms")]
    verify_delay_ms: u64,
    #[serde(default = "default_verify_backoff")]
    verify_backoff: f64,

    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    run_log: Option<String>,
    #[serde(default)]
    token_store: Option<String>,

    #[serde(default)]
    secrets: Vec<SecretDefinition>,
}

fn enabled() -> bool {
    true
}

fn default_template_branch() -> String {
    "main".into()
}

fn default_update_branch() -> String {
    "template-updates".into()
}

fn default_exclude_suffixes() -> Vec<String> {
    vec!["-template".into(), "-instructor*".into(), "-example".into()]
}

fn default_max_age_days() -> u32 {
    90
}

fn default_permission() -> Permission {
    Permission::Write
}

fn default_parallelism() -> usize {
    5
}

fn default_item_timeout_secs() -> u64 {
    120
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_verify_delay_ms() -> u64 {
    2000
}

fn default_verify_backoff() -> f64 {
    2.0
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing {
            field: field.into(),
        });
    }

    Ok(())
}

fn expand_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let raw = path.as_ref().to_string_lossy();
    Ok(PathBuf::from(shellexpand::full(raw.as_ref())?.into_owned()))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file cannot be read.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Required field is empty.
    #[error("required field {field:?} is empty")]
    Missing { field: String },

    /// Field holds a value outside its domain.
    #[error("invalid value for {field:?}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Secret name is not usable on the forge.
    #[error("invalid secret name {name:?}: expected upper-case letters, digits, and underscores")]
    InvalidSecretName { name: String },

    /// Secret defined more than once.
    #[error("secret {name:?} is defined more than once")]
    DuplicateSecret { name: String },
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[sealed_test(env = [("TOKENS", "/home/prof/tokens")])]
    fn deserialize_assignment_config() -> anyhow::Result<()> {
        let result: AssignmentConfig = indoc! {r#"
            organization = "cs101-fall"
            assignment_prefix = "hw1"
            template_repo_url = "https://github.com/cs101-fall/hw1-template.git"
            classroom_repo_url = "https://github.com/cs101-fall/hw1-classroom.git"
            step_assist_students_enabled = false
            collaborator_permission = "admin"
            collaborator_allowlist = ["alice"]
            preserve_files = ["src/solution.py"]
            parallelism = 8
            token_store = "$TOKENS/store.toml"

            [[secrets]]
            name = "INSTRUCTOR_TESTS_TOKEN"
            description = "Read access to the private test suite"
            kind = "github-token"
            source = { file = "$TOKENS/tests.token" }

            [[secrets]]
            name = "GRADER_URL"
            org_level = true
            source = { value = "https://grader.example.org" }
        "#}
        .parse()?;

        assert_eq!(result.organization, "cs101-fall");
        assert_eq!(result.template_branch, "main");
        assert_eq!(result.update_branch, "template-updates");
        assert_eq!(
            result.steps,
            StepFlags {
                assist_students: false,
                ..StepFlags::default()
            }
        );
        assert_eq!(result.collaborators.permission, Permission::Admin);
        assert_eq!(result.batch.parallelism, 8);
        assert_eq!(result.batch.item_timeout, Duration::from_secs(120));
        assert_eq!(result.verify.attempts, 3);
        assert_eq!(
            result.token_store,
            Some(PathBuf::from("/home/prof/tokens/store.toml"))
        );
        assert_eq!(
            result.secrets[0],
            SecretDefinition {
                name: "INSTRUCTOR_TESTS_TOKEN".into(),
                description: "Read access to the private test suite".into(),
                org_level: false,
                kind: SecretKind::GithubToken,
                source: SecretSource::File("/home/prof/tokens/tests.token".into()),
            }
        );
        assert_eq!(result.repository_secrets().count(), 1);
        assert_eq!(
            result.organization_secrets().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["GRADER_URL"]
        );

        Ok(())
    }

    #[test]
    fn defaults_exclude_suffixes() -> anyhow::Result<()> {
        let result: AssignmentConfig = indoc! {r#"
            organization = "org"
            assignment_prefix = "lab"
            template_repo_url = "https://example.org/lab-template.git"
        "#}
        .parse()?;

        assert_eq!(
            result.discovery,
            DiscoverySettings {
                exclude_suffixes: vec!["-template".into(), "-instructor*".into(), "-example".into()],
                include_template: false,
                require_matches: true,
            }
        );
        assert_eq!(result.secret_max_age_days, 90);
        assert_eq!(result.classroom_repo_url, None);

        Ok(())
    }

    #[test_case("api_token"; "lower case")]
    #[test_case("1TOKEN"; "leading digit")]
    #[test_case("MY-TOKEN"; "dash")]
    #[test_case("GITHUB_TOKEN"; "reserved prefix")]
    #[test]
    fn reject_invalid_secret_names(name: &str) {
        let data = format!(
            "organization = \"o\"\nassignment_prefix = \"p\"\ntemplate_repo_url = \"u\"\n\
             [[secrets]]\nname = \"{name}\"\nsource = {{ env = \"X\" }}\n"
        );
        let result = data.parse::<AssignmentConfig>();
        assert!(matches!(result, Err(ConfigError::InvalidSecretName { .. })));
    }

    #[test]
    fn reject_duplicate_secrets() {
        let result = indoc! {r#"
            organization = "o"
            assignment_prefix = "p"
            template_repo_url = "u"

            [[secrets]]
            name = "TOKEN"
            source = { env = "A" }

            [[secrets]]
            name = "TOKEN"
            source = { env = "B" }
        "#}
        .parse::<AssignmentConfig>();
        assert!(matches!(result, Err(ConfigError::DuplicateSecret { name }) if name == "TOKEN"));
    }

    #[test]
    fn reject_missing_organization() {
        let result = indoc! {r#"
            organization = " "
            assignment_prefix = "p"
            template_repo_url = "u"
        "#}
        .parse::<AssignmentConfig>();
        assert!(matches!(result, Err(ConfigError::Missing { field }) if field == "organization"));
    }

    #[test]
    fn reject_zero_parallelism() {
        let result = indoc! {r#"
            organization = "o"
            assignment_prefix = "p"
            template_repo_url = "u"
            parallelism = 0
        "#}
        .parse::<AssignmentConfig>();
        assert!(matches!(result, Err(ConfigError::InvalidValue { field, .. }) if field == "parallelism"));
    }

    #[test_case("verify_backoff = inf", "verify_backoff"; "infinite backoff")]
    #[test_case("verify_backoff = nan", "verify_backoff"; "nan backoff")]
    #[test_case("verify_backoff = 0.5", "verify_backoff"; "shrinking backoff")]
    #[test_case("verify_attempts = 0", "verify_attempts"; "no attempts")]
    #[test_case("verify_attempts = 4000000", "verify_attempts"; "too many attempts")]
    #[test]
    fn reject_unbounded_verification(line: &str, expect: &str) {
        let data = format!(
            "organization = \"o\"\nassignment_prefix = \"p\"\ntemplate_repo_url = \"u\"\n{line}\n"
        );
        let result = data.parse::<AssignmentConfig>();
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { ref field, .. }) if field == expect),
            "{result:?}"
        );
    }

    #[test]
    fn collaborator_allowlist_is_case_insensitive() {
        let settings = CollaboratorSettings {
            permission: Permission::Write,
            allowlist: vec!["Alice".into()],
        };
        assert!(settings.allows("alice"));
        assert!(!settings.allows("bob"));

        let open = CollaboratorSettings {
            permission: Permission::Write,
            allowlist: Vec::new(),
        };
        assert!(open.allows("bob"));
    }
}
