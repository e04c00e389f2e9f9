// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Secret rotation.
//!
//! Every configured secret is checked against every student repository, or
//! once against the organization for organization-level secrets. Rotation is
//! a two stage affair: first [`plan`] decides what should happen based on
//! what the forge reports about the secret, then
//! [`SecretRotationEngine::apply`] carries the decision out.
//!
//! # Rotation Policy
//!
//! The decision table, checked top to bottom:
//!
//! | Condition                    | Decision      |
//! |------------------------------|---------------|
//! | step disabled                | skip-disabled |
//! | forced                       | deploy        |
//! | secret missing               | deploy        |
//! | age in days > maximum age    | deploy        |
//! | otherwise                    | skip-fresh    |
//!
//! A secret that exists but whose age cannot be determined counts as fresh.

pub mod resolve;

pub use resolve::{validate_secret_value, ResolveError, SecretResolver, SecretValue, SourceResolver};

use crate::{
    batch::RepositoryError,
    catalog::RepositoryHandle,
    config::SecretDefinition,
    forge::{ForgeClient, SecretMetadata, SecretTarget},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::{Arc, Mutex},
};
use tracing::{debug, info, instrument, warn};

/// Knobs of the rotation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Secrets step is enabled.
    pub enabled: bool,

    /// Redeploy regardless of age.
    pub force: bool,

    /// Redeploy secrets older than this many days.
    pub max_age_days: i64,
}

impl RotationPolicy {
    /// Check if a decision depends on the forge's view of the secret.
    pub fn needs_state(&self) -> bool {
        self.enabled && !self.force
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            force: false,
            max_age_days: 90,
        }
    }
}

/// What the forge reports about one secret on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretState {
    pub exists: bool,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub age_days: Option<i64>,
}

impl SecretState {
    /// State of a secret that does not exist.
    pub fn missing() -> Self {
        Self {
            exists: false,
            last_updated_at: None,
            age_days: None,
        }
    }

    /// State of an existing secret last written at a known time.
    pub fn updated_at(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            exists: true,
            last_updated_at: Some(updated_at),
            age_days: Some((now - updated_at).num_days()),
        }
    }

    /// Derive state from forge metadata.
    pub fn from_metadata(metadata: Option<&SecretMetadata>, now: DateTime<Utc>) -> Self {
        match metadata {
            Some(metadata) => Self::updated_at(metadata.updated_at, now),
            None => Self::missing(),
        }
    }
}

/// What to do with a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationDecision {
    Deploy,
    SkipFresh,
    SkipDisabled,
}

impl Display for RotationDecision {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Deploy => "deploy",
            Self::SkipFresh => "skip-fresh",
            Self::SkipDisabled => "skip-disabled",
        };
        fmt.write_str(name)
    }
}

/// Decide what to do with a secret.
pub fn plan(state: &SecretState, policy: &RotationPolicy) -> RotationDecision {
    if !policy.enabled {
        return RotationDecision::SkipDisabled;
    }

    if policy.force || !state.exists {
        return RotationDecision::Deploy;
    }

    match state.age_days {
        Some(age) if age > policy.max_age_days => RotationDecision::Deploy,
        _ => RotationDecision::SkipFresh,
    }
}

/// Result of rotating one secret on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretOutcome {
    pub name: String,
    pub decision: RotationDecision,

    /// Decision was carried out against the forge. False on dry runs and
    /// skips.
    pub applied: bool,
}

impl Display for SecretOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}={}", self.name, self.decision)?;
        if self.decision == RotationDecision::Deploy && !self.applied {
            fmt.write_str(" (dry-run)")?;
        }

        Ok(())
    }
}

/// Results of rotating every secret of one repository.
#[derive(Debug, Clone, Default)]
pub struct RepositoryRotation {
    pub results: Vec<(String, Result<SecretOutcome>)>,
}

impl RepositoryRotation {
    /// Check if every secret was rotated without error.
    pub fn is_clean(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    /// Turn into a repository outcome that fails if any secret failed.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::SecretRotation`] listing every secret,
    ///   including the ones that went through, if any secret failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(RepositoryError::SecretRotation {
                detail: self.to_string(),
            })
        }
    }
}

impl Display for RepositoryRotation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for (index, (name, result)) in self.results.iter().enumerate() {
            if index > 0 {
                fmt.write_str(", ")?;
            }
            match result {
                Ok(outcome) => write!(fmt, "{outcome}")?,
                Err(err) => write!(fmt, "{name}=error: {err}")?,
            }
        }

        Ok(())
    }
}

/// Secret rotation engine.
///
/// Shared by every worker of a batch. Secret values are resolved and
/// validated at most once per engine, i.e., once per run.
pub struct SecretRotationEngine {
    forge: Arc<dyn ForgeClient>,
    resolver: Arc<dyn SecretResolver>,
    policy: RotationPolicy,
    now: DateTime<Utc>,
    dry_run: bool,
    values: Mutex<HashMap<String, Result<SecretValue, String>>>,
}

impl SecretRotationEngine {
    /// Construct new secret rotation engine.
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        resolver: Arc<dyn SecretResolver>,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            forge,
            resolver,
            policy,
            now: Utc::now(),
            dry_run: false,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Compute secret ages relative to a fixed point in time.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Plan and resolve, but never write to the forge.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Query forge for state of secret.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::SecretLookup`] if the forge cannot be
    ///   queried.
    pub async fn state_of(&self, target: &SecretTarget, name: &str) -> Result<SecretState> {
        let metadata = self
            .forge
            .get_secret_metadata(target, name)
            .await
            .map_err(|err| RepositoryError::SecretLookup {
                secret: name.into(),
                source: err,
            })?;

        Ok(SecretState::from_metadata(metadata.as_ref(), self.now))
    }

    /// Carry out rotation decision.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::TokenInvalid`] if secret value cannot be
    ///   resolved or fails validation.
    /// - Return [`RepositoryError::Deploy`] if forge rejects the secret.
    #[instrument(skip(self, definition), fields(secret = %definition.name), level = "debug")]
    pub async fn apply(
        &self,
        target: &SecretTarget,
        definition: &SecretDefinition,
        decision: RotationDecision,
    ) -> Result<SecretOutcome> {
        let outcome = |applied| SecretOutcome {
            name: definition.name.clone(),
            decision,
            applied,
        };

        if decision != RotationDecision::Deploy {
            debug!("{} on {target}: {decision}", definition.name);
            return Ok(outcome(false));
        }

        let value = self.value_of(definition)?;
        if self.dry_run {
            info!("would deploy {} to {target}", definition.name);
            return Ok(outcome(false));
        }

        self.forge
            .create_or_update_secret(target, &definition.name, &value)
            .await
            .map_err(|err| RepositoryError::Deploy {
                secret: definition.name.clone(),
                source: err,
            })?;
        info!("deployed {} to {target}", definition.name);

        Ok(outcome(true))
    }

    /// Plan and apply rotation of one secret on one target.
    ///
    /// Skips the forge query entirely when the policy does not need it.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError`] of the failing stage.
    pub async fn rotate(
        &self,
        target: &SecretTarget,
        definition: &SecretDefinition,
    ) -> Result<SecretOutcome> {
        let state = if self.policy.needs_state() {
            self.state_of(target, &definition.name).await?
        } else {
            SecretState::missing()
        };

        let decision = plan(&state, &self.policy);
        self.apply(target, definition, decision).await
    }

    /// Rotate every repository level secret of a student repository.
    ///
    /// Keeps going after a failing secret so that one bad value does not
    /// starve the rest. Every secret gets an entry, failed or not.
    #[instrument(skip(self, handle, definitions), fields(repo = %handle.full_name))]
    pub async fn rotate_repository(
        &self,
        handle: &RepositoryHandle,
        definitions: &[SecretDefinition],
    ) -> RepositoryRotation {
        let target = SecretTarget::Repository(handle.full_name.clone());
        let mut results = Vec::new();

        for definition in definitions.iter().filter(|def| !def.org_level) {
            let result = self.rotate(&target, definition).await;
            if let Err(err) = &result {
                warn!("{}: {err}", handle.full_name);
            }
            results.push((definition.name.clone(), result));
        }

        RepositoryRotation { results }
    }

    /// Rotate every organization level secret once.
    #[instrument(skip(self, definitions))]
    pub async fn rotate_organization(
        &self,
        org: &str,
        definitions: &[SecretDefinition],
    ) -> Vec<(String, Result<SecretOutcome>)> {
        let target = SecretTarget::Organization(org.into());
        let mut results = Vec::new();
        for definition in definitions.iter().filter(|def| def.org_level) {
            let result = self.rotate(&target, definition).await;
            results.push((definition.name.clone(), result));
        }

        results
    }

    fn value_of(&self, definition: &SecretDefinition) -> Result<SecretValue> {
        let mut values = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = values.entry(definition.name.clone()).or_insert_with(|| {
            self.resolver
                .resolve(definition)
                .and_then(|value| validate_secret_value(definition, &value).map(|_| value))
                .map_err(|err| err.to_string())
        });

        entry.clone().map_err(|reason| RepositoryError::TokenInvalid {
            secret: definition.name.clone(),
            reason,
        })
    }
}

/// Friendly result alias :3
type Result<T, E = RepositoryError> = std::result::Result<T, E>;
