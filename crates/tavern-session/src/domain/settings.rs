//! Engine settings.
//!
//! Everything tunable about a session lives in one serde document, read
//! from the YAML file named by `TAVERN_SETTINGS` or left at its defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tavern_applier::application::apply::ApplyOptions;
use tavern_applier::domain::economy::DEFAULT_LEDGER_CAP;
use tavern_core::error::DomainError;
use tavern_core::service::ServiceSettings;
use tavern_memory::application::fill::MemoryFillConfig;
use tavern_rules::domain::invariants::InvariantOptions;
use tavern_rules::domain::scope::StrictAllowlist;
use tavern_world_state::domain::locks::ConflictPolicy;
use tracing::info;

/// Environment variable naming the settings file.
pub const SETTINGS_ENV: &str = "TAVERN_SETTINGS";

/// Backoff schedule for retryable service failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after every retry.
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = u64::from(self.factor).saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }
}

/// Session-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    /// Restrict writes to the allowlist.
    pub strict_mode: bool,
    /// Writable fields per domain and sheet; consulted in strict mode only.
    pub allowlist: StrictAllowlist,
    /// How the memory service fills the log.
    pub memory: MemoryFillConfig,
    /// Invariant validator settings.
    pub invariants: InvariantOptions,
    /// Conflict reasons that reject a write.
    pub conflict_policy: ConflictPolicy,
    /// Retry schedule for service calls.
    pub retry: RetryPolicy,
    /// Maximum ledger length.
    pub ledger_cap: usize,
    /// Settings handed to every service invocation.
    pub service: ServiceSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            strict_mode: false,
            allowlist: StrictAllowlist::default(),
            memory: MemoryFillConfig::default(),
            invariants: InvariantOptions::default(),
            conflict_policy: ConflictPolicy::default(),
            retry: RetryPolicy::default(),
            ledger_cap: DEFAULT_LEDGER_CAP,
            service: ServiceSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Parses a YAML settings document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the document does not parse.
    pub fn from_yaml(text: &str) -> Result<Self, DomainError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| DomainError::Validation(format!("invalid engine settings: {e}")))
    }

    /// Reads a YAML settings file.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the file cannot be read, or
    /// `DomainError::Validation` if it does not parse.
    pub fn from_file(path: &Path) -> Result<Self, DomainError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DomainError::Infrastructure(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    /// Loads the file named by `TAVERN_SETTINGS`, or the defaults when the
    /// variable is unset.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::from_file`] errors.
    pub fn load() -> Result<Self, DomainError> {
        match std::env::var(SETTINGS_ENV) {
            Ok(path) if !path.trim().is_empty() => {
                info!(path = %path, "loading engine settings");
                Self::from_file(Path::new(path.trim()))
            }
            _ => Ok(Self::default()),
        }
    }

    /// The allowlist to enforce, if strict mode is on.
    #[must_use]
    pub fn strict_allowlist(&self) -> Option<&StrictAllowlist> {
        self.strict_mode.then_some(&self.allowlist)
    }

    /// Applier options derived from these settings.
    #[must_use]
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            invariants: self.invariants.clone(),
            conflict_policy: self.conflict_policy.clone(),
            ledger_cap: self.ledger_cap,
        }
    }
}
