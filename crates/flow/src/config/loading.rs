use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::deputy::DeputyLimits;
use crate::error::FlowError;
use crate::join::{JoinPolicy, TimeoutAction};

use super::types::FlowConfig;

impl FlowConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, FlowError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load from `path` if it exists, otherwise use defaults (still subject
    /// to environment overrides).
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        if path.exists() {
            info!(path = %path.display(), "loading flow config");
            Self::from_file(path)
        } else {
            info!(path = %path.display(), "flow config not found, using defaults");
            Self::from_toml("")
        }
    }

    pub fn join_policy(&self) -> JoinPolicy {
        JoinPolicy {
            timeout: self.join.timeout_ms.map(Duration::from_millis),
            on_timeout: self.join.on_timeout,
        }
    }

    pub fn deputy_limits(&self) -> DeputyLimits {
        DeputyLimits {
            default_limit: self.deputy.default_limit,
            overrides: self.deputy.limits.clone(),
        }
    }

    /// Effective limit for a `(service, task)` pair that sets none itself.
    pub fn limit_for(&self, service: &str, task: &str) -> usize {
        self.deputy
            .limits
            .get(&format!("{service}.{task}"))
            .copied()
            .unwrap_or(self.deputy.default_limit)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `VITALS_JOIN_TIMEOUT_MS` → `join.timeout_ms` (`0` or `none` clears it)
    /// - `VITALS_JOIN_ON_TIMEOUT` → `join.on_timeout`
    /// - `VITALS_DEPUTY_DEFAULT_LIMIT` → `deputy.default_limit`
    pub(crate) fn apply_env_overrides(&mut self) -> Result<(), FlowError> {
        if let Ok(v) = std::env::var("VITALS_JOIN_TIMEOUT_MS") {
            self.join.timeout_ms = match v.trim() {
                "" | "none" | "0" => None,
                ms => Some(ms.parse().map_err(|_| {
                    FlowError::Config(format!("VITALS_JOIN_TIMEOUT_MS must be milliseconds, got '{ms}'"))
                })?),
            };
        }
        if let Ok(v) = std::env::var("VITALS_JOIN_ON_TIMEOUT") {
            self.join.on_timeout = match v.trim() {
                "abandon" => TimeoutAction::Abandon,
                "fire_partial" => TimeoutAction::FirePartial,
                other => {
                    return Err(FlowError::Config(format!(
                        "invalid VITALS_JOIN_ON_TIMEOUT '{other}', expected 'abandon' or 'fire_partial'"
                    )));
                }
            };
        }
        if let Ok(v) = std::env::var("VITALS_DEPUTY_DEFAULT_LIMIT") {
            if let Ok(limit) = v.trim().parse::<usize>() {
                self.deputy.default_limit = limit;
            }
        }
        Ok(())
    }
}
