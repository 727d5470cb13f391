use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::join::TimeoutAction;

// ── Top-level config ────────────────────────────────────────────────

/// Execution settings shared by every service in the process.
///
/// Parsed from the `[join]` and `[deputy]` sections of `vitals.toml`.
/// Other sections are ignored so the same file can carry settings for
/// the services themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub join: JoinConfig,

    #[serde(default)]
    pub deputy: DeputyConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Join section: what to do with fan-in that never completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Milliseconds a join waits for its remaining branches. Absent means
    /// wait indefinitely.
    pub timeout_ms: Option<u64>,

    /// Applied when the timeout expires.
    #[serde(default)]
    pub on_timeout: TimeoutAction,
}

/// Deputy section: concurrency ceilings for delegated tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeputyConfig {
    /// Limit for requests that do not set one.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Per-pair overrides keyed by `"<service>.<task>"`.
    #[serde(default)]
    pub limits: HashMap<String, usize>,
}

fn default_limit() -> usize {
    4
}

impl Default for DeputyConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            limits: HashMap::new(),
        }
    }
}
