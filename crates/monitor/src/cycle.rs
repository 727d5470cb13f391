//! Per-device monitoring cycle.
//!
//! ```text
//! IDLE → VALIDATING → FILTERING → DELEGATED_ANOMALY_CHECK
//!      → {TEMP_CHECK ‖ HUMIDITY_CHECK} → JOINING → SCORED
//!      → [PREDICTING → {HISTORY_FETCH ‖ WEATHER_FETCH} → JOINING → PREDICTED]
//!      → PERSISTED → IDLE
//! ```
//!
//! Validation failure ends the cycle in `REJECTED`. A scheduled health
//! check enters prediction straight from `IDLE`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use vitals_flow::{Context, FlowError};

/// Context key holding the current state.
pub const STAGE_KEY: &str = "stage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    Idle,
    Validating,
    Filtering,
    DelegatedAnomalyCheck,
    TempCheck,
    HumidityCheck,
    Joining,
    Scored,
    Predicting,
    HistoryFetch,
    WeatherFetch,
    Predicted,
    Persisted,
    Rejected,
}

impl CycleState {
    pub const ALL: [CycleState; 14] = [
        Self::Idle,
        Self::Validating,
        Self::Filtering,
        Self::DelegatedAnomalyCheck,
        Self::TempCheck,
        Self::HumidityCheck,
        Self::Joining,
        Self::Scored,
        Self::Predicting,
        Self::HistoryFetch,
        Self::WeatherFetch,
        Self::Predicted,
        Self::Persisted,
        Self::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Validating => "VALIDATING",
            Self::Filtering => "FILTERING",
            Self::DelegatedAnomalyCheck => "DELEGATED_ANOMALY_CHECK",
            Self::TempCheck => "TEMP_CHECK",
            Self::HumidityCheck => "HUMIDITY_CHECK",
            Self::Joining => "JOINING",
            Self::Scored => "SCORED",
            Self::Predicting => "PREDICTING",
            Self::HistoryFetch => "HISTORY_FETCH",
            Self::WeatherFetch => "WEATHER_FETCH",
            Self::Predicted => "PREDICTED",
            Self::Persisted => "PERSISTED",
            Self::Rejected => "REJECTED",
        }
    }

    /// States reachable in one step.
    pub fn successors(self) -> &'static [CycleState] {
        use CycleState::*;
        match self {
            Idle => &[Validating, Predicting],
            Validating => &[Filtering, Rejected],
            Filtering => &[DelegatedAnomalyCheck, Rejected],
            DelegatedAnomalyCheck => &[TempCheck, HumidityCheck],
            TempCheck | HumidityCheck => &[Joining],
            Joining => &[Scored, Predicted],
            Scored => &[Predicting, Persisted],
            Predicting => &[HistoryFetch, WeatherFetch, Rejected],
            HistoryFetch | WeatherFetch => &[Joining],
            Predicted => &[Persisted],
            Persisted => &[Idle],
            Rejected => &[],
        }
    }

    pub fn can_transition(self, to: CycleState) -> bool {
        self.successors().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Checked step from `from` to `to`.
    pub fn transition(from: CycleState, to: CycleState) -> Result<CycleState, FlowError> {
        if from.can_transition(to) {
            Ok(to)
        } else {
            Err(FlowError::Validation(format!(
                "illegal cycle transition {from} -> {to}"
            )))
        }
    }

    /// State recorded in `ctx`; a context without one is `IDLE`.
    pub fn of(ctx: &Context) -> Result<CycleState, FlowError> {
        match ctx.get(STAGE_KEY).and_then(|v| v.as_str()) {
            Some(s) => s.parse(),
            None => Ok(Self::Idle),
        }
    }

    /// Move `ctx` to `to`, checking the step from its current state.
    pub fn advance(ctx: &mut Context, to: CycleState) -> Result<(), FlowError> {
        let next = Self::transition(Self::of(ctx)?, to)?;
        ctx.insert(STAGE_KEY, next.as_str());
        Ok(())
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleState {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FlowError::Validation(format!("unknown cycle stage '{s}'")))
    }
}
