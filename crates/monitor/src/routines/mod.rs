//! Routines of the monitoring services.
//!
//! - `telemetry`: `ingest_telemetry`
//! - `anomaly`: `score_reading` (deputy entry point)
//! - `predictor`: `predict_failure`
//! - `alerts`: `escalate_alert`, `log_escalation`

pub mod alerts;
pub mod anomaly;
pub mod predictor;
pub mod telemetry;

use std::sync::Arc;

use serde_json::Value;

use vitals_compute::{AnomalyScorer, PredictionEngine, Urgency};
use vitals_flow::{Context, FlowError, TaskScope};

use crate::config::MonitorSettings;
use crate::db::{Database, DbError, Record};
use crate::weather::WeatherLookup;

pub const RUNNER: &str = "runner";
pub const TELEMETRY: &str = "telemetry";
pub const ANOMALY: &str = "anomaly";
pub const PREDICTOR: &str = "predictor";
pub const ALERTS: &str = "alerts";

/// Deputy entry point exposed by the anomaly service.
pub const SCORE_READING: &str = "score_reading";

/// Everything task handlers reach outside the context.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub db: Arc<dyn Database>,
    pub weather: Arc<dyn WeatherLookup>,
    pub scorer: Arc<AnomalyScorer>,
    pub engine: Arc<PredictionEngine>,
}

impl Collaborators {
    pub fn new(
        settings: &MonitorSettings,
        db: Arc<dyn Database>,
        weather: Arc<dyn WeatherLookup>,
    ) -> Self {
        Self {
            db,
            weather,
            scorer: Arc::new(AnomalyScorer::new(settings.anomaly.clone())),
            engine: Arc::new(PredictionEngine::new(settings.prediction.clone())),
        }
    }
}

/// Services notified of a maintenance need at each urgency.
pub fn urgency_targets(urgency: Urgency) -> &'static [&'static str] {
    match urgency {
        Urgency::High => &[ALERTS, TELEMETRY],
        Urgency::Low => &[TELEMETRY],
    }
}

/// A storage failure as the failure of the task that hit it.
fn db_failure(scope: &TaskScope, error: DbError) -> FlowError {
    FlowError::task(scope.task(), error.to_string())
}

/// Copy `keys` that are set in `ctx` into a new record.
fn record_from(ctx: &Context, keys: &[&str]) -> Record {
    keys.iter()
        .filter_map(|k| ctx.get(k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

fn number_column(rows: &[Record], column: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|r| r.get(column).and_then(Value::as_f64))
        .collect()
}
