//! Telemetry service: `ingest_telemetry` on `runner.new_telemetry`.
//!
//! `validate_reading → filter_reading → delegate_anomaly_check → persist_telemetry`

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use vitals_flow::{
    Context, ContextSchema, DeputyRequest, FieldKind, FlowError, Routine, Task, TaskHandler,
    TaskScope,
};
use vitals_signal::{payload, topics};

use super::{db_failure, record_from, Collaborators, ALERTS, ANOMALY, PREDICTOR, SCORE_READING};
use crate::cycle::{CycleState, STAGE_KEY};
use crate::db;
use crate::telemetry::{HUMIDITY_RANGE, TEMPERATURE_RANGE};

const TELEMETRY_COLUMNS: &[&str] = &[
    "device_id",
    "temperature",
    "humidity",
    "latitude",
    "longitude",
    "recorded_at",
    "anomaly_score",
    "anomalous",
    STAGE_KEY,
];

pub fn reading_schema() -> ContextSchema {
    ContextSchema::new()
        .require("device_id", FieldKind::String)
        .require("temperature", FieldKind::Number)
        .require("humidity", FieldKind::Number)
        .require("latitude", FieldKind::Number)
        .require("longitude", FieldKind::Number)
        .optional("recorded_at", FieldKind::Timestamp)
}

/// Build `ingest_telemetry`. `deputy_limit` 0 takes the configured limit.
pub fn ingest_telemetry(deps: &Collaborators, deputy_limit: usize) -> Result<Routine, FlowError> {
    let mut b = Routine::builder("ingest_telemetry");
    b.trigger(topics::NEW_TELEMETRY);

    let validate = b.task(
        Task::from_fn("validate_reading", validate_reading)
            .describe("check the reading carries a device id and numeric measurements")
            .expects(reading_schema()),
    );
    let filter = b.task(
        Task::from_fn("filter_reading", filter_reading)
            .describe("drop readings outside the sensor's physical range"),
    );
    let delegate = b.task(
        Task::deputy(
            "delegate_anomaly_check",
            DeputyRequest::new(ANOMALY, SCORE_READING, deputy_limit),
        )
        .describe("score the reading on the anomaly service"),
    );
    let persist = b.task(
        Task::new("persist_telemetry", PersistTelemetry { deps: deps.clone() })
            .describe("store the reading and announce anomalies")
            .expects(
                ContextSchema::new()
                    .require("anomaly_score", FieldKind::Number)
                    .require("anomalous", FieldKind::Bool),
            ),
    );
    b.sequence(&[validate, filter, delegate, persist]);
    b.build()
}

async fn validate_reading(mut ctx: Context, _scope: TaskScope) -> Result<Context, FlowError> {
    CycleState::advance(&mut ctx, CycleState::Validating)?;
    let device_id = ctx.str("device_id")?;
    if device_id.trim().is_empty() {
        return Err(FlowError::validation("device_id is empty"));
    }
    for key in ["temperature", "humidity"] {
        let v = ctx.f64(key)?;
        if !v.is_finite() {
            return Err(FlowError::validation(format!("{key} is not a finite number")));
        }
    }
    if !ctx.is_set("recorded_at") {
        ctx.insert("recorded_at", db::timestamp(Utc::now()));
    }
    Ok(ctx)
}

async fn filter_reading(mut ctx: Context, _scope: TaskScope) -> Result<Context, FlowError> {
    CycleState::advance(&mut ctx, CycleState::Filtering)?;
    for (key, (low, high)) in [("temperature", TEMPERATURE_RANGE), ("humidity", HUMIDITY_RANGE)] {
        let v = ctx.f64(key)?;
        if !(low..=high).contains(&v) {
            debug!(device_id = %ctx.str("device_id")?, key, value = v, "reading filtered out");
            return Err(FlowError::validation(format!(
                "{key} {v} outside sensor range [{low}, {high}]"
            )));
        }
    }
    Ok(ctx)
}

struct PersistTelemetry {
    deps: Collaborators,
}

#[async_trait]
impl TaskHandler for PersistTelemetry {
    async fn handle(&self, mut ctx: Context, scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, CycleState::Persisted)?;
        let device_id = ctx.str("device_id")?.to_string();
        let score = ctx.f64("anomaly_score")?;
        let anomalous = ctx.bool("anomalous")?;

        let stored = self
            .deps
            .db
            .insert(db::TELEMETRY, record_from(&ctx, TELEMETRY_COLUMNS))
            .await
            .map_err(|e| db_failure(scope, e))?;
        if let Some(id) = stored.get("id") {
            ctx.insert("telemetry_id", id.clone());
        }

        if anomalous {
            let mut row = record_from(&ctx, &["device_id", "telemetry_id", "anomaly_reason"]);
            row.insert("score".to_string(), score.into());
            self.deps
                .db
                .insert(db::ANOMALIES, row)
                .await
                .map_err(|e| db_failure(scope, e))?;

            scope.emit_to(
                topics::ANOMALY_DETECTED,
                payload! {
                    "device_id" => device_id,
                    "anomaly_score" => score,
                    "reason" => ctx.get("anomaly_reason"),
                    "latitude" => ctx.get("latitude"),
                    "longitude" => ctx.get("longitude"),
                    "telemetry_id" => ctx.get("telemetry_id"),
                },
                [PREDICTOR, ALERTS],
            );
            info!(device_id = %device_id, score, "anomaly detected");
        } else {
            debug!(device_id = %device_id, score, "reading persisted");
        }
        Ok(ctx)
    }
}
