//! Predictor service: `predict_failure` on anomaly detections and health checks.
//!
//! `validate_request → {fetch_history ‖ fetch_weather} → compute_prediction → persist_prediction`

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, info};

use vitals_compute::{AnomalyHistory, Environment, Prediction, PredictionEngine};
use vitals_flow::{
    Context, ContextSchema, FieldKind, FlowError, MergeRule, Routine, Task, TaskHandler,
    TaskScope, JOIN_PARTIAL_KEY,
};
use vitals_signal::{payload, topics};

use super::{db_failure, number_column, record_from, urgency_targets, Collaborators};
use crate::cycle::CycleState;
use crate::db::{self, timestamp, Query, SortOrder, CREATED_AT};

pub fn predict_failure(deps: &Collaborators) -> Result<Routine, FlowError> {
    let mut b = Routine::builder("predict_failure");
    b.trigger(topics::ANOMALY_DETECTED)
        .trigger(topics::HEALTH_CHECK_TRIGGERED);

    let validate = b.task(
        Task::from_fn("validate_request", validate_request)
            .describe("check the device id and location")
            .expects(
                ContextSchema::new()
                    .require("device_id", FieldKind::String)
                    .require("latitude", FieldKind::Number)
                    .require("longitude", FieldKind::Number),
            ),
    );
    let history = b.task(
        Task::new("fetch_history", FetchHistory { deps: deps.clone() })
            .describe("count recent high-score anomalies"),
    );
    let weather = b.task(
        Task::new("fetch_weather", FetchWeather { deps: deps.clone() })
            .describe("look up weather at the device location"),
    );
    let compute = b.unique(
        Task::new(
            "compute_prediction",
            ComputePrediction {
                engine: Arc::clone(&deps.engine),
            },
        )
        .describe("combine history and weather into a failure forecast"),
        MergeRule::first_non_null()
            .owner("history", "fetch_history")
            .owner("environment", "fetch_weather"),
    );
    let persist = b.task(
        Task::new("persist_prediction", PersistPrediction { deps: deps.clone() })
            .describe("store the forecast and notify by urgency"),
    );

    b.fan_out(validate, &[history, weather])
        .fan_in(&[history, weather], compute)
        .then(compute, persist);
    b.build()
}

async fn validate_request(mut ctx: Context, _scope: TaskScope) -> Result<Context, FlowError> {
    CycleState::advance(&mut ctx, CycleState::Predicting)?;
    if ctx.str("device_id")?.trim().is_empty() {
        return Err(FlowError::validation("device_id is empty"));
    }
    let latitude = ctx.f64("latitude")?;
    let longitude = ctx.f64("longitude")?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(FlowError::validation(format!(
            "location ({latitude}, {longitude}) is not a coordinate"
        )));
    }
    Ok(ctx)
}

struct FetchHistory {
    deps: Collaborators,
}

#[async_trait]
impl TaskHandler for FetchHistory {
    async fn handle(&self, mut ctx: Context, scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, CycleState::HistoryFetch)?;
        let config = self.deps.engine.config();
        let since = Utc::now() - Duration::hours(config.history_window_hours);

        let query = Query::new()
            .eq("device_id", ctx.str("device_id")?)
            .since(CREATED_AT, since)
            .sort(CREATED_AT, SortOrder::Descending)
            .limit(config.history_limit);
        let rows = self
            .deps
            .db
            .query(db::ANOMALIES, &query)
            .await
            .map_err(|e| db_failure(scope, e))?;

        let history = self
            .deps
            .engine
            .history_from_scores(&number_column(&rows, "score"));
        ctx.put("history", &history)?;
        ctx.insert("history_samples", rows.len());
        Ok(ctx)
    }
}

struct FetchWeather {
    deps: Collaborators,
}

#[async_trait]
impl TaskHandler for FetchWeather {
    async fn handle(&self, mut ctx: Context, _scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, CycleState::WeatherFetch)?;
        let env = self
            .deps
            .weather
            .lookup(ctx.f64("latitude")?, ctx.f64("longitude")?)
            .await;
        ctx.put("environment", &env)?;
        Ok(ctx)
    }
}

struct ComputePrediction {
    engine: Arc<PredictionEngine>,
}

#[async_trait]
impl TaskHandler for ComputePrediction {
    async fn handle(&self, mut ctx: Context, _scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, CycleState::Joining)?;

        // Partial joins fall back to an empty history or a neutral environment.
        let partial = ctx.is_set(JOIN_PARTIAL_KEY);
        let history: AnomalyHistory = match ctx.field("history") {
            Ok(h) => h,
            Err(_) if partial => self.engine.history_from_scores(&[]),
            Err(e) => return Err(e.into()),
        };
        let env: Environment = match ctx.field("environment") {
            Ok(env) => env,
            Err(_) if partial => Environment::neutral(),
            Err(e) => return Err(e.into()),
        };

        let prediction = self
            .engine
            .predict(&history, &env, Utc::now(), &mut rand::thread_rng());
        ctx.insert("failure_probability", prediction.failure_probability);
        ctx.insert("urgency", prediction.urgency.as_str());
        ctx.put("prediction", &prediction)?;
        CycleState::advance(&mut ctx, CycleState::Predicted)?;
        Ok(ctx)
    }
}

struct PersistPrediction {
    deps: Collaborators,
}

#[async_trait]
impl TaskHandler for PersistPrediction {
    async fn handle(&self, mut ctx: Context, scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, CycleState::Persisted)?;
        let prediction: Prediction = ctx.field("prediction")?;
        let device_id = ctx.str("device_id")?.to_string();

        let mut row = record_from(&ctx, &["device_id", "failure_probability", "urgency"]);
        row.insert(
            "predicted_eta".to_string(),
            timestamp(prediction.predicted_eta).into(),
        );
        row.insert(
            "risk_factors".to_string(),
            serde_json::to_value(&prediction.risk_factors)
                .map_err(|e| FlowError::task(scope.task(), e.to_string()))?,
        );
        let stored = self
            .deps
            .db
            .insert(db::PREDICTIONS, row)
            .await
            .map_err(|e| db_failure(scope, e))?;
        if let Some(id) = stored.get("id") {
            ctx.insert("prediction_id", id.clone());
        }

        let notice = payload! {
            "device_id" => device_id,
            "failure_probability" => prediction.failure_probability,
            "predicted_eta" => timestamp(prediction.predicted_eta),
            "urgency" => prediction.urgency,
        };
        scope.emit(topics::PREDICTION_READY, notice.clone());
        let targets = urgency_targets(prediction.urgency);
        scope.emit_to(topics::MAINTENANCE_NEEDED, notice, targets.iter().copied());

        if targets.len() > 1 {
            info!(
                device_id = %device_id,
                probability = prediction.failure_probability,
                urgency = %prediction.urgency,
                "maintenance needed"
            );
        } else {
            debug!(device_id = %device_id, probability = prediction.failure_probability, "prediction stored");
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_compute::{PredictionConfig, Trend, WeatherCondition};
    use vitals_flow::RunId;
    use vitals_signal::SignalBus;

    fn scope() -> TaskScope {
        TaskScope::new(
            RunId::new(),
            "predict_failure",
            "compute_prediction",
            Arc::new(SignalBus::new()).emitter("predictor"),
        )
    }

    fn compute() -> ComputePrediction {
        ComputePrediction {
            engine: Arc::new(PredictionEngine::new(PredictionConfig::default())),
        }
    }

    #[tokio::test]
    async fn rainy_increasing_history_is_high_urgency() {
        let mut ctx = Context::new().with("stage", "HISTORY_FETCH");
        ctx.put("history", &AnomalyHistory { anomaly_count: 5, trend: Trend::Increasing })
            .unwrap();
        ctx.put(
            "environment",
            &Environment {
                temperature: 12.0,
                humidity: 90.0,
                condition: WeatherCondition::Rain,
            },
        )
        .unwrap();

        let out = compute().handle(ctx, &scope()).await.unwrap();
        assert!((out.f64("failure_probability").unwrap() - 0.9).abs() < 1e-9);
        assert_eq!(out.str("urgency").unwrap(), "high");
        assert_eq!(out.str("stage").unwrap(), "PREDICTED");

        let prediction: Prediction = out.field("prediction").unwrap();
        let days = (prediction.predicted_eta - Utc::now()).num_hours() as f64 / 24.0;
        assert!((0.9..4.0).contains(&days), "eta {days} days out");
    }

    #[tokio::test]
    async fn partial_join_uses_neutral_weather() {
        let mut ctx = Context::new()
            .with("stage", "HISTORY_FETCH")
            .with(JOIN_PARTIAL_KEY, true);
        ctx.put("history", &AnomalyHistory { anomaly_count: 2, trend: Trend::Stable })
            .unwrap();

        let out = compute().handle(ctx, &scope()).await.unwrap();
        assert!((out.f64("failure_probability").unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(out.str("urgency").unwrap(), "low");
    }

    #[tokio::test]
    async fn missing_history_on_full_join_is_an_error() {
        let mut ctx = Context::new().with("stage", "WEATHER_FETCH");
        ctx.put("environment", &Environment::neutral()).unwrap();
        assert!(compute().handle(ctx, &scope()).await.is_err());
    }

    #[tokio::test]
    async fn request_outside_coordinates_is_rejected() {
        let ctx = Context::new()
            .with("device_id", "device-002")
            .with("latitude", 140.0)
            .with("longitude", 0.0);
        let err = validate_request(ctx, scope()).await.unwrap_err();
        assert!(err.is_validation());
    }
}
