//! Anomaly service: `score_reading`, called by deputy from telemetry.
//!
//! `prepare_window → {check_temperature ‖ check_humidity} → aggregate_scores`

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use vitals_compute::{AnomalyResult, AnomalyScorer};
use vitals_flow::{
    Context, ContextSchema, FieldKind, FlowError, MergeRule, Routine, Task, TaskHandler,
    TaskScope, JOIN_PARTIAL_KEY,
};

use super::{db_failure, number_column, Collaborators};
use crate::cycle::CycleState;
use crate::db::{self, Query, SortOrder, CREATED_AT};

const METRICS: [(&str, CycleState); 2] = [
    ("temperature", CycleState::TempCheck),
    ("humidity", CycleState::HumidityCheck),
];

fn window_key(metric: &str) -> String {
    format!("{metric}_window")
}

fn check_key(metric: &str) -> String {
    format!("{metric}_check")
}

pub fn score_reading(deps: &Collaborators) -> Result<Routine, FlowError> {
    let mut b = Routine::builder("score_reading");

    let prepare = b.task(
        Task::new("prepare_window", PrepareWindow { deps: deps.clone() })
            .describe("load the device's recent samples per metric")
            .expects(
                ContextSchema::new()
                    .require("device_id", FieldKind::String)
                    .require("temperature", FieldKind::Number)
                    .require("humidity", FieldKind::Number),
            ),
    );

    let mut merge = MergeRule::first_non_null();
    let mut checks = Vec::with_capacity(METRICS.len());
    for (metric, stage) in METRICS {
        let task = format!("check_{metric}");
        merge = merge.owner(check_key(metric), task.clone());
        checks.push(b.task(
            Task::new(
                task,
                CheckMetric {
                    metric,
                    stage,
                    scorer: Arc::clone(&deps.scorer),
                },
            )
            .describe(format!("z-score the {metric} reading against its window")),
        ));
    }

    let aggregate = b.unique(
        Task::new(
            "aggregate_scores",
            AggregateScores {
                scorer: Arc::clone(&deps.scorer),
            },
        )
        .describe("average the metric scores and flag the reading"),
        merge,
    );

    b.fan_out(prepare, &checks).fan_in(&checks, aggregate);
    b.build()
}

struct PrepareWindow {
    deps: Collaborators,
}

#[async_trait]
impl TaskHandler for PrepareWindow {
    async fn handle(&self, mut ctx: Context, scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, CycleState::DelegatedAnomalyCheck)?;
        let device_id = ctx.str("device_id")?.to_string();

        // Arrival order: every row has `created_at`, not every device clock is set.
        let query = Query::new()
            .eq("device_id", device_id.as_str())
            .sort(CREATED_AT, SortOrder::Descending)
            .limit(self.deps.scorer.window_size());
        let mut rows = self
            .deps
            .db
            .query(db::TELEMETRY, &query)
            .await
            .map_err(|e| db_failure(scope, e))?;
        rows.reverse();

        for (metric, _) in METRICS {
            ctx.put(&window_key(metric), &number_column(&rows, metric))?;
        }
        debug!(device_id = %device_id, samples = rows.len(), "anomaly window loaded");
        Ok(ctx)
    }
}

struct CheckMetric {
    metric: &'static str,
    stage: CycleState,
    scorer: Arc<AnomalyScorer>,
}

#[async_trait]
impl TaskHandler for CheckMetric {
    async fn handle(&self, mut ctx: Context, _scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, self.stage)?;
        let window: Vec<f64> = ctx.field(&window_key(self.metric))?;
        let reading = ctx.f64(self.metric)?;
        let result = self.scorer.score(self.metric, &window, reading);
        ctx.put(&check_key(self.metric), &result)?;
        Ok(ctx)
    }
}

struct AggregateScores {
    scorer: Arc<AnomalyScorer>,
}

#[async_trait]
impl TaskHandler for AggregateScores {
    async fn handle(&self, mut ctx: Context, scope: &TaskScope) -> Result<Context, FlowError> {
        CycleState::advance(&mut ctx, CycleState::Joining)?;

        // A partial join scores whichever metrics arrived.
        let results: Vec<AnomalyResult> = METRICS
            .iter()
            .filter_map(|(metric, _)| ctx.field(&check_key(metric)).ok())
            .collect();
        if results.is_empty() {
            return Err(FlowError::task(scope.task(), "no metric was scored"));
        }
        if ctx.is_set(JOIN_PARTIAL_KEY) {
            debug!(scored = results.len(), "aggregating a partial join");
        }

        let aggregate = self.scorer.aggregate(&results);
        let reason = results
            .iter()
            .filter(|r| r.anomalous)
            .map(|r| r.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        for (metric, _) in METRICS {
            ctx.remove(&window_key(metric));
        }
        ctx.insert("anomaly_score", aggregate.score);
        ctx.insert("anomalous", aggregate.anomalous);
        ctx.insert(
            "anomaly_reason",
            if reason.is_empty() { "within baseline".to_string() } else { reason },
        );
        CycleState::advance(&mut ctx, CycleState::Scored)?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_flow::RunId;
    use vitals_signal::SignalBus;

    fn scope() -> TaskScope {
        TaskScope::new(
            RunId::new(),
            "score_reading",
            "aggregate_scores",
            Arc::new(SignalBus::new()).emitter("anomaly"),
        )
    }

    fn result(metric: &str, score: f64) -> AnomalyResult {
        AnomalyResult {
            metric: metric.to_string(),
            score,
            anomalous: score >= 1.0,
            reason: format!("{metric} off"),
            z_score: None,
            sample_count: 5,
        }
    }

    #[tokio::test]
    async fn aggregate_at_threshold_is_not_anomalous() {
        let mut ctx = Context::new().with("stage", "TEMP_CHECK");
        ctx.put("temperature_check", &result("temperature", 0.9)).unwrap();
        ctx.put("humidity_check", &result("humidity", 0.5)).unwrap();

        let handler = AggregateScores { scorer: Arc::new(AnomalyScorer::default()) };
        let out = handler.handle(ctx, &scope()).await.unwrap();
        assert!((out.f64("anomaly_score").unwrap() - 0.7).abs() < 1e-9);
        assert!(!out.bool("anomalous").unwrap());
        assert_eq!(out.str("anomaly_reason").unwrap(), "within baseline");
        assert_eq!(out.str("stage").unwrap(), "SCORED");
    }

    #[tokio::test]
    async fn partial_join_scores_what_arrived() {
        let mut ctx = Context::new()
            .with("stage", "HUMIDITY_CHECK")
            .with(JOIN_PARTIAL_KEY, true);
        ctx.put("humidity_check", &result("humidity", 1.0)).unwrap();

        let handler = AggregateScores { scorer: Arc::new(AnomalyScorer::default()) };
        let out = handler.handle(ctx, &scope()).await.unwrap();
        assert_eq!(out.f64("anomaly_score").unwrap(), 1.0);
        assert!(out.bool("anomalous").unwrap());
        assert_eq!(out.str("anomaly_reason").unwrap(), "humidity off");
    }

    #[tokio::test]
    async fn nothing_to_aggregate_fails() {
        let handler = AggregateScores { scorer: Arc::new(AnomalyScorer::default()) };
        let ctx = Context::new().with("stage", "TEMP_CHECK");
        assert!(handler.handle(ctx, &scope()).await.is_err());
    }

    #[tokio::test]
    async fn window_holds_the_newest_samples_oldest_first() {
        use crate::db::{Database, MemoryDatabase};
        use crate::weather::FixedWeather;
        use crate::MonitorSettings;
        use serde_json::json;
        use vitals_compute::Environment;

        let store = Arc::new(MemoryDatabase::default());
        let deps = Collaborators::new(
            &MonitorSettings::default(),
            store.clone(),
            Arc::new(FixedWeather(Environment::neutral())),
        );
        let window = deps.scorer.window_size();
        for n in 0..window + 5 {
            let row = json!({"device_id": "device-009", "temperature": n as f64, "humidity": 50.0});
            let serde_json::Value::Object(row) = row else { unreachable!() };
            store.insert(db::TELEMETRY, row).await.unwrap();
        }
        let other = json!({"device_id": "device-010", "temperature": 99.0, "humidity": 50.0});
        let serde_json::Value::Object(other) = other else { unreachable!() };
        store.insert(db::TELEMETRY, other).await.unwrap();

        let ctx = Context::new()
            .with("stage", "FILTERING")
            .with("device_id", "device-009")
            .with("temperature", 80.0)
            .with("humidity", 50.0);
        let out = PrepareWindow { deps }.handle(ctx, &scope()).await.unwrap();

        let temps: Vec<f64> = out.field("temperature_window").unwrap();
        let expected: Vec<f64> = (5..window + 5).map(|n| n as f64).collect();
        assert_eq!(temps, expected);
        assert_eq!(out.str("stage").unwrap(), "DELEGATED_ANOMALY_CHECK");
    }
}
