//! Alerts service.
//!
//! `escalate_alert` records an alert for every maintenance notice and anomaly
//! detection and escalates the high-urgency ones; `log_escalation` reports
//! escalations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use vitals_compute::{PredictionEngine, Urgency};
use vitals_flow::{
    Context, ContextSchema, FieldKind, FlowError, Routine, Task, TaskHandler, TaskScope,
};
use vitals_signal::{payload, topics};

use super::{db_failure, record_from, Collaborators};
use crate::db::{self, Database};

pub fn escalate_alert(deps: &Collaborators) -> Result<Routine, FlowError> {
    let mut b = Routine::builder("escalate_alert");
    b.trigger(topics::MAINTENANCE_NEEDED)
        .trigger(topics::ANOMALY_DETECTED);
    b.task(
        Task::new(
            "record_alert",
            RecordAlert {
                db: Arc::clone(&deps.db),
                engine: Arc::clone(&deps.engine),
            },
        )
        .describe("store an alert and escalate it when urgent")
        .expects(
            ContextSchema::new()
                .require("device_id", FieldKind::String)
                .optional("urgency", FieldKind::String)
                .optional("anomaly_score", FieldKind::Number),
        ),
    );
    b.build()
}

pub fn log_escalation() -> Result<Routine, FlowError> {
    let mut b = Routine::builder("log_escalation");
    b.trigger(topics::ALERT_ESCALATION);
    b.task(
        Task::from_fn("log_escalation", |ctx: Context, _scope: TaskScope| async move {
            warn!(
                device_id = %ctx.str("device_id")?,
                kind = %ctx.str("kind").unwrap_or("unknown"),
                alert_id = %ctx.str("alert_id").unwrap_or("-"),
                "alert escalated"
            );
            Ok::<_, FlowError>(ctx)
        })
        .describe("report an escalated alert"),
    );
    b.build()
}

struct RecordAlert {
    db: Arc<dyn Database>,
    engine: Arc<PredictionEngine>,
}

impl RecordAlert {
    /// Maintenance notices carry their urgency; anomalies are graded by score.
    fn classify(&self, ctx: &Context) -> Result<(&'static str, Urgency), FlowError> {
        if ctx.is_set("urgency") {
            let urgency = ctx
                .str("urgency")?
                .parse::<Urgency>()
                .map_err(FlowError::validation)?;
            Ok(("maintenance", urgency))
        } else {
            let score = ctx.f64("anomaly_score")?;
            Ok(("anomaly", self.engine.urgency_for(score)))
        }
    }
}

#[async_trait]
impl TaskHandler for RecordAlert {
    async fn handle(&self, mut ctx: Context, scope: &TaskScope) -> Result<Context, FlowError> {
        let (kind, urgency) = self.classify(&ctx)?;
        ctx.insert("kind", kind);
        ctx.insert("urgency", urgency.as_str());

        let row = record_from(
            &ctx,
            &["device_id", "kind", "urgency", "failure_probability", "anomaly_score", "reason"],
        );
        let stored = self
            .db
            .insert(db::ALERTS, row)
            .await
            .map_err(|e| db_failure(scope, e))?;
        let alert_id = stored
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        ctx.insert("alert_id", alert_id.as_str());

        let escalated = urgency == Urgency::High;
        ctx.insert("escalated", escalated);
        if escalated {
            scope.emit(
                topics::ALERT_ESCALATION,
                payload! {
                    "device_id" => ctx.str("device_id")?,
                    "kind" => kind,
                    "urgency" => urgency,
                    "alert_id" => alert_id,
                },
            );
        } else {
            debug!(device_id = %ctx.str("device_id")?, kind, "alert recorded");
        }
        Ok(ctx)
    }
}
