//! Signal name constants.
//!
//! Names follow `<emitter>.<event>`, with `global.` reserved for signals that
//! any service may react to. Together with the payload's `device_id` they form
//! the cross-service wire contract.

/// A fresh telemetry reading produced by the runner.
pub const NEW_TELEMETRY: &str = "runner.new_telemetry";

/// Periodic request to re-evaluate a device's failure risk.
pub const HEALTH_CHECK_TRIGGERED: &str = "runner.health_check_triggered";

/// A scored reading crossed the aggregate anomaly threshold.
pub const ANOMALY_DETECTED: &str = "global.telemetry.anomaly_detected";

/// A prediction requires maintenance; carries `urgency` (`high` | `low`).
pub const MAINTENANCE_NEEDED: &str = "predictor.maintenance_needed";

/// A prediction was computed and persisted.
pub const PREDICTION_READY: &str = "predictor.prediction_ready";

/// An alert was escalated to operators.
pub const ALERT_ESCALATION: &str = "health.alert_escalation";

/// Every signal name the monitoring pipeline uses.
pub const ALL: &[&str] = &[
    NEW_TELEMETRY,
    HEALTH_CHECK_TRIGGERED,
    ANOMALY_DETECTED,
    MAINTENANCE_NEEDED,
    PREDICTION_READY,
    ALERT_ESCALATION,
];
