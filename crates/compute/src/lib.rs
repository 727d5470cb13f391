//! Statistical scoring for device telemetry.
//!
//! - [`anomaly`]: per-metric z-score scoring and the aggregate anomaly flag
//! - [`prediction`]: failure probability and ETA from anomaly history and weather

pub mod anomaly;
pub mod prediction;

pub use anomaly::{AggregateScore, AnomalyConfig, AnomalyResult, AnomalyScorer};
pub use prediction::{
    AnomalyHistory, Environment, Prediction, PredictionConfig, PredictionEngine, Trend, Urgency,
    WeatherCondition,
};
