//! Per-metric z-score anomaly scoring.
//!
//! For a window of recent samples and a new reading:
//! `z = |reading - mean| / population_stddev`, `score = min(z / 3, 1)`,
//! anomalous when `z > 2`. The per-metric scores of one reading are averaged
//! into an aggregate, which is anomalous only when strictly above 0.7.

use serde::{Deserialize, Serialize};

/// Tolerance for threshold comparisons on averaged scores.
const SCORE_EPSILON: f64 = 1e-9;

/// Outcome of scoring one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub metric: String,
    /// Normalised score in `[0, 1]`.
    pub score: f64,
    pub anomalous: bool,
    pub reason: String,
    /// `None` when the window was too short or had no spread.
    pub z_score: Option<f64>,
    pub sample_count: usize,
}

/// Thresholds for anomaly scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Number of most recent samples per metric.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// |z| above this marks a single metric anomalous.
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    /// z value that maps to a score of 1.0.
    #[serde(default = "default_score_scale")]
    pub score_scale: f64,
    /// Aggregate score must be strictly above this to flag the reading.
    #[serde(default = "default_aggregate_threshold")]
    pub aggregate_threshold: f64,
}

fn default_window_size() -> usize { 20 }
fn default_z_threshold() -> f64 { 2.0 }
fn default_score_scale() -> f64 { 3.0 }
fn default_aggregate_threshold() -> f64 { 0.7 }

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            z_threshold: default_z_threshold(),
            score_scale: default_score_scale(),
            aggregate_threshold: default_aggregate_threshold(),
        }
    }
}

/// Combined score across the metrics of one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateScore {
    pub score: f64,
    pub anomalous: bool,
    pub metrics: Vec<AnomalyResult>,
}

/// Stateless scorer; history is supplied by the caller on every call.
#[derive(Debug, Clone, Default)]
pub struct AnomalyScorer {
    config: AnomalyConfig,
}

impl AnomalyScorer {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// How many recent samples callers should fetch per metric.
    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    /// Score `reading` against `history` (most recent samples, any order).
    ///
    /// Only the last `window_size` samples are used.
    pub fn score(&self, metric: &str, history: &[f64], reading: f64) -> AnomalyResult {
        let start = history.len().saturating_sub(self.config.window_size);
        let window = &history[start..];

        if window.len() < 2 {
            return AnomalyResult {
                metric: metric.to_string(),
                score: 0.0,
                anomalous: false,
                reason: "insufficient data".to_string(),
                z_score: None,
                sample_count: window.len(),
            };
        }

        let m = mean(window);
        let s = population_stddev(window);

        if s <= f64::EPSILON {
            // Constant baseline: any deviation is maximal.
            let deviates = (reading - m).abs() > f64::EPSILON;
            return AnomalyResult {
                metric: metric.to_string(),
                score: if deviates { 1.0 } else { 0.0 },
                anomalous: deviates,
                reason: if deviates {
                    format!("deviation from constant baseline {m:.2}")
                } else {
                    "constant baseline".to_string()
                },
                z_score: None,
                sample_count: window.len(),
            };
        }

        let z = (reading - m).abs() / s;
        let score = (z / self.config.score_scale).min(1.0);
        let anomalous = z > self.config.z_threshold;
        let reason = if anomalous {
            format!(
                "{metric} {reading:.2} is {z:.2} standard deviations from mean {m:.2}"
            )
        } else {
            format!("{metric} within normal range (z={z:.2})")
        };

        AnomalyResult {
            metric: metric.to_string(),
            score,
            anomalous,
            reason,
            z_score: Some(z),
            sample_count: window.len(),
        }
    }

    /// Average the per-metric scores. An empty slice scores 0.
    pub fn aggregate(&self, results: &[AnomalyResult]) -> AggregateScore {
        let score = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64
        };
        AggregateScore {
            score,
            anomalous: score - self.config.aggregate_threshold > SCORE_EPSILON,
            metrics: results.to_vec(),
        }
    }
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by `n`); 0 for fewer than two values.
pub fn population_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
