//! Failure prediction from anomaly history, trend and weather.
//!
//! ```text
//! base_risk          = min(anomaly_count / 10, 1)
//! weather_multiplier = 1.5 if condition is rain or thunderstorm, else 1.0
//! trend_multiplier   = 1.2 if trend is increasing, else 1.0
//! probability        = min(base_risk * weather_multiplier * trend_multiplier, 1)
//! ```
//!
//! A probability above 0.7 means high urgency and an ETA 1-4 days out,
//! otherwise low urgency and an ETA 7-37 days out.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Recent anomaly trend of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Stable,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increasing => "increasing",
            Self::Stable => "stable",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorical weather condition, parsed case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeatherCondition {
    Clear,
    Clouds,
    Drizzle,
    Rain,
    Thunderstorm,
    Snow,
    Mist,
    /// Fallback when no lookup was possible.
    Neutral,
    Other(String),
}

impl WeatherCondition {
    /// Rain or thunderstorm, and nothing else.
    pub fn is_adverse(&self) -> bool {
        matches!(self, Self::Rain | Self::Thunderstorm)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Clear => "clear",
            Self::Clouds => "clouds",
            Self::Drizzle => "drizzle",
            Self::Rain => "rain",
            Self::Thunderstorm => "thunderstorm",
            Self::Snow => "snow",
            Self::Mist => "mist",
            Self::Neutral => "neutral",
            Self::Other(s) => s,
        }
    }
}

impl FromStr for WeatherCondition {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Ok(match lower.as_str() {
            "clear" => Self::Clear,
            "clouds" | "cloudy" => Self::Clouds,
            "drizzle" => Self::Drizzle,
            "rain" => Self::Rain,
            "thunderstorm" => Self::Thunderstorm,
            "snow" => Self::Snow,
            "mist" | "fog" | "haze" => Self::Mist,
            "neutral" | "" => Self::Neutral,
            _ => Self::Other(lower),
        })
    }
}

impl fmt::Display for WeatherCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environmental reading at the device location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub temperature: f64,
    pub humidity: f64,
    pub condition: WeatherCondition,
}

impl Environment {
    /// Neutral environment used whenever a weather lookup is unavailable.
    pub fn neutral() -> Self {
        Self {
            temperature: 20.0,
            humidity: 50.0,
            condition: WeatherCondition::Neutral,
        }
    }
}

/// Downstream alert urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    Low,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown urgency '{other}'")),
        }
    }
}

/// Summary of a device's recent high-score anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyHistory {
    pub anomaly_count: usize,
    pub trend: Trend,
}

/// Prediction tuning, typically parsed from the `[prediction]` TOML section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Only anomalies scoring above this count towards history.
    #[serde(default = "default_high_score")]
    pub high_score: f64,
    /// More than this many high-score anomalies = increasing trend.
    #[serde(default = "default_trend_count")]
    pub trend_count: usize,
    /// How far back anomaly history is read.
    #[serde(default = "default_history_window_hours")]
    pub history_window_hours: i64,
    /// Maximum anomaly rows read per prediction.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_adverse_multiplier")]
    pub adverse_weather_multiplier: f64,
    #[serde(default = "default_trend_multiplier")]
    pub increasing_trend_multiplier: f64,
    /// Probability strictly above this = high urgency.
    #[serde(default = "default_urgency_threshold")]
    pub urgency_threshold: f64,
}

fn default_high_score() -> f64 { 0.5 }
fn default_trend_count() -> usize { 3 }
fn default_history_window_hours() -> i64 { 24 }
fn default_history_limit() -> usize { 10 }
fn default_adverse_multiplier() -> f64 { 1.5 }
fn default_trend_multiplier() -> f64 { 1.2 }
fn default_urgency_threshold() -> f64 { 0.7 }

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            high_score: default_high_score(),
            trend_count: default_trend_count(),
            history_window_hours: default_history_window_hours(),
            history_limit: default_history_limit(),
            adverse_weather_multiplier: default_adverse_multiplier(),
            increasing_trend_multiplier: default_trend_multiplier(),
            urgency_threshold: default_urgency_threshold(),
        }
    }
}

/// A failure forecast for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub failure_probability: f64,
    pub predicted_eta: DateTime<Utc>,
    pub urgency: Urgency,
    pub risk_factors: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionEngine {
    config: PredictionConfig,
}

impl PredictionEngine {
    pub fn new(config: PredictionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Build history from raw anomaly scores, counting only high scores.
    pub fn history_from_scores(&self, scores: &[f64]) -> AnomalyHistory {
        let anomaly_count = scores
            .iter()
            .filter(|s| **s > self.config.high_score)
            .count();
        AnomalyHistory {
            anomaly_count,
            trend: self.classify_trend(anomaly_count),
        }
    }

    pub fn classify_trend(&self, anomaly_count: usize) -> Trend {
        if anomaly_count > self.config.trend_count {
            Trend::Increasing
        } else {
            Trend::Stable
        }
    }

    /// Failure probability and the factors that produced it.
    pub fn failure_probability(
        &self,
        history: &AnomalyHistory,
        env: &Environment,
    ) -> (f64, BTreeMap<String, f64>) {
        let base_risk = (history.anomaly_count as f64 / 10.0).min(1.0);
        let weather_multiplier = if env.condition.is_adverse() {
            self.config.adverse_weather_multiplier
        } else {
            1.0
        };
        let trend_multiplier = match history.trend {
            Trend::Increasing => self.config.increasing_trend_multiplier,
            Trend::Stable => 1.0,
        };
        let probability = (base_risk * weather_multiplier * trend_multiplier).min(1.0);

        let factors = BTreeMap::from([
            ("anomaly_count".to_string(), history.anomaly_count as f64),
            ("base_risk".to_string(), base_risk),
            ("weather_multiplier".to_string(), weather_multiplier),
            ("trend_multiplier".to_string(), trend_multiplier),
            ("ambient_temperature".to_string(), env.temperature),
            ("ambient_humidity".to_string(), env.humidity),
        ]);
        (probability, factors)
    }

    pub fn urgency_for(&self, probability: f64) -> Urgency {
        if probability > self.config.urgency_threshold {
            Urgency::High
        } else {
            Urgency::Low
        }
    }

    /// Full prediction, drawing the ETA from `rng` relative to `now`.
    pub fn predict<R: Rng + ?Sized>(
        &self,
        history: &AnomalyHistory,
        env: &Environment,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Prediction {
        let (failure_probability, risk_factors) = self.failure_probability(history, env);
        let urgency = self.urgency_for(failure_probability);
        let days = match urgency {
            Urgency::High => rng.gen_range(1.0..4.0),
            Urgency::Low => rng.gen_range(7.0..37.0),
        };
        let predicted_eta = now + Duration::milliseconds((days * MILLIS_PER_DAY) as i64);

        tracing::debug!(
            probability = failure_probability,
            urgency = %urgency,
            eta = %predicted_eta,
            "failure prediction computed"
        );

        Prediction {
            failure_probability,
            predicted_eta,
            urgency,
            risk_factors,
        }
    }
}
