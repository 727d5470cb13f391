use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use vitals_compute::{AnomalyConfig, PredictionConfig};
use vitals_flow::FlowConfig;

use crate::error::MonitorError;

/// Everything `vitals.toml` configures for the monitoring services.
///
/// `[join]` and `[deputy]` are read by [`FlowConfig`] (with its env
/// overrides); `[anomaly]` and `[prediction]` tune the scoring services.
#[derive(Debug, Clone, Default)]
pub struct MonitorSettings {
    pub flow: FlowConfig,
    pub anomaly: AnomalyConfig,
    pub prediction: PredictionConfig,
}

/// The service sections of the file. Flow sections are ignored here.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ServiceSections {
    #[serde(default)]
    anomaly: AnomalyConfig,

    #[serde(default)]
    prediction: PredictionConfig,
}

impl MonitorSettings {
    pub fn from_toml(toml_str: &str) -> Result<Self, MonitorError> {
        let sections: ServiceSections = toml::from_str(toml_str)?;
        let settings = Self {
            flow: FlowConfig::from_toml(toml_str)?,
            anomaly: sections.anomaly,
            prediction: sections.prediction,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load from `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let path = path.as_ref();
        if path.exists() {
            info!(path = %path.display(), "loading monitor settings");
            Self::from_file(path)
        } else {
            info!(path = %path.display(), "settings file not found, using defaults");
            Self::from_toml("")
        }
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        let mut errors = Vec::new();

        let a = &self.anomaly;
        if a.window_size == 0 {
            errors.push("anomaly.window_size must be at least 1".to_string());
        }
        if a.z_threshold <= 0.0 {
            errors.push(format!("anomaly.z_threshold must be positive, got {}", a.z_threshold));
        }
        if a.score_scale <= 0.0 {
            errors.push(format!("anomaly.score_scale must be positive, got {}", a.score_scale));
        }
        if !(0.0..=1.0).contains(&a.aggregate_threshold) {
            errors.push(format!(
                "anomaly.aggregate_threshold must be within [0, 1], got {}",
                a.aggregate_threshold
            ));
        }

        let p = &self.prediction;
        if p.history_limit == 0 {
            errors.push("prediction.history_limit must be at least 1".to_string());
        }
        if p.history_window_hours <= 0 {
            errors.push(format!(
                "prediction.history_window_hours must be positive, got {}",
                p.history_window_hours
            ));
        }
        if !(0.0..=1.0).contains(&p.urgency_threshold) {
            errors.push(format!(
                "prediction.urgency_threshold must be within [0, 1], got {}",
                p.urgency_threshold
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::Settings(errors.join("; ")))
        }
    }
}
