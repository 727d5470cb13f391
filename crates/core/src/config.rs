use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VitalsError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub traffic: TrafficConfig,
    pub weather: WeatherConfig,
    /// Path to the TOML flow config (joins, deputies, scoring thresholds).
    pub flow_config_path: PathBuf,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `VITALS_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("VITALS_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            traffic: TrafficConfig::from_env_profiled(p),
            weather: WeatherConfig::from_env_profiled(p),
            flow_config_path: PathBuf::from(profiled_env_or(
                p,
                "VITALS_FLOW_CONFIG",
                "config/vitals.toml",
            )),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  traffic:  intensity={}, devices={}, telemetry_every={}ms, health_check_every={}ms",
            self.traffic.intensity,
            self.traffic.device_count,
            self.traffic.telemetry_interval_ms,
            self.traffic.health_check_interval_ms
        );
        tracing::info!(
            "  weather:  url={}, credential={}",
            self.weather.base_url,
            if self.weather.is_configured() { "set" } else { "(none, neutral fallback)" }
        );
        tracing::info!("  flow:     {}", self.flow_config_path.display());
    }

    /// Return a redacted view safe for status output (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "traffic": {
                "intensity": self.traffic.intensity.to_string(),
                "device_count": self.traffic.device_count,
                "telemetry_interval_ms": self.traffic.telemetry_interval_ms,
                "health_check_interval_ms": self.traffic.health_check_interval_ms,
            },
            "weather": {
                "base_url": self.weather.base_url,
                "configured": self.weather.is_configured(),
            },
            "flow_config_path": self.flow_config_path,
        })
    }
}

// ── Traffic ───────────────────────────────────────────────────

/// Traffic-intensity selector for the mock telemetry runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficIntensity {
    #[default]
    Low,
    High,
}

impl TrafficIntensity {
    /// Probability that a generated reading is pushed off its baseline.
    pub fn anomaly_bias(self) -> f64 {
        match self {
            Self::Low => 0.05,
            Self::High => 0.3,
        }
    }

    pub fn default_telemetry_interval_ms(self) -> u64 {
        match self {
            Self::Low => 5000,
            Self::High => 1000,
        }
    }
}

impl FromStr for TrafficIntensity {
    type Err = VitalsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "high" => Ok(Self::High),
            other => Err(VitalsError::Config(format!(
                "invalid traffic intensity '{other}', expected 'low' or 'high'"
            ))),
        }
    }
}

impl fmt::Display for TrafficIntensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::High => f.write_str("high"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    pub intensity: TrafficIntensity,
    /// Size of the device identifier space (`device-001` .. `device-NNN`).
    pub device_count: u32,
    pub telemetry_interval_ms: u64,
    pub health_check_interval_ms: u64,
}

impl TrafficConfig {
    fn from_env_profiled(p: &str) -> Self {
        let raw = profiled_env_or(p, "TRAFFIC_INTENSITY", "low");
        let intensity = raw.parse().unwrap_or_else(|e| {
            tracing::warn!("{e}, falling back to 'low'");
            TrafficIntensity::Low
        });
        Self {
            intensity,
            device_count: profiled_env_u32(p, "DEVICE_COUNT", 10).max(1),
            telemetry_interval_ms: profiled_env_u64(
                p,
                "TELEMETRY_INTERVAL_MS",
                intensity.default_telemetry_interval_ms(),
            ),
            health_check_interval_ms: profiled_env_u64(p, "HEALTH_CHECK_INTERVAL_MS", 30_000),
        }
    }

    /// Override the intensity, resetting the telemetry interval to that intensity's default.
    pub fn with_intensity(mut self, intensity: TrafficIntensity) -> Self {
        self.intensity = intensity;
        self.telemetry_interval_ms = intensity.default_telemetry_interval_ms();
        self
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            intensity: TrafficIntensity::Low,
            device_count: 10,
            telemetry_interval_ms: TrafficIntensity::Low.default_telemetry_interval_ms(),
            health_check_interval_ms: 30_000,
        }
    }
}

// ── Weather ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl WeatherConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            api_key: profiled_env_opt(p, "WEATHER_API_KEY"),
            base_url: profiled_env_or(
                p,
                "WEATHER_BASE_URL",
                "https://api.openweathermap.org/data/2.5/weather",
            ),
            timeout_secs: profiled_env_u64(p, "WEATHER_TIMEOUT_SECS", 5),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            timeout_secs: 5,
        }
    }
}
