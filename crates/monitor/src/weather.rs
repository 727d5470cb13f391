//! Weather lookup for prediction.
//!
//! A lookup never fails: without a credential, or when the call or the
//! response goes wrong, the caller gets [`Environment::neutral`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use vitals_compute::{Environment, WeatherCondition};
use vitals_core::WeatherConfig;

#[async_trait]
pub trait WeatherLookup: Send + Sync + std::fmt::Debug {
    async fn lookup(&self, latitude: f64, longitude: f64) -> Environment;
}

#[derive(Debug, Error)]
enum WeatherError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("weather service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Parse(String),
}

/// OpenWeatherMap-style current weather client.
#[derive(Debug)]
pub struct WeatherClient {
    client: reqwest::Client,
    config: WeatherConfig,
}

impl WeatherClient {
    pub fn new(config: WeatherConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build weather HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { client, config }
    }

    async fn fetch(&self, api_key: &str, latitude: f64, longitude: f64) -> Result<Environment, WeatherError> {
        debug!(url = %self.config.base_url, latitude, longitude, "weather request");

        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("appid", api_key.to_string()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(WeatherError::Status { status, body });
        }

        let body: Value = response.json().await?;
        parse_response(&body)
    }
}

#[async_trait]
impl WeatherLookup for WeatherClient {
    async fn lookup(&self, latitude: f64, longitude: f64) -> Environment {
        let Some(api_key) = self.config.api_key.as_deref() else {
            debug!("no weather credential, using neutral environment");
            return Environment::neutral();
        };
        match self.fetch(api_key, latitude, longitude).await {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, latitude, longitude, "weather lookup failed, using neutral environment");
                Environment::neutral()
            }
        }
    }
}

/// Read `main.temp`, `main.humidity` and `weather[0].main`.
fn parse_response(body: &Value) -> Result<Environment, WeatherError> {
    let temperature = body["main"]["temp"]
        .as_f64()
        .ok_or_else(|| WeatherError::Parse("missing main.temp".into()))?;
    let humidity = body["main"]["humidity"]
        .as_f64()
        .ok_or_else(|| WeatherError::Parse("missing main.humidity".into()))?;
    let condition = body["weather"][0]["main"]
        .as_str()
        .map(|s| s.parse().unwrap_or(WeatherCondition::Neutral))
        .unwrap_or(WeatherCondition::Neutral);
    Ok(Environment {
        temperature,
        humidity,
        condition,
    })
}

/// Returns the same environment for every location.
#[derive(Debug, Clone)]
pub struct FixedWeather(pub Environment);

#[async_trait]
impl WeatherLookup for FixedWeather {
    async fn lookup(&self, _latitude: f64, _longitude: f64) -> Environment {
        self.0.clone()
    }
}
