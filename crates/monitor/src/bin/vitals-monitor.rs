//! vitals-monitor: runs the IoT health-monitoring pipeline in one process.
//!
//! The runner publishes mock telemetry and periodic health checks; the
//! telemetry, anomaly, predictor and alerts services react over the signal bus.
//! Records are kept in memory for the lifetime of the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use vitals_core::{Config, TrafficIntensity};
use vitals_monitor::{MemoryDatabase, MonitorApp, MonitorSettings, WeatherClient};

/// IoT device health monitor: telemetry ingestion, anomaly scoring, failure
/// prediction and alerting.
#[derive(Parser, Debug)]
#[command(name = "vitals-monitor", version, about)]
struct Cli {
    /// Path to vitals.toml (joins, deputies, scoring thresholds).
    /// Overrides `VITALS_FLOW_CONFIG`.
    #[arg(long)]
    flow_config: Option<PathBuf>,

    /// Traffic intensity: low or high. Overrides `TRAFFIC_INTENSITY`.
    #[arg(long)]
    intensity: Option<TrafficIntensity>,

    /// Number of simulated devices. Overrides `DEVICE_COUNT`.
    #[arg(long)]
    devices: Option<u32>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for_secs: Option<u64>,
}

impl Cli {
    /// Flags given on the command line win over the environment config.
    fn apply(&self, config: &mut Config) {
        if let Some(intensity) = self.intensity {
            config.traffic = config.traffic.clone().with_intensity(intensity);
        }
        if let Some(devices) = self.devices {
            config.traffic.device_count = devices.max(1);
        }
        if let Some(path) = &self.flow_config {
            config.flow_config_path = path.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    vitals_core::config::load_dotenv();
    let cli = Cli::parse();
    info!(?cli, "starting vitals-monitor");

    let mut config = Config::from_env();
    cli.apply(&mut config);
    config.log_summary();

    let settings = MonitorSettings::load_or_default(&config.flow_config_path)?;
    let db = Arc::new(MemoryDatabase::default());
    let weather = Arc::new(WeatherClient::new(config.weather.clone()));

    let mut app = MonitorApp::new(config, &settings, db, weather)?;
    app.start()?;

    match cli.run_for_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!(secs, "run time elapsed");
                }
                _ = shutdown_signal() => {
                    info!("shutdown signal received");
                }
            }
        }
        None => {
            shutdown_signal().await;
            info!("shutdown signal received");
        }
    }

    let report = app.shutdown().await;
    info!(
        telemetry = report.scheduler.telemetry_published,
        health_checks = report.scheduler.health_checks_published,
        joins_fired = report.flow.joins_fired,
        "vitals-monitor exited cleanly"
    );
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::TrafficConfig;

    fn configured() -> Config {
        let mut config = Config::for_profile("");
        config.traffic = TrafficConfig {
            intensity: TrafficIntensity::Low,
            device_count: 7,
            telemetry_interval_ms: 250,
            health_check_interval_ms: 30_000,
        };
        config
    }

    #[test]
    fn environment_settings_survive_without_flags() {
        std::env::set_var("TRAFFIC_INTENSITY", "high");
        std::env::set_var("DEVICE_COUNT", "99");
        let cli = Cli::try_parse_from(["vitals-monitor"]).unwrap();
        assert!(cli.intensity.is_none());
        assert!(cli.devices.is_none());

        let mut config = configured();
        cli.apply(&mut config);
        assert_eq!(config.traffic.telemetry_interval_ms, 250);
        assert_eq!(config.traffic.device_count, 7);
    }

    #[test]
    fn flags_override_the_environment_config() {
        let cli = Cli::try_parse_from([
            "vitals-monitor",
            "--intensity",
            "high",
            "--devices",
            "0",
            "--flow-config",
            "other.toml",
        ])
        .unwrap();
        let mut config = configured();
        cli.apply(&mut config);
        assert_eq!(config.traffic.intensity, TrafficIntensity::High);
        assert_eq!(
            config.traffic.telemetry_interval_ms,
            TrafficIntensity::High.default_telemetry_interval_ms()
        );
        assert_eq!(config.traffic.device_count, 1);
        assert_eq!(config.flow_config_path, PathBuf::from("other.toml"));
    }
}
