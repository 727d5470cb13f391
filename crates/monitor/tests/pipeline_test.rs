//! End-to-end tests: signals through telemetry, anomaly (by deputy),
//! predictor and alerts on one bus, with an in-memory database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use vitals_compute::{Environment, WeatherCondition};
use vitals_core::{Config, TrafficConfig, TrafficIntensity, WeatherConfig};
use vitals_monitor::db::{self, timestamp, Record};
use vitals_monitor::{Database, FixedWeather, MemoryDatabase, MonitorApp, MonitorSettings, Query};
use vitals_signal::{payload, topics, Payload};

const TIMEOUT: Duration = Duration::from_secs(5);

fn config(telemetry_interval_ms: u64) -> Config {
    Config {
        profile: String::new(),
        traffic: TrafficConfig {
            intensity: TrafficIntensity::High,
            device_count: 3,
            telemetry_interval_ms,
            health_check_interval_ms: 60_000,
        },
        weather: WeatherConfig::default(),
        flow_config_path: PathBuf::from("vitals.toml"),
    }
}

fn app_with(settings: &MonitorSettings, store: &Arc<MemoryDatabase>, condition: WeatherCondition) -> MonitorApp {
    let weather = FixedWeather(Environment {
        temperature: 15.0,
        humidity: 80.0,
        condition,
    });
    MonitorApp::new(config(1000), settings, store.clone(), Arc::new(weather)).unwrap()
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn reading(device: &str, temperature: f64, humidity: f64) -> Payload {
    payload! {
        "device_id" => device,
        "temperature" => temperature,
        "humidity" => humidity,
        "latitude" => 40.71,
        "longitude" => -74.01,
        "recorded_at" => timestamp(Utc::now()),
    }
}

/// Stable history for `device`, oldest first.
async fn seed_baseline(store: &MemoryDatabase, device: &str) {
    let samples = [(20.0, 50.0), (21.0, 51.0), (22.0, 49.0), (21.0, 50.0), (20.0, 50.0)];
    for (i, (temperature, humidity)) in samples.into_iter().enumerate() {
        let at = Utc::now() - chrono::Duration::minutes(10 - i as i64);
        store
            .insert(
                db::TELEMETRY,
                record(json!({
                    "device_id": device,
                    "temperature": temperature,
                    "humidity": humidity,
                    "recorded_at": timestamp(at),
                })),
            )
            .await
            .unwrap();
    }
}

async fn wait_for_rows(store: &MemoryDatabase, table: &str, rows: usize) {
    let waited = tokio::time::timeout(TIMEOUT, async {
        while store.count(table).await < rows {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        waited.is_ok(),
        "{table} has {} rows, expected {rows}",
        store.count(table).await
    );
}

async fn wait_for_runs(app: &MonitorApp, runs: u64) {
    let waited = tokio::time::timeout(TIMEOUT, async {
        while app.executor().metrics().snapshot().total_runs() < runs {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "fewer than {runs} runs finished");
}

#[tokio::test]
async fn normal_reading_is_scored_and_persisted() {
    let store = Arc::new(MemoryDatabase::default());
    let settings = MonitorSettings::from_toml("[deputy.limits]\n\"anomaly.score_reading\" = 1\n").unwrap();
    let mut app = app_with(&settings, &store, WeatherCondition::Clear);
    app.start_services().unwrap();

    app.bus()
        .emitter("runner")
        .emit_to(topics::NEW_TELEMETRY, reading("device-001", 21.5, 48.0), ["telemetry"]);
    wait_for_rows(&store, db::TELEMETRY, 1).await;

    let rows = store.query(db::TELEMETRY, &Query::new()).await.unwrap();
    assert_eq!(rows[0]["device_id"], "device-001");
    assert_eq!(rows[0]["anomalous"], false);
    assert_eq!(rows[0]["anomaly_score"], 0.0);
    assert_eq!(rows[0]["stage"], "PERSISTED");
    assert_eq!(store.count(db::ANOMALIES).await, 0);

    let report = app.shutdown().await;
    assert_eq!(report.flow.deputy_calls, 1);
    assert_eq!(report.flow.joins_fired, 1);
    // telemetry run + the delegated anomaly run
    assert_eq!(report.flow.runs_completed, 2);
}

#[tokio::test]
async fn anomaly_flows_to_predictor_and_alerts() {
    let store = Arc::new(MemoryDatabase::default());
    seed_baseline(&store, "device-002").await;
    let mut app = app_with(&MonitorSettings::default(), &store, WeatherCondition::Clear);
    app.start_services().unwrap();

    app.bus()
        .emitter("runner")
        .emit_to(topics::NEW_TELEMETRY, reading("device-002", 80.0, 95.0), ["telemetry"]);

    wait_for_rows(&store, db::ANOMALIES, 1).await;
    wait_for_rows(&store, db::PREDICTIONS, 1).await;
    wait_for_rows(&store, db::ALERTS, 1).await;

    let anomaly = &store.query(db::ANOMALIES, &Query::new()).await.unwrap()[0];
    assert_eq!(anomaly["score"], 1.0);
    assert!(anomaly["anomaly_reason"].as_str().unwrap().contains("temperature"));

    // One high-score anomaly in clear weather: 0.1 probability, low urgency,
    // so the maintenance notice goes to telemetry only.
    let prediction = &store.query(db::PREDICTIONS, &Query::new()).await.unwrap()[0];
    assert_eq!(prediction["urgency"], "low");
    assert!((prediction["failure_probability"].as_f64().unwrap() - 0.1).abs() < 1e-9);

    let alert = &store.query(db::ALERTS, &Query::new()).await.unwrap()[0];
    assert_eq!(alert["kind"], "anomaly");
    assert_eq!(alert["urgency"], "high");

    // ingest + score + predict + alert + escalation log
    wait_for_runs(&app, 5).await;
    let report = app.shutdown().await;
    assert_eq!(report.flow.runs_failed, 0);
    assert_eq!(report.flow.runs_rejected, 0);
    assert_eq!(report.flow.joins_fired, 2);
    assert_eq!(report.signals[topics::MAINTENANCE_NEEDED].delivered, 1);
    assert_eq!(store.count(db::ALERTS).await, 1);
}

#[tokio::test]
async fn health_check_with_bad_history_escalates() {
    let store = Arc::new(MemoryDatabase::default());
    for _ in 0..6 {
        store
            .insert(db::ANOMALIES, record(json!({"device_id": "device-003", "score": 0.9})))
            .await
            .unwrap();
    }
    let mut app = app_with(&MonitorSettings::default(), &store, WeatherCondition::Rain);
    app.start_services().unwrap();

    app.bus().emitter("runner").emit_to(
        topics::HEALTH_CHECK_TRIGGERED,
        payload! { "device_id" => "device-003", "latitude" => 40.72, "longitude" => -74.0 },
        ["predictor"],
    );

    wait_for_rows(&store, db::PREDICTIONS, 1).await;
    wait_for_rows(&store, db::ALERTS, 1).await;

    let prediction = &store.query(db::PREDICTIONS, &Query::new()).await.unwrap()[0];
    assert_eq!(prediction["urgency"], "high");
    assert_eq!(prediction["failure_probability"], 1.0);

    let alert = &store.query(db::ALERTS, &Query::new()).await.unwrap()[0];
    assert_eq!(alert["kind"], "maintenance");
    assert_eq!(alert["device_id"], "device-003");

    // predict + alert + escalation log
    wait_for_runs(&app, 3).await;
    let report = app.shutdown().await;
    assert_eq!(report.signals[topics::ALERT_ESCALATION].delivered, 1);
    assert_eq!(report.signals[topics::MAINTENANCE_NEEDED].delivered, 2);
}

#[tokio::test]
async fn invalid_readings_are_rejected_without_side_effects() {
    let store = Arc::new(MemoryDatabase::default());
    let mut app = app_with(&MonitorSettings::default(), &store, WeatherCondition::Clear);
    app.start_services().unwrap();
    let runner = app.bus().emitter("runner");

    runner.emit_to(topics::NEW_TELEMETRY, reading("device-001", 150.0, 40.0), ["telemetry"]);
    runner.emit_to(
        topics::NEW_TELEMETRY,
        payload! { "device_id" => "device-001", "temperature" => "hot", "humidity" => 40.0 },
        ["telemetry"],
    );

    wait_for_runs(&app, 2).await;
    let report = app.shutdown().await;
    assert_eq!(report.flow.runs_rejected, 2);
    assert_eq!(report.flow.deputy_calls, 0);
    assert_eq!(store.count(db::TELEMETRY).await, 0);
}

#[tokio::test]
async fn scheduler_drives_the_pipeline() {
    let store = Arc::new(MemoryDatabase::default());
    let weather = FixedWeather(Environment::neutral());
    let mut app = MonitorApp::new(config(20), &MonitorSettings::default(), store.clone(), Arc::new(weather)).unwrap();
    app.start().unwrap();
    assert!(app.start().is_err());

    wait_for_rows(&store, db::TELEMETRY, 3).await;
    let report = app.shutdown().await;
    assert!(report.scheduler.telemetry_published >= 3);
    assert!(report.signals[topics::NEW_TELEMETRY].published >= 3);
}
