//! Mock device telemetry.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use vitals_core::TrafficConfig;
use vitals_signal::{payload, Payload};

use crate::db::timestamp;

/// Sensor operating range; readings outside it are rejected by the filter stage.
pub const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 85.0);
pub const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

/// One sensor reading from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub recorded_at: DateTime<Utc>,
}

impl TelemetryReading {
    pub fn to_payload(&self) -> Payload {
        payload! {
            "device_id" => self.device_id,
            "temperature" => self.temperature,
            "humidity" => self.humidity,
            "latitude" => self.latitude,
            "longitude" => self.longitude,
            "recorded_at" => timestamp(self.recorded_at),
        }
    }
}

/// `device-001` style identifier.
pub fn device_id(n: u32) -> String {
    format!("device-{n:03}")
}

/// Fixed location of device `n`, spread on a small grid.
pub fn device_location(n: u32) -> (f64, f64) {
    let row = f64::from(n / 10);
    let col = f64::from(n % 10);
    (40.70 + row * 0.01, -74.00 + col * 0.01)
}

/// Generates readings around a healthy baseline, pushed off it with
/// probability `anomaly_bias`.
#[derive(Debug)]
pub struct TelemetryGenerator {
    device_count: u32,
    anomaly_bias: f64,
    rng: StdRng,
}

impl TelemetryGenerator {
    pub fn new(traffic: &TrafficConfig) -> Self {
        Self {
            device_count: traffic.device_count.max(1),
            anomaly_bias: traffic.intensity.anomaly_bias(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic generator for tests and replays.
    pub fn seeded(device_count: u32, anomaly_bias: f64, seed: u64) -> Self {
        Self {
            device_count: device_count.max(1),
            anomaly_bias: anomaly_bias.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    /// A random device number in `1..=device_count`.
    pub fn pick_device(&mut self) -> u32 {
        self.rng.gen_range(1..=self.device_count)
    }

    pub fn next_reading(&mut self, now: DateTime<Utc>) -> TelemetryReading {
        let n = self.pick_device();
        let (latitude, longitude) = device_location(n);

        let mut temperature = self.rng.gen_range(20.0..24.0);
        let mut humidity = self.rng.gen_range(45.0..55.0);
        if self.rng.gen_bool(self.anomaly_bias) {
            if self.rng.gen_bool(0.5) {
                temperature = self.rng.gen_range(35.0..60.0);
            } else {
                humidity = self.rng.gen_range(80.0..98.0);
            }
        }

        TelemetryReading {
            device_id: device_id(n),
            temperature: round1(temperature),
            humidity: round1(humidity),
            latitude,
            longitude,
            recorded_at: now,
        }
    }

    /// Payload of a scheduled health check for a random device.
    pub fn health_check(&mut self) -> Payload {
        let n = self.pick_device();
        let (latitude, longitude) = device_location(n);
        payload! {
            "device_id" => device_id(n),
            "latitude" => latitude,
            "longitude" => longitude,
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_stay_within_population() {
        let mut generator = TelemetryGenerator::seeded(3, 0.0, 7);
        for _ in 0..50 {
            let r = generator.next_reading(Utc::now());
            assert!(["device-001", "device-002", "device-003"].contains(&r.device_id.as_str()));
        }
    }

    #[test]
    fn unbiased_readings_stay_on_baseline() {
        let mut generator = TelemetryGenerator::seeded(10, 0.0, 42);
        for _ in 0..100 {
            let r = generator.next_reading(Utc::now());
            assert!((20.0..=24.0).contains(&r.temperature), "temperature {}", r.temperature);
            assert!((45.0..=55.0).contains(&r.humidity), "humidity {}", r.humidity);
        }
    }

    #[test]
    fn fully_biased_readings_leave_baseline() {
        let mut generator = TelemetryGenerator::seeded(10, 1.0, 42);
        for _ in 0..100 {
            let r = generator.next_reading(Utc::now());
            assert!(r.temperature >= 35.0 || r.humidity >= 80.0);
            assert!(r.temperature <= TEMPERATURE_RANGE.1 && r.humidity <= HUMIDITY_RANGE.1);
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let now = Utc::now();
        let mut a = TelemetryGenerator::seeded(10, 0.3, 9);
        let mut b = TelemetryGenerator::seeded(10, 0.3, 9);
        for _ in 0..10 {
            assert_eq!(a.next_reading(now), b.next_reading(now));
        }
    }

    #[test]
    fn payload_carries_every_field() {
        let r = TelemetryGenerator::seeded(1, 0.0, 1).next_reading(Utc::now());
        let p = r.to_payload();
        let keys: Vec<&str> = p.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["device_id", "temperature", "humidity", "latitude", "longitude", "recorded_at"]
        );
        assert_eq!(p["device_id"], "device-001");
    }
}
