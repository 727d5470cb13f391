//! IoT health-monitoring pipeline built on `vitals-flow`.
//!
//! The runner and four services share one [`SignalBus`](vitals_signal::SignalBus):
//! - `runner`: the [`TriggerScheduler`] publishing mock telemetry and health checks
//! - `telemetry`: validates, filters, scores (by deputy) and persists readings
//! - `anomaly`: per-metric scoring joined into an aggregate score
//! - `predictor`: failure prediction from anomaly history and weather
//! - `alerts`: alert records and escalation

pub mod app;
pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod routines;
pub mod scheduler;
pub mod telemetry;
pub mod weather;

pub use app::{MonitorApp, MonitorReport};
pub use config::MonitorSettings;
pub use cycle::CycleState;
pub use db::{Database, DbError, MemoryDatabase, Query, Record, SortOrder};
pub use error::MonitorError;
pub use routines::Collaborators;
pub use scheduler::{SchedulerHandle, SchedulerStats, TriggerScheduler};
pub use telemetry::{TelemetryGenerator, TelemetryReading};
pub use weather::{FixedWeather, WeatherClient, WeatherLookup};
