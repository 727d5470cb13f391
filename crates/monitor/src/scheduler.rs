//! Trigger scheduler for the mock runner.
//!
//! One task owns both timers: telemetry readings go to the telemetry service
//! and health checks to the predictor. [`SchedulerHandle::stop`] cancels the
//! loop and waits for it.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use vitals_core::TrafficConfig;
use vitals_signal::{topics, SignalEmitter};

use crate::routines::{PREDICTOR, TELEMETRY};
use crate::telemetry::TelemetryGenerator;

/// Signals published over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub telemetry_published: u64,
    pub health_checks_published: u64,
}

#[derive(Debug)]
pub struct TriggerScheduler {
    emitter: SignalEmitter,
    generator: TelemetryGenerator,
    telemetry_every: Duration,
    health_check_every: Duration,
}

impl TriggerScheduler {
    pub fn new(emitter: SignalEmitter, generator: TelemetryGenerator, traffic: &TrafficConfig) -> Self {
        Self::with_intervals(
            emitter,
            generator,
            Duration::from_millis(traffic.telemetry_interval_ms),
            Duration::from_millis(traffic.health_check_interval_ms),
        )
    }

    pub fn with_intervals(
        emitter: SignalEmitter,
        generator: TelemetryGenerator,
        telemetry_every: Duration,
        health_check_every: Duration,
    ) -> Self {
        // tokio intervals panic on a zero period.
        let floor = Duration::from_millis(1);
        Self {
            emitter,
            generator,
            telemetry_every: telemetry_every.max(floor),
            health_check_every: health_check_every.max(floor),
        }
    }

    /// Spawn the timer loop. The first reading goes out immediately, the
    /// first health check after one health-check interval.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        SchedulerHandle { stop: stop_tx, task }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) -> SchedulerStats {
        info!(
            telemetry_every_ms = self.telemetry_every.as_millis() as u64,
            health_check_every_ms = self.health_check_every.as_millis() as u64,
            devices = self.generator.device_count(),
            "trigger scheduler started"
        );
        let mut telemetry = interval_at(Instant::now(), self.telemetry_every);
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval_at(Instant::now() + self.health_check_every, self.health_check_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stats = SchedulerStats::default();
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = telemetry.tick() => {
                    let reading = self.generator.next_reading(Utc::now());
                    let delivered = self.emitter.emit_to(topics::NEW_TELEMETRY, reading.to_payload(), [TELEMETRY]);
                    if delivered == 0 {
                        debug!(device_id = %reading.device_id, "telemetry not delivered");
                    }
                    stats.telemetry_published += 1;
                }
                _ = health.tick() => {
                    let payload = self.generator.health_check();
                    self.emitter.emit_to(topics::HEALTH_CHECK_TRIGGERED, payload, [PREDICTOR]);
                    stats.health_checks_published += 1;
                }
            }
        }

        info!(
            telemetry = stats.telemetry_published,
            health_checks = stats.health_checks_published,
            "trigger scheduler stopped"
        );
        stats
    }
}

/// Owner of a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<SchedulerStats>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel both timers and wait for the loop to exit.
    pub async fn stop(self) -> SchedulerStats {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "trigger scheduler task failed");
                SchedulerStats::default()
            }
        }
    }
}
