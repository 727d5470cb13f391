//! Process wiring: one bus, one executor, the four services and the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vitals_core::Config;
use vitals_flow::{Executor, FlowSnapshot, Service};
use vitals_signal::{Inbox, SignalBus, SignalMetrics};

use crate::config::MonitorSettings;
use crate::db::Database;
use crate::error::MonitorError;
use crate::routines::{
    alerts, anomaly, predictor, telemetry, Collaborators, ALERTS, ANOMALY, PREDICTOR, RUNNER,
    SCORE_READING, TELEMETRY,
};
use crate::scheduler::{SchedulerHandle, SchedulerStats, TriggerScheduler};
use crate::telemetry::TelemetryGenerator;
use crate::weather::WeatherLookup;

/// How long shutdown waits for each service to drain its in-flight runs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Counters collected at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub scheduler: SchedulerStats,
    pub flow: FlowSnapshot,
    pub signals: HashMap<String, SignalMetrics>,
}

#[derive(Debug)]
pub struct MonitorApp {
    config: Config,
    bus: Arc<SignalBus>,
    executor: Executor,
    services: Vec<Arc<Service>>,
    /// Inboxes waiting for their service loop; drained by `start_services`.
    inboxes: Vec<Inbox>,
    loops: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
    scheduler: Option<SchedulerHandle>,
}

impl MonitorApp {
    /// Build every service and routine. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: Config,
        settings: &MonitorSettings,
        db: Arc<dyn Database>,
        weather: Arc<dyn WeatherLookup>,
    ) -> Result<Self, MonitorError> {
        let bus = Arc::new(SignalBus::new());
        let executor = Executor::from_config(&settings.flow);
        let deps = Collaborators::new(settings, db, weather);

        let mut services = Vec::new();
        let mut inboxes = Vec::new();
        let mut add = |service: Service| -> Result<(), MonitorError> {
            inboxes.push(bus.register(service.name())?);
            services.push(service.into_shared());
            Ok(())
        };

        let mut svc = Service::new(TELEMETRY, &bus, executor.clone());
        svc.subscribe(telemetry::ingest_telemetry(&deps, 0)?);
        add(svc)?;

        let mut svc = Service::new(ANOMALY, &bus, executor.clone());
        svc.expose(SCORE_READING, anomaly::score_reading(&deps)?);
        add(svc)?;

        let mut svc = Service::new(PREDICTOR, &bus, executor.clone());
        svc.subscribe(predictor::predict_failure(&deps)?);
        add(svc)?;

        let mut svc = Service::new(ALERTS, &bus, executor.clone());
        svc.subscribe(alerts::escalate_alert(&deps)?);
        svc.subscribe(alerts::log_escalation()?);
        add(svc)?;

        let (stop, _) = watch::channel(false);
        Ok(Self {
            config,
            bus,
            executor,
            services,
            inboxes,
            loops: Vec::new(),
            stop,
            scheduler: None,
        })
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Start the service loops and the trigger scheduler.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.scheduler.is_some() {
            return Err(MonitorError::AlreadyStarted);
        }
        self.start_services()?;
        let traffic = &self.config.traffic;
        let scheduler = TriggerScheduler::new(
            self.bus.emitter(RUNNER),
            TelemetryGenerator::new(traffic),
            traffic,
        );
        self.scheduler = Some(scheduler.start());
        Ok(())
    }

    /// Start only the service loops; signals must then come from elsewhere.
    pub fn start_services(&mut self) -> Result<(), MonitorError> {
        if !self.loops.is_empty() {
            return Err(MonitorError::AlreadyStarted);
        }
        for (service, inbox) in self.services.iter().zip(self.inboxes.drain(..)) {
            let service = Arc::clone(service);
            self.loops
                .push(tokio::spawn(service.run(inbox, self.stop.subscribe())));
        }
        info!(services = ?self.service_names(), "monitor services started");
        Ok(())
    }

    /// Stop the scheduler, then the services once their in-flight runs drain.
    pub async fn shutdown(mut self) -> MonitorReport {
        let scheduler = match self.scheduler.take() {
            Some(handle) => handle.stop().await,
            None => SchedulerStats::default(),
        };

        let _ = self.stop.send(true);
        for handle in self.loops.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "service loop failed"),
                Err(_) => warn!("service loop did not stop in time"),
            }
        }
        for service in &self.services {
            self.bus.unregister(service.name());
            self.executor.deputies().unregister_peer(service.name());
        }

        let report = MonitorReport {
            scheduler,
            flow: self.executor.metrics().snapshot(),
            signals: self.bus.metrics().snapshot(),
        };
        info!(
            runs = report.flow.total_runs(),
            completed = report.flow.runs_completed,
            rejected = report.flow.runs_rejected,
            failed = report.flow.runs_failed,
            deputy_calls = report.flow.deputy_calls,
            "monitor stopped"
        );
        report
    }
}
