//! Service host: binds routines to a bus inbox and exposes deputy entry points.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vitals_signal::{Inbox, Signal, SignalBus, SignalEmitter};

use crate::context::Context;
use crate::deputy::DeputyPeer;
use crate::error::FlowError;
use crate::executor::{Executor, RunReport, RunStatus};
use crate::routine::Routine;

/// A named participant on the bus that runs routines on matching signals.
#[derive(Debug)]
pub struct Service {
    name: String,
    emitter: SignalEmitter,
    executor: Executor,
    subscriptions: HashMap<String, Vec<Arc<Routine>>>,
    entries: HashMap<String, Arc<Routine>>,
}

impl Service {
    pub fn new(name: impl Into<String>, bus: &Arc<SignalBus>, executor: Executor) -> Self {
        let name = name.into();
        Self {
            emitter: bus.emitter(name.clone()),
            name,
            executor,
            subscriptions: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn emitter(&self) -> &SignalEmitter {
        &self.emitter
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run `routine` on each of its trigger signals.
    pub fn subscribe(&mut self, routine: Routine) -> Arc<Routine> {
        let routine = Arc::new(routine);
        if routine.triggers().is_empty() {
            warn!(service = %self.name, routine = %routine.name(), "routine has no triggers");
        }
        for trigger in routine.triggers() {
            self.subscriptions
                .entry(trigger.clone())
                .or_default()
                .push(Arc::clone(&routine));
        }
        routine
    }

    /// Make `routine` callable by peers as deputy task `task`.
    pub fn expose(&mut self, task: impl Into<String>, routine: Routine) -> Arc<Routine> {
        let routine = Arc::new(routine);
        self.entries.insert(task.into(), Arc::clone(&routine));
        routine
    }

    /// Signal names this service reacts to, sorted.
    pub fn subscribed_signals(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.subscriptions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn exposed_tasks(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Freeze the service and register it with the executor's deputy
    /// dispatcher so peers can call its exposed tasks.
    pub fn into_shared(self) -> Arc<Self> {
        let service = Arc::new(self);
        let peer: Arc<dyn DeputyPeer> = service.clone();
        service.executor.deputies().register_peer(&peer);
        service
    }

    /// Run every routine subscribed to `signal`, concurrently.
    pub async fn handle(&self, signal: &Signal) -> Vec<RunReport> {
        let Some(routines) = self.subscriptions.get(signal.name()) else {
            debug!(service = %self.name, signal = %signal.name(), "no routine subscribed, ignored");
            return Vec::new();
        };

        let runs = routines.iter().map(|routine| {
            let ctx = Context::from_payload(signal.payload());
            self.executor
                .execute(Arc::clone(routine), ctx, self.emitter.clone())
        });
        futures::future::join_all(runs).await
    }

    /// Dispatch loop: one spawned run per received signal until `shutdown`
    /// flips to `true` or the inbox closes. In-flight runs are awaited
    /// before returning.
    pub async fn run(self: Arc<Self>, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) {
        info!(service = %self.name, signals = ?self.subscribed_signals(), "service started");
        let mut runs = JoinSet::new();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = inbox.recv() => {
                    let Some(signal) = received else {
                        debug!(service = %self.name, "inbox closed");
                        break;
                    };
                    debug!(service = %self.name, signal = %signal.name(), id = %signal.id(), "signal received");
                    let service = Arc::clone(&self);
                    runs.spawn(async move {
                        service.handle(&signal).await;
                    });
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        warn!(service = %self.name, error = %e, "run task panicked");
                    }
                }
            }
        }

        let in_flight = runs.len();
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                warn!(service = %self.name, error = %e, "run task panicked");
            }
        }
        info!(service = %self.name, in_flight, "service stopped");
    }
}

#[async_trait]
impl DeputyPeer for Service {
    fn peer_name(&self) -> &str {
        &self.name
    }

    /// Run the exposed routine and return its merged leaf output.
    async fn invoke(&self, task: &str, ctx: Context) -> Result<Context, FlowError> {
        let routine = self.entries.get(task).ok_or_else(|| {
            FlowError::task(task, format!("service '{}' does not expose this task", self.name))
        })?;

        let report = self
            .executor
            .execute(Arc::clone(routine), ctx, self.emitter.clone())
            .await;
        match &report.status {
            RunStatus::Completed => Ok(report.merged_output()),
            RunStatus::Rejected(reason) => Err(FlowError::Validation(reason.clone())),
            other => Err(FlowError::task(
                task,
                other.reason().unwrap_or_else(|| other.label().to_string()),
            )),
        }
    }
}
