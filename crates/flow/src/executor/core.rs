use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};
use vitals_signal::SignalEmitter;

use crate::config::FlowConfig;
use crate::context::Context;
use crate::deputy::{DeputyDispatcher, DeputyLimits};
use crate::error::FlowError;
use crate::join::{JoinCoordinator, JoinPolicy};
use crate::metrics::FlowMetrics;
use crate::routine::{NodeId, Routine};
use crate::task::RunId;

use super::{RunReport, RunStatus};

/// Runs routines. Cheap to clone; clones share join state, deputy slots
/// and metrics.
#[derive(Debug, Clone)]
pub struct Executor {
    pub(super) joins: Arc<JoinCoordinator>,
    pub(super) deputies: Arc<DeputyDispatcher>,
    pub(super) metrics: Arc<FlowMetrics>,
    pub(super) join_policy: JoinPolicy,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(JoinPolicy::default(), DeputyLimits::default())
    }
}

impl Executor {
    pub fn new(join_policy: JoinPolicy, limits: DeputyLimits) -> Self {
        let metrics = Arc::new(FlowMetrics::new());
        Self {
            joins: Arc::new(JoinCoordinator::new()),
            deputies: Arc::new(DeputyDispatcher::new(limits, Arc::clone(&metrics))),
            metrics,
            join_policy,
        }
    }

    pub fn from_config(config: &FlowConfig) -> Self {
        Self::new(config.join_policy(), config.deputy_limits())
    }

    pub fn joins(&self) -> &Arc<JoinCoordinator> {
        &self.joins
    }

    pub fn deputies(&self) -> &Arc<DeputyDispatcher> {
        &self.deputies
    }

    pub fn metrics(&self) -> &Arc<FlowMetrics> {
        &self.metrics
    }

    pub fn join_policy(&self) -> JoinPolicy {
        self.join_policy
    }

    /// Run `routine` once from `initial`, publishing through `emitter`.
    ///
    /// Never returns an error: failures are reported in the run status.
    pub async fn execute(
        &self,
        routine: Arc<Routine>,
        initial: Context,
        emitter: SignalEmitter,
    ) -> RunReport {
        let run = Arc::new(RunShared::new(Arc::clone(&routine), emitter));
        let started = Instant::now();
        debug!(run_id = %run.run_id, routine = %routine.name(), service = %run.emitter.origin(), "run started");

        match routine.roots() {
            [root] => self.walk(Arc::clone(&run), *root, initial).await,
            roots => {
                let branches: Vec<_> = roots
                    .iter()
                    .map(|&root| tokio::spawn(self.walk(Arc::clone(&run), root, initial.clone())))
                    .collect();
                self.await_branches(&run, branches).await;
            }
        }

        let pending = self.joins.release_run(run.run_id);
        let status = match run.take_failure() {
            Some(e) if e.is_validation() => RunStatus::Rejected(e.to_string()),
            Some(e) => RunStatus::Failed(e.to_string()),
            None if !pending.is_empty() => RunStatus::Incomplete {
                pending_joins: pending,
            },
            None => RunStatus::Completed,
        };
        self.metrics.record_run(&status);

        let duration = started.elapsed();
        let tasks_executed = run.tasks_executed.load(Ordering::Relaxed);
        match &status {
            RunStatus::Completed => info!(
                run_id = %run.run_id,
                routine = %routine.name(),
                tasks = tasks_executed,
                duration_ms = duration.as_millis() as u64,
                "run completed"
            ),
            other => warn!(
                run_id = %run.run_id,
                routine = %routine.name(),
                status = other.label(),
                reason = %other.reason().unwrap_or_default(),
                "run did not complete"
            ),
        }

        RunReport {
            run_id: run.run_id,
            routine: routine.name().to_string(),
            status,
            outputs: run.take_outputs(),
            tasks_executed,
            duration,
        }
    }

    /// Wait for spawned branches. A panicking branch fails the run.
    pub(super) async fn await_branches(
        &self,
        run: &RunShared,
        branches: Vec<tokio::task::JoinHandle<()>>,
    ) {
        for res in futures::future::join_all(branches).await {
            if let Err(e) = res {
                run.fail(FlowError::task(run.routine.name(), format!("branch panicked: {e}")));
            }
        }
    }
}

/// State shared by every branch of one run.
#[derive(Debug)]
pub(super) struct RunShared {
    pub run_id: RunId,
    pub routine: Arc<Routine>,
    pub emitter: SignalEmitter,
    pub tasks_executed: AtomicUsize,
    outputs: Mutex<Vec<(NodeId, Context)>>,
    failure: Mutex<Option<FlowError>>,
}

impl RunShared {
    fn new(routine: Arc<Routine>, emitter: SignalEmitter) -> Self {
        Self {
            run_id: RunId::new(),
            routine,
            emitter,
            tasks_executed: AtomicUsize::new(0),
            outputs: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// Record a branch failure. The first one decides the run status.
    pub fn fail(&self, error: FlowError) {
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if failure.is_none() {
            *failure = Some(error);
        } else {
            debug!(run_id = %self.run_id, error = %error, "additional branch failure");
        }
    }

    pub fn record_output(&self, node: NodeId, ctx: Context) {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((node, ctx));
    }

    fn take_failure(&self) -> Option<FlowError> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn take_outputs(&self) -> Vec<Context> {
        let mut outputs = std::mem::take(&mut *self.outputs.lock().unwrap_or_else(|e| e.into_inner()));
        outputs.sort_by_key(|(node, _)| *node);
        outputs.into_iter().map(|(_, ctx)| ctx).collect()
    }
}
