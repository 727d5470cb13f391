use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::FlowError;
use crate::join::{Arrival, Expiry, JoinKey, JoinSpec};
use crate::routine::NodeId;
use crate::task::{TaskKind, TaskScope};

use super::core::{Executor, RunShared};

impl Executor {
    /// Run the branch starting at `node`. Errors are recorded on the run.
    pub(super) fn walk(&self, run: Arc<RunShared>, node: NodeId, ctx: Context) -> BoxFuture<'static, ()> {
        let exec = self.clone();
        async move {
            if let Err(e) = exec.step(&run, node, ctx).await {
                run.fail(e);
            }
        }
        .boxed()
    }

    /// Execute nodes sequentially until the branch ends, fans out, or parks
    /// at a join.
    async fn step(&self, run: &Arc<RunShared>, mut node: NodeId, mut ctx: Context) -> Result<(), FlowError> {
        loop {
            let out = self.run_task(run, node, ctx).await?;
            match run.routine.successors(node) {
                [] => {
                    run.record_output(node, out);
                    return Ok(());
                }
                [next] => {
                    let next = *next;
                    match self.enter(run, node, next, out).await? {
                        Some(entered) => {
                            node = next;
                            ctx = entered;
                        }
                        None => return Ok(()),
                    }
                }
                successors => {
                    // Each branch gets its own copy of the context.
                    let branches: Vec<_> = successors
                        .iter()
                        .map(|&next| {
                            let exec = self.clone();
                            let run = Arc::clone(run);
                            let branch_ctx = out.clone();
                            tokio::spawn(async move {
                                match exec.enter(&run, node, next, branch_ctx).await {
                                    Ok(Some(entered)) => exec.walk(Arc::clone(&run), next, entered).await,
                                    Ok(None) => {}
                                    Err(e) => run.fail(e),
                                }
                            })
                        })
                        .collect();
                    debug!(
                        run_id = %run.run_id,
                        task = %run.routine.task(node).name(),
                        branches = branches.len(),
                        "fan-out"
                    );
                    self.await_branches(run, branches).await;
                    return Ok(());
                }
            }
        }
    }

    /// Move from `from` to `next`. Returns the context to run `next` with,
    /// or `None` if this branch ends here because `next` is a unique task
    /// that another arrival will fire.
    async fn enter(
        &self,
        run: &Arc<RunShared>,
        from: NodeId,
        next: NodeId,
        ctx: Context,
    ) -> Result<Option<Context>, FlowError> {
        let Some(join) = run.routine.join(next) else {
            return Ok(Some(ctx));
        };
        let key = JoinKey {
            run_id: run.run_id,
            node: next,
        };
        let slot = run.routine.slot(from, next);

        match self.joins.arrive(key, join, slot, ctx) {
            Arrival::Fired(merged) => {
                self.metrics.record_join_fired();
                Ok(Some(merged))
            }
            Arrival::Discarded => {
                self.metrics.record_late_arrival();
                Ok(None)
            }
            Arrival::Pending { first, fired } => match self.join_policy.timeout {
                Some(limit) if first => self.await_join(key, join, fired, limit).await,
                _ => Ok(None),
            },
        }
    }

    /// Hold the first arrival of a join until it fires or the timeout
    /// expires, then apply the timeout action.
    async fn await_join(
        &self,
        key: JoinKey,
        join: &JoinSpec,
        fired: watch::Receiver<bool>,
        limit: Duration,
    ) -> Result<Option<Context>, FlowError> {
        if tokio::time::timeout(limit, wait_fired(fired)).await.is_ok() {
            return Ok(None);
        }

        match self.joins.expire(key, join, self.join_policy.on_timeout) {
            Expiry::AlreadyFired => Ok(None),
            Expiry::Abandoned => {
                self.metrics.record_join_timeout();
                Err(FlowError::JoinTimeout(join.task.clone()))
            }
            Expiry::Partial(ctx) => {
                self.metrics.record_join_timeout();
                self.metrics.record_join_fired();
                Ok(Some(ctx))
            }
        }
    }

    /// Validate, then run one task.
    async fn run_task(&self, run: &RunShared, node: NodeId, ctx: Context) -> Result<Context, FlowError> {
        let task = run.routine.task(node);

        if let Some(schema) = task.schema() {
            if let Err(problems) = schema.check(&ctx) {
                let reasons: Vec<String> = problems.iter().map(ToString::to_string).collect();
                let reason = format!("{}: {}", task.name(), reasons.join("; "));
                warn!(run_id = %run.run_id, task = %task.name(), reason = %reason, "input rejected");
                return Err(FlowError::Validation(reason));
            }
        }

        let scope = TaskScope::new(run.run_id, run.routine.name(), task.name(), run.emitter.clone());
        let started = Instant::now();
        let result = match task.kind() {
            TaskKind::Local(handler) => handler.handle(ctx, &scope).await,
            TaskKind::Deputy(request) => self.deputies.dispatch(request, ctx).await,
        };
        self.metrics.record_task(task.name(), started.elapsed());
        run.tasks_executed.fetch_add(1, Ordering::Relaxed);

        result.inspect_err(|e| {
            if e.is_validation() {
                warn!(run_id = %run.run_id, task = %task.name(), error = %e, "input rejected");
            } else {
                warn!(run_id = %run.run_id, task = %task.name(), error = %e, "task failed");
            }
        })
    }
}

/// Resolves once the join's fired flag is set, or its sender is gone.
async fn wait_fired(mut fired: watch::Receiver<bool>) {
    loop {
        let done = *fired.borrow_and_update();
        if done || fired.changed().await.is_err() {
            return;
        }
    }
}
