use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use vitals_signal::{SignalBus, SignalEmitter};

use super::*;
use crate::context::{ContextSchema, FieldKind};
use crate::deputy::DeputyLimits;
use crate::error::FlowError;
use crate::join::{JoinPolicy, MergeRule, TimeoutAction, JOIN_PARTIAL_KEY};
use crate::routine::Routine;
use crate::task::{Task, TaskScope};

type Trace = Arc<Mutex<Vec<String>>>;

fn emitter() -> SignalEmitter {
    Arc::new(SignalBus::new()).emitter("test")
}

/// A task that appends its name to `trace` and to the context's `path`.
fn traced(name: &'static str, trace: &Trace) -> Task {
    let trace = Arc::clone(trace);
    Task::from_fn(name, move |mut ctx: Context, _scope: TaskScope| {
        let trace = Arc::clone(&trace);
        async move {
            trace.lock().unwrap().push(name.to_string());
            let mut path: Vec<String> = ctx.field("path").unwrap_or_default();
            path.push(name.to_string());
            ctx.put("path", &path)?;
            Ok::<_, FlowError>(ctx)
        }
    })
}

fn setter(name: &'static str, key: &'static str, value: serde_json::Value, delay_ms: u64) -> Task {
    Task::from_fn(name, move |mut ctx: Context, _scope: TaskScope| {
        let value = value.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            ctx.insert(key, value);
            Ok(ctx)
        }
    })
}

fn passthrough(name: &'static str) -> Task {
    Task::from_fn(name, |ctx: Context, _scope: TaskScope| async move { Ok(ctx) })
}

fn counting(name: &'static str, counter: &Arc<AtomicUsize>) -> Task {
    let counter = Arc::clone(counter);
    Task::from_fn(name, move |ctx: Context, _scope: TaskScope| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(ctx) }
    })
}

#[tokio::test]
async fn sequential_tasks_run_in_order() {
    let trace = Trace::default();
    let mut b = Routine::builder("seq");
    let ids: Vec<_> = ["a", "b", "c", "d"].into_iter().map(|n| b.task(traced(n, &trace))).collect();
    b.sequence(&ids);
    let routine = Arc::new(b.build().unwrap());

    let report = Executor::default()
        .execute(routine, Context::new().with("device_id", "d1"), emitter())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.tasks_executed, 4);
    assert_eq!(*trace.lock().unwrap(), ["a", "b", "c", "d"]);
    let out = &report.outputs[0];
    assert_eq!(out.get("path"), Some(&json!(["a", "b", "c", "d"])));
    assert_eq!(out.str("device_id").unwrap(), "d1");
}

#[tokio::test]
async fn fan_out_branches_do_not_see_each_other() {
    let mut b = Routine::builder("isolation");
    let root = b.task(setter("root", "shared", json!("original"), 0));
    let writer = b.task(setter("writer", "shared", json!("mutated"), 0));
    let reader = b.task(Task::from_fn("reader", |mut ctx: Context, _scope: TaskScope| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = ctx.str("shared")?.to_string();
        ctx.insert("reader_saw", seen);
        Ok::<_, FlowError>(ctx)
    }));
    let join = b.unique(passthrough("join"), MergeRule::first_non_null());
    b.fan_out(root, &[writer, reader]).fan_in(&[writer, reader], join);
    let routine = Arc::new(b.build().unwrap());

    let report = Executor::default().execute(routine, Context::new(), emitter()).await;
    assert_eq!(report.status, RunStatus::Completed);
    let out = &report.outputs[0];
    assert_eq!(out.str("reader_saw").unwrap(), "original");
    // Writer is the first predecessor, so its value wins the merge.
    assert_eq!(out.str("shared").unwrap(), "mutated");
}

#[tokio::test]
async fn unique_task_fires_once_across_many_branches() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut b = Routine::builder("wide");
    let root = b.task(passthrough("root"));
    let branches: Vec<_> = (0..8)
        .map(|i| {
            let name: &'static str = Box::leak(format!("branch_{i}").into_boxed_str());
            b.task(setter(name, name, json!(i), (8 - i) * 3))
        })
        .collect();
    let join = b.unique(counting("join", &fired), MergeRule::first_non_null());
    b.fan_out(root, &branches).fan_in(&branches, join);
    let routine = Arc::new(b.build().unwrap());

    let exec = Executor::default();
    let report = exec.execute(routine, Context::new(), emitter()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(report.outputs.len(), 1);
    let keys: Vec<&str> = report.outputs[0].keys().collect();
    assert_eq!(keys.len(), 8);
    assert_eq!(keys[0], "branch_0");
    assert_eq!(exec.metrics().snapshot().joins_fired, 1);
    assert_eq!(exec.joins().active_runs(), 0);
}

#[tokio::test]
async fn join_merges_in_declaration_order_not_arrival_order() {
    let mut b = Routine::builder("order");
    let root = b.task(passthrough("root"));
    let slow = b.task(setter("slow", "winner", json!("slow"), 40));
    let fast = b.task(setter("fast", "winner", json!("fast"), 0));
    let join = b.unique(passthrough("join"), MergeRule::first_non_null());
    b.fan_out(root, &[slow, fast]).fan_in(&[slow, fast], join);

    let report = Executor::default()
        .execute(Arc::new(b.build().unwrap()), Context::new(), emitter())
        .await;
    assert_eq!(report.outputs[0].str("winner").unwrap(), "slow");
}

#[tokio::test]
async fn owned_field_taken_from_owner() {
    let mut b = Routine::builder("owned");
    let root = b.task(passthrough("root"));
    let temp = b.task(setter("temp", "score", json!(0.2), 0));
    let hum = b.task(setter("hum", "score", json!(0.8), 10));
    let join = b.unique(passthrough("join"), MergeRule::first_non_null().owner("score", "hum"));
    b.fan_out(root, &[temp, hum]).fan_in(&[temp, hum], join);

    let report = Executor::default()
        .execute(Arc::new(b.build().unwrap()), Context::new(), emitter())
        .await;
    assert_eq!(report.outputs[0].f64("score").unwrap(), 0.8);
}

#[tokio::test]
async fn handler_error_fails_run_but_siblings_finish() {
    let sibling_done = Arc::new(AtomicUsize::new(0));
    let fired = Arc::new(AtomicUsize::new(0));
    let mut b = Routine::builder("failing");
    let root = b.task(passthrough("root"));
    let bad = b.task(Task::from_fn("bad", |_ctx: Context, _scope: TaskScope| async move {
        Err::<Context, _>(FlowError::task("bad", "sensor offline"))
    }));
    let good = b.task(counting("good", &sibling_done));
    let join = b.unique(counting("join", &fired), MergeRule::first_non_null());
    b.fan_out(root, &[bad, good]).fan_in(&[bad, good], join);

    let exec = Executor::default();
    let report = exec
        .execute(Arc::new(b.build().unwrap()), Context::new(), emitter())
        .await;

    match &report.status {
        RunStatus::Failed(reason) => assert!(reason.contains("sensor offline"), "got: {reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(sibling_done.load(Ordering::SeqCst), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(report.outputs.is_empty());
    assert_eq!(exec.metrics().snapshot().runs_failed, 1);
}

#[tokio::test]
async fn schema_violation_rejects_run() {
    let trace = Trace::default();
    let mut b = Routine::builder("validated");
    let validate = b.task(
        traced("validate", &trace)
            .expects(ContextSchema::new().require("device_id", FieldKind::String)),
    );
    let next = b.task(traced("next", &trace));
    b.then(validate, next);

    let exec = Executor::default();
    let report = exec
        .execute(Arc::new(b.build().unwrap()), Context::new().with("device_id", 7), emitter())
        .await;

    assert!(matches!(report.status, RunStatus::Rejected(_)), "got {:?}", report.status);
    assert!(trace.lock().unwrap().is_empty());
    assert_eq!(report.tasks_executed, 0);
    assert_eq!(exec.metrics().snapshot().runs_rejected, 1);
}

#[tokio::test]
async fn missing_field_in_handler_counts_as_rejection() {
    let mut b = Routine::builder("accessor");
    b.task(Task::from_fn("read", |ctx: Context, _scope: TaskScope| async move {
        ctx.f64("temperature")?;
        Ok::<_, FlowError>(ctx)
    }));
    let report = Executor::default()
        .execute(Arc::new(b.build().unwrap()), Context::new(), emitter())
        .await;
    assert!(matches!(report.status, RunStatus::Rejected(_)));
}

fn slow_diamond(slow_ms: u64, fired: &Arc<AtomicUsize>) -> Arc<Routine> {
    let mut b = Routine::builder("slow_diamond");
    let root = b.task(passthrough("root"));
    let quick = b.task(setter("quick", "quick", json!(true), 0));
    let slow = b.task(setter("slow", "slow", json!(true), slow_ms));
    let join = b.unique(counting("agg", fired), MergeRule::first_non_null());
    b.fan_out(root, &[quick, slow]).fan_in(&[quick, slow], join);
    Arc::new(b.build().unwrap())
}

#[tokio::test]
async fn join_timeout_fires_partial_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let exec = Executor::new(
        JoinPolicy::with_timeout(Duration::from_millis(30), TimeoutAction::FirePartial),
        DeputyLimits::default(),
    );
    let report = exec.execute(slow_diamond(200, &fired), Context::new(), emitter()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let out = &report.outputs[0];
    assert_eq!(out.get(JOIN_PARTIAL_KEY), Some(&json!(true)));
    assert!(out.is_set("quick"));
    assert!(!out.is_set("slow"));

    let m = exec.metrics().snapshot();
    assert_eq!(m.join_timeouts, 1);
    assert_eq!(m.late_arrivals, 1);
}

#[tokio::test]
async fn join_timeout_abandons_run() {
    let fired = Arc::new(AtomicUsize::new(0));
    let exec = Executor::new(
        JoinPolicy::with_timeout(Duration::from_millis(30), TimeoutAction::Abandon),
        DeputyLimits::default(),
    );
    let report = exec.execute(slow_diamond(200, &fired), Context::new(), emitter()).await;

    assert_eq!(report.status, RunStatus::Failed("join 'agg' timed out".into()));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn join_within_timeout_is_unaffected() {
    let fired = Arc::new(AtomicUsize::new(0));
    let exec = Executor::new(
        JoinPolicy::with_timeout(Duration::from_secs(5), TimeoutAction::Abandon),
        DeputyLimits::default(),
    );
    let report = exec.execute(slow_diamond(10, &fired), Context::new(), emitter()).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert!(!report.outputs[0].is_set(JOIN_PARTIAL_KEY));
    assert_eq!(exec.metrics().snapshot().join_timeouts, 0);
}

#[tokio::test]
async fn multiple_roots_converge() {
    let mut b = Routine::builder("roots");
    let history = b.task(setter("history", "count", json!(3), 5));
    let weather = b.task(setter("weather", "condition", json!("rain"), 0));
    let join = b.unique(passthrough("combine"), MergeRule::first_non_null());
    b.fan_in(&[history, weather], join);
    let routine = b.build().unwrap();
    assert_eq!(routine.roots().len(), 2);

    let report = Executor::default()
        .execute(Arc::new(routine), Context::new().with("device_id", "d"), emitter())
        .await;
    let out = &report.outputs[0];
    assert_eq!(out.get("count"), Some(&json!(3)));
    assert_eq!(out.str("condition").unwrap(), "rain");
    assert_eq!(out.str("device_id").unwrap(), "d");
}

#[tokio::test]
async fn concurrent_runs_keep_separate_join_state() {
    let fired = Arc::new(AtomicUsize::new(0));
    let exec = Executor::default();
    let routine = slow_diamond(5, &fired);
    let runs = (0..10).map(|i| {
        let exec = exec.clone();
        let routine = Arc::clone(&routine);
        async move {
            exec.execute(routine, Context::new().with("i", i), emitter()).await
        }
    });
    let reports = futures::future::join_all(runs).await;

    assert!(reports.iter().all(|r| r.status.is_completed()));
    assert_eq!(fired.load(Ordering::SeqCst), 10);
    for (i, r) in reports.iter().enumerate() {
        assert_eq!(r.outputs[0].get("i"), Some(&json!(i)));
    }
}

#[tokio::test]
async fn leaves_are_reported_in_declaration_order() {
    let mut b = Routine::builder("leaves");
    let root = b.task(passthrough("root"));
    let first = b.task(setter("first", "x", json!(1), 20));
    let second = b.task(setter("second", "x", json!(2), 0));
    b.fan_out(root, &[first, second]);

    let report = Executor::default()
        .execute(Arc::new(b.build().unwrap()), Context::new(), emitter())
        .await;
    assert_eq!(report.outputs.len(), 2);
    assert_eq!(report.outputs[0].get("x"), Some(&json!(1)));
    assert_eq!(report.merged_output().get("x"), Some(&json!(1)));
}
