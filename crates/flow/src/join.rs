//! Fan-in coordination for unique tasks.
//!
//! Each (run, unique task) pair owns a [`JoinState`] that collects one
//! context per predecessor slot. The state fires exactly once, when every
//! slot has arrived, and stays behind as a tombstone until the run ends so
//! that late arrivals are recognised and discarded.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::context::{Context, Value};
use crate::routine::NodeId;
use crate::task::RunId;

/// Key set on contexts produced by a partial join.
pub const JOIN_PARTIAL_KEY: &str = "_join_partial";

// ── Merge rule ──────────────────────────────────────────────────────

/// How a unique task combines its predecessors' contexts.
///
/// Contexts are merged in predecessor declaration order, never arrival
/// order. For each key the first non-null value wins, unless the key is
/// owned by a specific predecessor, in which case only that predecessor's
/// value is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeRule {
    owners: Vec<(String, String)>,
}

impl MergeRule {
    pub fn first_non_null() -> Self {
        Self::default()
    }

    /// Give `task` exclusive ownership of `field`.
    pub fn owner(mut self, field: impl Into<String>, task: impl Into<String>) -> Self {
        self.owners.push((field.into(), task.into()));
        self
    }

    /// `(field, owning task)` pairs.
    pub fn owners(&self) -> &[(String, String)] {
        &self.owners
    }
}

/// A unique task's join parameters, resolved against the routine graph.
#[derive(Debug, Clone)]
pub(crate) struct JoinSpec {
    pub task: String,
    pub expected: usize,
    /// Field name to owning predecessor slot.
    pub owners: HashMap<String, usize>,
}

/// Merge contexts given as `(slot, context)` pairs.
pub(crate) fn merge_contexts(
    label: &str,
    parts: &BTreeMap<usize, Context>,
    owners: &HashMap<String, usize>,
) -> Context {
    let mut merged = Context::new();
    for (slot, ctx) in parts {
        for (key, value) in ctx.iter() {
            if let Some(owner) = owners.get(key) {
                if owner != slot && parts.contains_key(owner) {
                    continue;
                }
            }
            match merged.get(key) {
                None => {
                    merged.insert(key, value.clone());
                }
                Some(Value::Null) if !value.is_null() => {
                    merged.insert(key, value.clone());
                }
                Some(existing) if !value.is_null() && existing != value => {
                    debug!(join = label, field = key, slot, "conflicting branch values, keeping the first");
                }
                Some(_) => {}
            }
        }
    }
    merged
}

// ── Timeout policy ──────────────────────────────────────────────────

/// What happens to a join that is still incomplete when its timeout expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Fail the run; later arrivals are discarded.
    #[default]
    Abandon,
    /// Run the unique task once with whatever arrived.
    FirePartial,
}

/// Join timeout configuration. No timeout means a join waits indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinPolicy {
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutAction,
}

impl JoinPolicy {
    pub fn wait_forever() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration, on_timeout: TimeoutAction) -> Self {
        Self {
            timeout: Some(timeout),
            on_timeout,
        }
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinKey {
    pub run_id: RunId,
    pub node: NodeId,
}

#[derive(Debug)]
struct JoinState {
    task: String,
    expected: usize,
    received: BTreeMap<usize, Context>,
    fired: bool,
    done: watch::Sender<bool>,
}

impl JoinState {
    fn new(spec: &JoinSpec) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            task: spec.task.clone(),
            expected: spec.expected,
            received: BTreeMap::new(),
            fired: false,
            done,
        }
    }

    fn fire(&mut self) {
        self.fired = true;
        self.received.clear();
        self.done.send_replace(true);
    }
}

/// Result of one branch reaching a unique task.
#[derive(Debug)]
pub enum Arrival {
    /// This arrival completed the join. The caller runs the unique task.
    Fired(Context),
    /// Still waiting on other branches. `first` is set for the arrival that
    /// opened the state; `fired` flips to `true` once the join fires.
    Pending {
        first: bool,
        fired: watch::Receiver<bool>,
    },
    /// Duplicate or late arrival; dropped.
    Discarded,
}

/// Outcome of expiring a join after its timeout.
#[derive(Debug)]
pub enum Expiry {
    /// Another branch completed the join in the meantime.
    AlreadyFired,
    Abandoned,
    Partial(Context),
}

type RunJoins = HashMap<NodeId, Arc<Mutex<JoinState>>>;

/// Per-run join state registry.
///
/// The outer lock only guards the registry; each join state has its own
/// lock so unrelated runs and joins never contend.
#[derive(Debug, Default)]
pub struct JoinCoordinator {
    runs: Mutex<HashMap<RunId, RunJoins>>,
}

impl JoinCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, key: JoinKey, spec: &JoinSpec) -> (Arc<Mutex<JoinState>>, bool) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let joins = runs.entry(key.run_id).or_default();
        if let Some(state) = joins.get(&key.node) {
            return (Arc::clone(state), false);
        }
        let state = Arc::new(Mutex::new(JoinState::new(spec)));
        joins.insert(key.node, Arc::clone(&state));
        (state, true)
    }

    fn existing(&self, key: JoinKey) -> Option<Arc<Mutex<JoinState>>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(&key.run_id)
            .and_then(|joins| joins.get(&key.node))
            .cloned()
    }

    /// Record a branch arriving at a unique task from predecessor `slot`.
    pub(crate) fn arrive(&self, key: JoinKey, spec: &JoinSpec, slot: usize, ctx: Context) -> Arrival {
        let (state, created) = self.state(key, spec);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());

        if state.fired {
            warn!(run_id = %key.run_id, join = %state.task, slot, "arrival after join fired, discarded");
            return Arrival::Discarded;
        }
        if state.received.contains_key(&slot) {
            warn!(run_id = %key.run_id, join = %state.task, slot, "duplicate arrival for join slot, discarded");
            return Arrival::Discarded;
        }

        state.received.insert(slot, ctx);
        debug!(
            run_id = %key.run_id,
            join = %state.task,
            received = state.received.len(),
            expected = state.expected,
            "branch arrived at join"
        );

        if state.received.len() < state.expected {
            return Arrival::Pending {
                first: created,
                fired: state.done.subscribe(),
            };
        }

        let merged = merge_contexts(&state.task, &state.received, &spec.owners);
        state.fire();
        debug!(run_id = %key.run_id, join = %state.task, "join fired");
        Arrival::Fired(merged)
    }

    /// Resolve a join whose timeout expired.
    pub(crate) fn expire(&self, key: JoinKey, spec: &JoinSpec, action: TimeoutAction) -> Expiry {
        let Some(state) = self.existing(key) else {
            return Expiry::AlreadyFired;
        };
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fired {
            return Expiry::AlreadyFired;
        }

        let outcome = match action {
            TimeoutAction::Abandon => Expiry::Abandoned,
            TimeoutAction::FirePartial => {
                let mut merged = merge_contexts(&state.task, &state.received, &spec.owners);
                merged.insert(JOIN_PARTIAL_KEY, true);
                Expiry::Partial(merged)
            }
        };
        warn!(
            run_id = %key.run_id,
            join = %state.task,
            received = state.received.len(),
            expected = state.expected,
            action = ?action,
            "join timed out"
        );
        state.fire();
        outcome
    }

    /// Whether the join for `key` has fired. `None` if no branch has arrived yet.
    pub fn is_fired(&self, key: JoinKey) -> Option<bool> {
        self.existing(key)
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).fired)
    }

    /// Drop every join state of a finished run. Returns the names of joins
    /// that never fired, sorted.
    pub fn release_run(&self, run_id: RunId) -> Vec<String> {
        let joins = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id)
            .unwrap_or_default();

        let mut pending: Vec<String> = joins
            .values()
            .filter_map(|s| {
                let s = s.lock().unwrap_or_else(|e| e.into_inner());
                (!s.fired).then(|| s.task.clone())
            })
            .collect();
        pending.sort();
        pending
    }

    /// Number of runs with live join state.
    pub fn active_runs(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
