//! Routine execution.
//!
//! - `core`: [`Executor`] construction and the per-run entry point
//! - `walk`: graph traversal (sequencing, fan-out, join arrival)

mod core;
mod walk;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;

use crate::context::Context;
use crate::join::merge_contexts;
use crate::task::RunId;

pub use self::core::Executor;

/// Terminal state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Input failed a stage-boundary check. Nothing further ran on that branch.
    Rejected(String),
    /// A handler or deputy call failed.
    Failed(String),
    /// Every branch ended but some joins never received all of their arrivals.
    Incomplete { pending_joins: Vec<String> },
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Completed => None,
            Self::Rejected(r) | Self::Failed(r) => Some(r.clone()),
            Self::Incomplete { pending_joins } => {
                Some(format!("pending joins: {}", pending_joins.join(", ")))
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Rejected(_) => "rejected",
            Self::Failed(_) => "failed",
            Self::Incomplete { .. } => "incomplete",
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(serialize_with = "serialize_run_id")]
    pub run_id: RunId,
    pub routine: String,
    pub status: RunStatus,
    /// Contexts that reached leaf tasks, in leaf declaration order.
    pub outputs: Vec<Context>,
    pub tasks_executed: usize,
    pub duration: Duration,
}

fn serialize_run_id<S: serde::Serializer>(id: &RunId, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(id)
}

impl RunReport {
    /// All leaf outputs merged into one context, first non-null value per key
    /// in leaf declaration order.
    pub fn merged_output(&self) -> Context {
        let parts: BTreeMap<usize, Context> = self.outputs.iter().cloned().enumerate().collect();
        merge_contexts(&self.routine, &parts, &HashMap::new())
    }
}
