//! Signal-driven routine orchestration.
//!
//! Tasks compose into routines (validated DAGs) that run on trigger signals.
//! Fan-out branches run concurrently on cloned contexts, unique tasks join
//! them exactly once per run, and deputy tasks delegate to peer services
//! under a per-pair concurrency limit.

pub mod config;
pub mod context;
pub mod deputy;
pub mod error;
pub mod executor;
pub mod join;
pub mod metrics;
pub mod routine;
pub mod service;
pub mod task;

pub use config::{DeputyConfig, FlowConfig, JoinConfig};
pub use context::{Context, ContextError, ContextSchema, FieldKind, FieldSpec};
pub use deputy::{DeputyDispatcher, DeputyLimits, DeputyPeer, DeputyRequest};
pub use error::FlowError;
pub use executor::{Executor, RunReport, RunStatus};
pub use join::{JoinCoordinator, JoinPolicy, MergeRule, TimeoutAction, JOIN_PARTIAL_KEY};
pub use metrics::{FlowMetrics, FlowSnapshot};
pub use routine::{NodeId, Routine, RoutineBuilder};
pub use service::Service;
pub use task::{RunId, Task, TaskHandler, TaskKind, TaskScope};
