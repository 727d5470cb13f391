use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use vitals_signal::{Payload, SignalEmitter};

use crate::context::{Context, ContextSchema};
use crate::deputy::DeputyRequest;
use crate::error::FlowError;

/// Identifier of one routine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a handler knows about the run it executes in.
#[derive(Debug, Clone)]
pub struct TaskScope {
    run_id: RunId,
    routine: Arc<str>,
    task: Arc<str>,
    emitter: SignalEmitter,
}

impl TaskScope {
    pub fn new(
        run_id: RunId,
        routine: impl Into<Arc<str>>,
        task: impl Into<Arc<str>>,
        emitter: SignalEmitter,
    ) -> Self {
        Self {
            run_id,
            routine: routine.into(),
            task: task.into(),
            emitter,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn routine(&self) -> &str {
        &self.routine
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Name of the service hosting the run.
    pub fn service(&self) -> &str {
        self.emitter.origin()
    }

    pub fn emitter(&self) -> &SignalEmitter {
        &self.emitter
    }

    /// Emit a local signal as the hosting service.
    pub fn emit(&self, name: &str, payload: Payload) -> usize {
        self.emitter.emit(name, payload)
    }

    /// Emit a signal to specific services.
    pub fn emit_to<I, S>(&self, name: &str, payload: Payload, targets: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emitter.emit_to(name, payload, targets)
    }
}

/// Body of a local task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Transform the incoming context into the one handed downstream.
    async fn handle(&self, ctx: Context, scope: &TaskScope) -> Result<Context, FlowError>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct TaskFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for TaskFn<F>
where
    F: Fn(Context, TaskScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Context, FlowError>> + Send,
{
    async fn handle(&self, ctx: Context, scope: &TaskScope) -> Result<Context, FlowError> {
        (self.f)(ctx, scope.clone()).await
    }
}

#[derive(Clone)]
pub enum TaskKind {
    Local(Arc<dyn TaskHandler>),
    /// Executed by a peer service through the deputy dispatcher.
    Deputy(DeputyRequest),
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Deputy(req) => f.debug_tuple("Deputy").field(req).finish(),
        }
    }
}

/// A named step in a routine.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    description: String,
    kind: TaskKind,
    schema: Option<ContextSchema>,
}

impl Task {
    pub fn new<H>(name: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            kind: TaskKind::Local(Arc::new(handler)),
            schema: None,
        }
    }

    /// Build a task from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context, TaskScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Context, FlowError>> + Send + 'static,
    {
        Self::new(name, TaskFn { f })
    }

    /// A task that forwards the context to a peer service.
    pub fn deputy(name: impl Into<String>, request: DeputyRequest) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: TaskKind::Deputy(request),
            schema: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Fields that must be present before the task runs.
    pub fn expects(mut self, schema: ContextSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn schema(&self) -> Option<&ContextSchema> {
        self.schema.as_ref()
    }

    pub fn is_deputy(&self) -> bool {
        matches!(self.kind, TaskKind::Deputy(_))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vitals_signal::SignalBus;

    use super::*;

    #[tokio::test]
    async fn closure_task_sees_scope() {
        let bus = Arc::new(SignalBus::new());
        let task = Task::from_fn("stamp", |mut ctx: Context, scope: TaskScope| async move {
            ctx.insert("handled_by", scope.service());
            ctx.insert("task", scope.task());
            Ok(ctx)
        })
        .describe("stamps the context");

        let scope = TaskScope::new(RunId::new(), "r", "stamp", bus.emitter("svc"));
        let TaskKind::Local(handler) = task.kind() else {
            panic!("expected a local task");
        };
        let out = handler.handle(Context::new(), &scope).await.unwrap();
        assert_eq!(out.str("handled_by").unwrap(), "svc");
        assert_eq!(out.str("task").unwrap(), "stamp");
        assert_eq!(task.description(), "stamps the context");
    }

    #[test]
    fn deputy_task_carries_request() {
        let task = Task::deputy("check", DeputyRequest::new("anomaly", "score_reading", 2));
        assert!(task.is_deputy());
        assert!(task.schema().is_none());
    }
}
