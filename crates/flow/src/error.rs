use thiserror::Error;

use crate::context::ContextError;

/// Errors raised while building or running routines.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Input failed a stage-boundary check. Aborts the run as rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task '{task}' failed: {message}")]
    Task { task: String, message: String },

    #[error("deputy call {service}.{task} failed: {message}")]
    Deputy {
        service: String,
        task: String,
        message: String,
    },

    #[error("join '{0}' timed out")]
    JoinTimeout(String),

    #[error("peer service '{0}' is not available")]
    PeerUnavailable(String),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("invalid routine '{routine}': {message}")]
    Build { routine: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl FlowError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn task(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Task {
            task: task.into(),
            message: message.into(),
        }
    }

    pub(crate) fn build(routine: &str, message: impl Into<String>) -> Self {
        Self::Build {
            routine: routine.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error should end the run as rejected rather than failed.
    ///
    /// Missing or mistyped context fields count as validation failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Context(ContextError::Missing(_) | ContextError::WrongType { .. })
        )
    }
}
