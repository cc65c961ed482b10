use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy shared by the transcript store, the cycle executor, the
/// trigger registry and the HTTP layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or missing job parameters. User-correctable.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate create, job already running, or a cycle already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("malformed record {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Generation, summarisation or tool backend failure.
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl From<tokio_cron_scheduler::JobSchedulerError> for EngineError {
    fn from(err: tokio_cron_scheduler::JobSchedulerError) -> Self {
        Self::Scheduler(err.to_string())
    }
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Flattens an `anyhow` chain coming back from a collaborator.
    pub fn backend(err: anyhow::Error) -> Self {
        Self::Backend(format!("{:#}", err))
    }

    /// HTTP status the route layer answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Malformed { .. } | Self::Backend(_) | Self::Io(_) | Self::Scheduler(_) => 500,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
