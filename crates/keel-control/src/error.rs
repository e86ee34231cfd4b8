//! Error types for control-plane operations

use keel_common::JobStatus;
use thiserror::Error;

pub type Result<T, E = ControlError> = std::result::Result<T, E>;

/// Coarse classification used by transports to choose a status signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Conflict,
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("weights not found: {0}")]
    WeightsNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The job's current status does not allow the requested action.
    #[error("job {job_id} is not {action} (status {status})")]
    InvalidTransition {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("max attempts reached ({attempt}/{max_attempts})")]
    MaxAttemptsReached { attempt: u32, max_attempts: u32 },

    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),

    /// The catalog source exists conceptually but has not been synced yet.
    #[error("catalog not ready: {0}")]
    CatalogNotReady(String),

    #[error("active model is {current:?}, expected {expected}")]
    ActiveModelMismatch {
        expected: String,
        current: Option<String>,
    },

    #[error("deployment already exists: {0}")]
    AlreadyExists(String),

    #[error("deployment conflict: {0}")]
    Conflict(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn not_cancellable(job_id: &str, status: JobStatus) -> Self {
        Self::InvalidTransition {
            job_id: job_id.to_string(),
            status,
            action: "cancellable",
        }
    }

    pub fn not_retryable(job_id: &str, status: JobStatus) -> Self {
        Self::InvalidTransition {
            job_id: job_id.to_string(),
            status,
            action: "retryable",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::ModelNotFound(_)
            | ControlError::JobNotFound(_)
            | ControlError::WeightsNotFound(_)
            | ControlError::DeploymentNotFound(_) => ErrorKind::NotFound,
            ControlError::InvalidRequest(_)
            | ControlError::InvalidTransition { .. }
            | ControlError::MaxAttemptsReached { .. } => ErrorKind::Invalid,
            ControlError::ActiveModelMismatch { .. }
            | ControlError::AlreadyExists(_)
            | ControlError::Conflict(_) => ErrorKind::Conflict,
            ControlError::FeatureDisabled(_)
            | ControlError::CatalogNotReady(_)
            | ControlError::Queue(_) => ErrorKind::Unavailable,
            ControlError::Cluster(_)
            | ControlError::Store(_)
            | ControlError::Serialization(_)
            | ControlError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
