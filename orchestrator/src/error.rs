use zyphron_common::ErrorKind;

use crate::builder::BuilderError;
use crate::git::GitError;
use crate::lifecycle::LifecycleError;
use crate::persistence::PersistenceError;

/// Top level orchestrator error. Every variant maps onto the structured
/// [`ErrorKind`] surfaced to callers on a FAILED deployment.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("build error: {0}")]
    Build(#[from] BuilderError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("a deployment is already in progress: {0}")]
    Conflict(uuid::Uuid),
    #[error("deployment already reached a terminal state")]
    AlreadyCompleted,
    #[error("deployment not found")]
    DeploymentNotFound,
    #[error("project not found")]
    ProjectNotFound,
    #[error("step `{step}` exceeded its deadline")]
    StepTimeout { step: &'static str },
    #[error("deployment was cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Git(GitError::AuthFailed) => ErrorKind::CloneAuthFailed,
            Self::Git(_) => ErrorKind::CloneFailed,
            Self::Build(BuilderError::Synthesis(_)) => ErrorKind::DockerfileSynthesisFailed,
            Self::Build(BuilderError::Cancelled) => ErrorKind::Cancelled,
            Self::Build(BuilderError::Push(_)) => ErrorKind::PushFailed,
            Self::Build(_) => ErrorKind::BuildFailed,
            Self::Lifecycle(LifecycleError::HealthCheckTimeout) => ErrorKind::HealthCheckTimeout,
            Self::Lifecycle(_) => ErrorKind::DeployFailed,
            Self::Persistence(_) => ErrorKind::Internal,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::AlreadyCompleted => ErrorKind::Conflict,
            Self::DeploymentNotFound | Self::ProjectNotFound => ErrorKind::Internal,
            Self::StepTimeout { .. } => ErrorKind::StepTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
