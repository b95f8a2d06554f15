//! The persistence boundary. The core depends on the [`DeploymentStore`]
//! and [`ProjectStore`] traits only; the bundled SQLite implementation is
//! one provider of them.

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use zyphron_common::{Deployment, DeploymentState, EnvVar, Environment, Project, ProjectSlug};

pub use sqlite::Persistence;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("deployment {0} not found")]
    DeploymentNotFound(Uuid),
    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition {
        from: DeploymentState,
        to: DeploymentState,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeploymentFilter {
    pub project_id: Option<Uuid>,
    pub state: Option<DeploymentState>,
    pub environment: Option<Environment>,
}

#[derive(Clone, Copy, Debug)]
pub struct Page {
    /// Page to fetch, starting from 0.
    pub page: u32,
    /// Number of results per page.
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 0, limit: 32 }
    }
}

/// Mutable metadata written by the orchestrator as a pipeline progresses.
/// `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct MetadataUpdate {
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub image_ref: Option<String>,
    pub container_ref: Option<String>,
    pub external_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub build_duration_ms: Option<i64>,
    pub deploy_duration_ms: Option<i64>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
}

/// Owns deployment records. The orchestrator is the only writer while a
/// deployment is non-terminal; terminal records are immutable.
#[async_trait]
pub trait DeploymentStore: Send + Sync + 'static {
    async fn create(&self, deployment: &Deployment) -> Result<(), PersistenceError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deployment>, PersistenceError>;

    /// The project's single non-terminal deployment, if one exists.
    async fn find_active_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<Deployment>, PersistenceError>;

    /// Advance the state machine. Rejects transitions the DAG does not
    /// allow, including every write to a terminal record.
    async fn update_state(
        &self,
        id: Uuid,
        state: DeploymentState,
    ) -> Result<(), PersistenceError>;

    async fn update_metadata(
        &self,
        id: Uuid,
        update: &MetadataUpdate,
    ) -> Result<(), PersistenceError>;

    async fn list(
        &self,
        filter: &DeploymentFilter,
        page: Page,
    ) -> Result<Vec<Deployment>, PersistenceError>;

    /// Marks deployments left non-terminal by a dead process as failed.
    /// Called once on startup, before workers start.
    async fn fail_abandoned(&self) -> Result<u64, PersistenceError>;
}

/// Read-only project access
#[async_trait]
pub trait ProjectStore: Send + Sync + 'static {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Project>, PersistenceError>;

    async fn find_by_slug(&self, slug: &ProjectSlug)
        -> Result<Option<Project>, PersistenceError>;

    /// Plaintext environment variables scoped to one environment.
    async fn env_vars(
        &self,
        project_id: Uuid,
        environment: Environment,
    ) -> Result<Vec<EnvVar>, PersistenceError>;
}
