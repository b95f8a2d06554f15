use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use uuid::Uuid;

use zyphron_common::{Deployment, DeploymentState, EnvVar, Environment, Project, ProjectSlug};

use super::{
    DeploymentFilter, DeploymentStore, MetadataUpdate, Page, PersistenceError, ProjectStore,
};

/// SQLite-backed store. New connections should be made by cloning
/// [`Persistence`] rather than calling the constructors again.
#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(path: &Path) -> Result<Self, PersistenceError> {
        let url = path.to_string_lossy();
        if !path.exists() {
            Sqlite::create_database(&url).await?;
        }

        let pool = SqlitePool::connect(&url).await?;
        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, PersistenceError> {
        // A second connection would open a second, empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, PersistenceError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                state TEXT NOT NULL,        -- Current state machine position
                environment TEXT NOT NULL,
                branch TEXT NOT NULL,
                commit_sha TEXT,
                commit_message TEXT,
                commit_author TEXT,
                image_ref TEXT,
                container_ref TEXT,
                external_url TEXT,
                started_at TEXT,
                finished_at TEXT,
                build_duration_ms INTEGER,
                deploy_duration_ms INTEGER,
                error_kind TEXT,
                error_detail TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_project
                ON deployments (project_id, created_at);

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,  -- URL-safe routing name
                repo_url TEXT NOT NULL,
                default_branch TEXT NOT NULL,
                auto_deploy INTEGER NOT NULL,
                root_directory TEXT,
                custom_domain TEXT UNIQUE,
                webhook_secret TEXT
            );

            CREATE TABLE IF NOT EXISTS env_vars (
                project_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,        -- Opaque; encrypted elsewhere
                environment TEXT NOT NULL,
                is_secret INTEGER NOT NULL,
                PRIMARY KEY (project_id, key, environment)
            );",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// The underlying pool, for components persisting their own small
    /// tables in the same state database (the port allocator).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Registers or updates a project record. Projects are owned by an
    /// external collaborator; this exists for bootstrap and tests.
    pub async fn upsert_project(&self, project: &Project) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT OR REPLACE INTO projects
                (id, slug, repo_url, default_branch, auto_deploy, root_directory, custom_domain, webhook_secret)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(project.id)
        .bind(&project.slug)
        .bind(&project.repo_url)
        .bind(&project.default_branch)
        .bind(project.auto_deploy)
        .bind(&project.root_directory)
        .bind(&project.custom_domain)
        .bind(&project.webhook_secret)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_deployment(&self, id: Uuid) -> Result<Option<Deployment>, PersistenceError> {
        sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn upsert_env_var(&self, var: &EnvVar) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT OR REPLACE INTO env_vars (project_id, key, value, environment, is_secret)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(var.project_id)
        .bind(&var.key)
        .bind(&var.value)
        .bind(var.environment)
        .bind(var.is_secret)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for Persistence {
    async fn create(&self, deployment: &Deployment) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO deployments
                (id, project_id, state, environment, branch, commit_sha, commit_message,
                 commit_author, image_ref, container_ref, external_url, started_at, finished_at,
                 build_duration_ms, deploy_duration_ms, error_kind, error_detail, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment.id)
        .bind(deployment.project_id)
        .bind(deployment.state)
        .bind(deployment.environment)
        .bind(&deployment.branch)
        .bind(&deployment.commit_sha)
        .bind(&deployment.commit_message)
        .bind(&deployment.commit_author)
        .bind(&deployment.image_ref)
        .bind(&deployment.container_ref)
        .bind(&deployment.external_url)
        .bind(deployment.started_at)
        .bind(deployment.finished_at)
        .bind(deployment.build_duration_ms)
        .bind(deployment.deploy_duration_ms)
        .bind(&deployment.error_kind)
        .bind(&deployment.error_detail)
        .bind(deployment.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deployment>, PersistenceError> {
        self.fetch_deployment(id).await
    }

    async fn find_active_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<Deployment>, PersistenceError> {
        sqlx::query_as(
            "SELECT * FROM deployments
             WHERE project_id = ? AND state IN (?, ?, ?)
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(project_id)
        .bind(DeploymentState::Pending)
        .bind(DeploymentState::Building)
        .bind(DeploymentState::Deploying)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn update_state(
        &self,
        id: Uuid,
        state: DeploymentState,
    ) -> Result<(), PersistenceError> {
        let current = self
            .fetch_deployment(id)
            .await?
            .ok_or(PersistenceError::DeploymentNotFound(id))?;

        if !current.state.can_transition_to(state) {
            return Err(PersistenceError::IllegalTransition {
                from: current.state,
                to: state,
            });
        }

        sqlx::query("UPDATE deployments SET state = ? WHERE id = ?")
            .bind(state)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        update: &MetadataUpdate,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE deployments SET
                commit_sha = COALESCE(?, commit_sha),
                commit_message = COALESCE(?, commit_message),
                commit_author = COALESCE(?, commit_author),
                image_ref = COALESCE(?, image_ref),
                container_ref = COALESCE(?, container_ref),
                external_url = COALESCE(?, external_url),
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at),
                build_duration_ms = COALESCE(?, build_duration_ms),
                deploy_duration_ms = COALESCE(?, deploy_duration_ms),
                error_kind = COALESCE(?, error_kind),
                error_detail = COALESCE(?, error_detail)
             WHERE id = ?",
        )
        .bind(&update.commit_sha)
        .bind(&update.commit_message)
        .bind(&update.commit_author)
        .bind(&update.image_ref)
        .bind(&update.container_ref)
        .bind(&update.external_url)
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(update.build_duration_ms)
        .bind(update.deploy_duration_ms)
        .bind(&update.error_kind)
        .bind(&update.error_detail)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(
        &self,
        filter: &DeploymentFilter,
        page: Page,
    ) -> Result<Vec<Deployment>, PersistenceError> {
        let mut query = QueryBuilder::new("SELECT * FROM deployments WHERE 1 = 1");

        if let Some(project_id) = filter.project_id {
            query.push(" AND project_id = ").push_bind(project_id);
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state);
        }
        if let Some(environment) = filter.environment {
            query.push(" AND environment = ").push_bind(environment);
        }

        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind((page.page * page.limit) as i64);

        query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn fail_abandoned(&self) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "UPDATE deployments
             SET state = ?, error_kind = ?, error_detail = ?, finished_at = ?
             WHERE state IN (?, ?, ?)",
        )
        .bind(DeploymentState::Failed)
        .bind(zyphron_common::ErrorKind::Internal.to_string())
        .bind("orchestrator restarted while the pipeline was running")
        .bind(Utc::now())
        .bind(DeploymentState::Pending)
        .bind(DeploymentState::Building)
        .bind(DeploymentState::Deploying)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProjectStore for Persistence {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Project>, PersistenceError> {
        sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn find_by_slug(
        &self,
        slug: &ProjectSlug,
    ) -> Result<Option<Project>, PersistenceError> {
        sqlx::query_as("SELECT * FROM projects WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn env_vars(
        &self,
        project_id: Uuid,
        environment: Environment,
    ) -> Result<Vec<EnvVar>, PersistenceError> {
        sqlx::query_as(
            "SELECT * FROM env_vars WHERE project_id = ? AND environment = ? ORDER BY key",
        )
        .bind(project_id)
        .bind(environment)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn deployment(project_id: Uuid) -> Deployment {
        Deployment {
            id: Uuid::new_v4(),
            project_id,
            state: DeploymentState::Pending,
            environment: Environment::Production,
            branch: "main".to_string(),
            commit_sha: None,
            commit_message: None,
            commit_author: None,
            image_ref: None,
            container_ref: None,
            external_url: None,
            started_at: None,
            finished_at: None,
            build_duration_ms: None,
            deploy_duration_ms: None,
            error_kind: None,
            error_detail: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_round_trip() {
        let store = Persistence::new_in_memory().await.unwrap();
        let record = deployment(Uuid::new_v4());

        store.create(&record).await.unwrap();
        let fetched = DeploymentStore::find_by_id(&store, record.id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.state, DeploymentState::Pending);
        assert_eq!(fetched.branch, "main");
    }

    #[tokio::test]
    async fn active_lookup_ignores_terminal_records() {
        let store = Persistence::new_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();

        let mut done = deployment(project_id);
        done.state = DeploymentState::Live;
        store.create(&done).await.unwrap();

        assert!(store
            .find_active_by_project(project_id)
            .await
            .unwrap()
            .is_none());

        let running = deployment(project_id);
        store.create(&running).await.unwrap();

        assert_eq!(
            store
                .find_active_by_project(project_id)
                .await
                .unwrap()
                .unwrap()
                .id,
            running.id
        );
    }

    #[tokio::test]
    async fn state_updates_follow_the_dag() {
        let store = Persistence::new_in_memory().await.unwrap();
        let record = deployment(Uuid::new_v4());
        store.create(&record).await.unwrap();

        store
            .update_state(record.id, DeploymentState::Building)
            .await
            .unwrap();
        store
            .update_state(record.id, DeploymentState::Deploying)
            .await
            .unwrap();
        store
            .update_state(record.id, DeploymentState::Live)
            .await
            .unwrap();

        // Terminal records are immutable.
        let error = store
            .update_state(record.id, DeploymentState::Failed)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PersistenceError::IllegalTransition {
                from: DeploymentState::Live,
                to: DeploymentState::Failed,
            }
        ));
    }

    #[tokio::test]
    async fn skipping_states_is_rejected() {
        let store = Persistence::new_in_memory().await.unwrap();
        let record = deployment(Uuid::new_v4());
        store.create(&record).await.unwrap();

        assert!(store
            .update_state(record.id, DeploymentState::Live)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn metadata_updates_only_touch_provided_fields() {
        let store = Persistence::new_in_memory().await.unwrap();
        let record = deployment(Uuid::new_v4());
        store.create(&record).await.unwrap();

        store
            .update_metadata(
                record.id,
                &MetadataUpdate {
                    commit_sha: Some("abc123".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_metadata(
                record.id,
                &MetadataUpdate {
                    image_ref: Some("registry/zyphron/p:abc12345".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fetched = DeploymentStore::find_by_id(&store, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(
            fetched.image_ref.as_deref(),
            Some("registry/zyphron/p:abc12345")
        );
    }

    #[tokio::test]
    async fn listing_filters_by_project_and_state() {
        let store = Persistence::new_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();

        store.create(&deployment(project_id)).await.unwrap();
        store.create(&deployment(project_id)).await.unwrap();
        store.create(&deployment(Uuid::new_v4())).await.unwrap();

        let listed = store
            .list(
                &DeploymentFilter {
                    project_id: Some(project_id),
                    ..Default::default()
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);

        let listed = store
            .list(
                &DeploymentFilter {
                    project_id: Some(project_id),
                    state: Some(DeploymentState::Live),
                    ..Default::default()
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn abandoned_deployments_are_failed_on_recovery() {
        let store = Persistence::new_in_memory().await.unwrap();

        let mut building = deployment(Uuid::new_v4());
        building.state = DeploymentState::Building;
        store.create(&building).await.unwrap();

        let mut live = deployment(Uuid::new_v4());
        live.state = DeploymentState::Live;
        store.create(&live).await.unwrap();

        let recovered = store.fail_abandoned().await.unwrap();
        assert_eq!(recovered, 1);

        let fetched = DeploymentStore::find_by_id(&store, building.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.state, DeploymentState::Failed);
        assert_eq!(fetched.error_kind.as_deref(), Some("INTERNAL"));

        let untouched = DeploymentStore::find_by_id(&store, live.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.state, DeploymentState::Live);
    }

    #[tokio::test]
    async fn project_and_env_round_trip() {
        let store = Persistence::new_in_memory().await.unwrap();

        let project = Project {
            id: Uuid::new_v4(),
            slug: "blog".parse().unwrap(),
            repo_url: "https://github.com/acme/blog".to_string(),
            default_branch: "main".to_string(),
            auto_deploy: true,
            root_directory: None,
            custom_domain: None,
            webhook_secret: Some("shh".to_string()),
        };
        store.upsert_project(&project).await.unwrap();

        store
            .upsert_env_var(&EnvVar {
                project_id: project.id,
                key: "DATABASE_URL".to_string(),
                value: "postgres://db".to_string(),
                environment: Environment::Production,
                is_secret: true,
            })
            .await
            .unwrap();
        store
            .upsert_env_var(&EnvVar {
                project_id: project.id,
                key: "FLAG".to_string(),
                value: "preview-only".to_string(),
                environment: Environment::Preview,
                is_secret: false,
            })
            .await
            .unwrap();

        let by_slug = ProjectStore::find_by_slug(&store, &project.slug)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_slug.id, project.id);

        let production = store
            .env_vars(project.id, Environment::Production)
            .await
            .unwrap();
        assert_eq!(production.len(), 1);
        assert_eq!(production[0].key, "DATABASE_URL");
    }
}
