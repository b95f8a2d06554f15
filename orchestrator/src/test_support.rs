//! Stub implementations of the pipeline's capability traits, shared by the
//! deployment and handler test suites.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use zyphron_common::{ContainerRef, Deployment, DeploymentState, ImageRef, Project};
use zyphron_fabric::{EventBus, InMemoryEventBus, InMemoryLogBus};

use crate::builder::{BuildOutput, BuildRequest, BuilderError, ImageBuilder, PushOutput};
use crate::deployment::{DeploymentManager, PipelineConfig};
use crate::git::{CloneRequest, CloneResult, GitAdapter, GitError};
use crate::lifecycle::{
    external_host, ContainerOrchestrator, DeployOpts, DeployOutcome, HealthCheckSpec, HealthState,
    LifecycleError,
};
use crate::persistence::{DeploymentStore, Persistence};

/// Creates an express-looking tree at the requested work dir so the real
/// detector has something to classify.
#[derive(Clone, Default)]
pub(crate) struct StubGit {
    pub cleanups: Arc<Mutex<Vec<PathBuf>>>,
}

#[async_trait]
impl GitAdapter for StubGit {
    async fn clone_repo(&self, request: &CloneRequest) -> Result<CloneResult, GitError> {
        tokio::fs::create_dir_all(&request.work_dir).await?;
        tokio::fs::write(
            request.work_dir.join("package.json"),
            r#"{ "dependencies": { "express": "^4" }, "scripts": { "start": "node index.js" } }"#,
        )
        .await?;

        Ok(CloneResult {
            path: request.work_dir.clone(),
            commit_sha: "abc123def456".to_string(),
            commit_message: "initial commit".to_string(),
            commit_author: "dev".to_string(),
            branch: request.branch.clone(),
        })
    }

    async fn cleanup(&self, work_dir: &std::path::Path) -> Result<(), GitError> {
        self.cleanups.lock().await.push(work_dir.to_path_buf());
        if work_dir.exists() {
            tokio::fs::remove_dir_all(work_dir).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum BuildBehavior {
    Succeed { delay_ms: u64 },
    Fail,
    BlockUntilCancelled,
}

/// Pops one scripted behavior per build; defaults to a fast success once
/// the script runs out.
pub(crate) struct StubBuilder {
    behaviors: Mutex<VecDeque<BuildBehavior>>,
    pub builds: AtomicUsize,
}

impl StubBuilder {
    pub fn with(behaviors: Vec<BuildBehavior>) -> Self {
        Self {
            behaviors: Mutex::new(behaviors.into()),
            builds: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageBuilder for StubBuilder {
    async fn build(
        &self,
        request: &BuildRequest,
        cancel: CancellationToken,
    ) -> Result<BuildOutput, BuilderError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .await
            .pop_front()
            .unwrap_or(BuildBehavior::Succeed { delay_ms: 10 });

        match behavior {
            BuildBehavior::Succeed { delay_ms } => {
                sleep(Duration::from_millis(delay_ms)).await;
                Ok(BuildOutput {
                    image: request.image.clone(),
                    duration_ms: delay_ms as i64,
                })
            }
            BuildBehavior::Fail => Err(BuilderError::Driver(
                "exit status 1: tsc found 3 errors".to_string(),
            )),
            BuildBehavior::BlockUntilCancelled => {
                cancel.cancelled().await;
                Err(BuilderError::Cancelled)
            }
        }
    }

    async fn push(&self, _image: &ImageRef) -> Result<PushOutput, BuilderError> {
        Ok(PushOutput::default())
    }

    async fn alias_latest(&self, _image: &ImageRef) -> Result<(), BuilderError> {
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct StubLifecycle {
    pub deployed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub cleanups: AtomicUsize,
}

#[async_trait]
impl ContainerOrchestrator for StubLifecycle {
    async fn deploy(&self, opts: DeployOpts) -> Result<DeployOutcome, LifecycleError> {
        let name = ContainerRef::name_for(&opts.slug, &opts.deployment_id);
        self.deployed.lock().await.push(name.clone());

        let host = external_host(&opts.slug, opts.environment, opts.pr_number, "apps.test");

        Ok(DeployOutcome {
            container: ContainerRef {
                id: format!("cid-{name}"),
                name,
                host_port: 20000,
            },
            external_url: format!("http://{host}"),
            internal_url: format!("http://{host}:{}", opts.listen_port),
        })
    }

    async fn await_healthy(
        &self,
        _container: &ContainerRef,
        _health: &HealthCheckSpec,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn health(&self, _container: &ContainerRef) -> Result<HealthState, LifecycleError> {
        Ok(HealthState::Healthy)
    }

    async fn stop(&self, _container: &ContainerRef) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn restart(&self, _container: &ContainerRef) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn remove(&self, container: &ContainerRef) -> Result<(), LifecycleError> {
        self.removed.lock().await.push(container.name.clone());
        Ok(())
    }

    async fn cleanup_old_for_project(
        &self,
        _project_id: Uuid,
        _keep_last: usize,
    ) -> Result<usize, LifecycleError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn logs(
        &self,
        _container: &ContainerRef,
        _tail: Option<usize>,
        _since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<String>, LifecycleError> {
        Ok(Vec::new())
    }
}

pub(crate) struct Harness {
    pub manager: DeploymentManager,
    pub store: Persistence,
    pub events: Arc<InMemoryEventBus>,
    pub git: StubGit,
    pub lifecycle: Arc<StubLifecycle>,
    _tmp: tempfile::TempDir,
}

pub(crate) async fn harness(behaviors: Vec<BuildBehavior>, workers: usize) -> Harness {
    let store = Persistence::new_in_memory().await.unwrap();
    let events = Arc::new(InMemoryEventBus::new());
    let git = StubGit::default();
    let lifecycle = Arc::new(StubLifecycle::default());
    let tmp = tempfile::Builder::new()
        .prefix("zyphron-pipeline-test")
        .tempdir()
        .unwrap();

    let manager = DeploymentManager::builder()
        .config(PipelineConfig {
            max_concurrent_pipelines: workers,
            projects_dir: tmp.path().to_path_buf(),
            base_domain: "apps.test".to_string(),
            ..Default::default()
        })
        .store(Arc::new(store.clone()))
        .projects(Arc::new(store.clone()))
        .git(Arc::new(git.clone()))
        .image_builder(Arc::new(StubBuilder::with(behaviors)))
        .lifecycle(Arc::clone(&lifecycle) as Arc<dyn ContainerOrchestrator>)
        .events(Arc::clone(&events) as Arc<dyn EventBus>)
        .logs(Arc::new(InMemoryLogBus::new()))
        .build();

    Harness {
        manager,
        store,
        events,
        git,
        lifecycle,
        _tmp: tmp,
    }
}

pub(crate) async fn seed_project(store: &Persistence, slug: &str) -> Project {
    let project = Project {
        id: Uuid::new_v4(),
        slug: slug.parse().unwrap(),
        repo_url: format!("https://github.com/acme/{slug}.git"),
        default_branch: "main".to_string(),
        auto_deploy: true,
        root_directory: None,
        custom_domain: None,
        webhook_secret: Some("wh-secret".to_string()),
    };
    store.upsert_project(&project).await.unwrap();
    project
}

pub(crate) async fn wait_for_state(
    store: &Persistence,
    id: Uuid,
    expected: DeploymentState,
) -> Deployment {
    timeout(Duration::from_secs(10), async {
        loop {
            let deployment = DeploymentStore::find_by_id(store, id)
                .await
                .unwrap()
                .unwrap();
            if deployment.state == expected {
                return deployment;
            }
            if deployment.state.is_terminal() {
                panic!(
                    "deployment ended in {} while waiting for {expected}",
                    deployment.state
                );
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {expected}"))
}

/// Waits for any terminal state.
pub(crate) async fn wait_until_terminal(store: &Persistence, id: Uuid) -> Deployment {
    timeout(Duration::from_secs(10), async {
        loop {
            let deployment = DeploymentStore::find_by_id(store, id)
                .await
                .unwrap()
                .unwrap();
            if deployment.state.is_terminal() {
                return deployment;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for a terminal state")
}
