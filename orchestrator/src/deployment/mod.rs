//! The deployment manager and its pipeline.
//!
//! ```text
//! submit() ── persists PENDING ──> pipeline queue
//!                                       |
//!                                       v
//!                              N worker tasks, each driving one
//!                              deployment fully through
//!                              clone -> detect -> build -> push
//!                              (queue.rs, state BUILDING) then
//!                              deploy -> verify -> finalize
//!                              (run.rs, state DEPLOYING -> LIVE)
//! ```
//!
//! Workers take from a single FIFO queue, so at most
//! `max_concurrent_pipelines` deployments are in flight; a second
//! semaphore gates the build step alone. Cancellation is cooperative: every
//! step runs under the deployment's token and checks it at each I/O
//! boundary.

mod queue;
mod run;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use zyphron_common::deployment::short_tag;
use zyphron_common::limits::ResourceLimits;
use zyphron_common::log::{BuildStep, LogEntry, LogLevel, StatusUpdate};
use zyphron_common::{
    Deployment, DeploymentState, Environment, ErrorKind, Event, EventType, Project,
};
use zyphron_fabric::{EventBus, EventFilter, EventStream, LogBus, LogSubscription};

use crate::builder::ImageBuilder;
use crate::detector::Detector;
use crate::error::{Error, Result};
use crate::git::GitAdapter;
use crate::lifecycle::ContainerOrchestrator;
use crate::persistence::{
    DeploymentFilter, DeploymentStore, MetadataUpdate, Page, ProjectStore,
};

pub use queue::Built;

const QUEUE_BUFFER_SIZE: usize = 100;

/// How long a forced submit waits for the superseded run to finish cleanup
const SUPERSEDE_GRACE: Duration = Duration::from_secs(60);

/// What a caller asks for when deploying a project
#[derive(Clone, Debug, Default)]
pub struct DeployRequest {
    pub project_id: Uuid,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub environment: Environment,
    /// Cancel any active deployment for the project and take its place
    pub force: bool,
    /// Pull request number, set by the webhook for preview deployments
    pub pr_number: Option<u32>,
}

/// Tunables for the pipeline; defaults match the documented configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub max_concurrent_pipelines: usize,
    pub max_concurrent_builds: usize,
    pub clone_timeout: Duration,
    pub build_timeout: Duration,
    pub push_timeout: Duration,
    pub deploy_timeout: Duration,
    /// Slack added on top of the health budget for the verify step
    pub verify_slack: Duration,
    pub keep_last_deployments: usize,
    pub base_domain: String,
    /// Registry to push to; empty disables pushing (local images only)
    pub container_registry: String,
    pub projects_dir: PathBuf,
    /// Caps applied to image builds and runtime containers
    pub limits: ResourceLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: 5,
            max_concurrent_builds: 5,
            clone_timeout: Duration::from_secs(120),
            build_timeout: Duration::from_secs(1800),
            push_timeout: Duration::from_secs(300),
            deploy_timeout: Duration::from_secs(60),
            verify_slack: Duration::from_secs(30),
            keep_last_deployments: 3,
            base_domain: "zyphron.local".to_string(),
            container_registry: String::new(),
            projects_dir: PathBuf::from("/var/lib/zyphron/projects"),
            limits: ResourceLimits::default(),
        }
    }
}

/// A deployment waiting in the pipeline queue
#[derive(Clone, Debug)]
pub(crate) struct Queued {
    pub deployment: Deployment,
    pub project: Project,
    pub pr_number: Option<u32>,
}

pub(crate) struct PipelineContext {
    pub config: PipelineConfig,
    pub store: Arc<dyn DeploymentStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub git: Arc<dyn GitAdapter>,
    pub detector: Detector,
    pub builder: Arc<dyn ImageBuilder>,
    pub lifecycle: Arc<dyn ContainerOrchestrator>,
    pub events: Arc<dyn EventBus>,
    pub logs: Arc<dyn LogBus>,
    pub build_gate: Semaphore,
}

impl PipelineContext {
    /// Event publishing is best effort: a fabric hiccup is logged, never
    /// fails a pipeline.
    pub async fn emit(
        &self,
        event_type: EventType,
        deployment_id: Uuid,
        project_id: Uuid,
        payload: serde_json::Value,
    ) {
        let event = Event::new(event_type, deployment_id, project_id, payload);
        if let Err(error) = self.events.publish(event).await {
            warn!(
                error = &error as &dyn std::error::Error,
                %event_type, "failed to publish lifecycle event"
            );
        }
    }

    pub async fn log(&self, deployment_id: Uuid, step: BuildStep, level: LogLevel, line: String) {
        let entry = LogEntry::new(deployment_id, step, line).with_level(level);
        if let Err(error) = self.logs.publish_log(entry).await {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to publish log entry"
            );
        }
    }

    pub async fn publish_status(&self, deployment_id: Uuid, state: DeploymentState) {
        let update = StatusUpdate {
            deployment_id,
            state,
            timestamp: Utc::now(),
            message: None,
        };
        let _ = self.logs.publish_status(update).await;
    }

    /// Where this deployment's working tree lives
    pub fn work_dir(&self, project: &Project, deployment_id: &Uuid) -> PathBuf {
        self.config
            .projects_dir
            .join(project.slug.as_str())
            .join(short_tag(deployment_id))
    }
}

type QueueSender = mpsc::Sender<Queued>;
type SharedQueueReceiver = Arc<Mutex<mpsc::Receiver<Queued>>>;
type ActiveTasks = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

/// Accepts deployment requests and drives them through the pipeline under
/// bounded concurrency. Cheap to clone.
#[derive(Clone)]
pub struct DeploymentManager {
    context: Arc<PipelineContext>,
    queue_send: QueueSender,
    active: ActiveTasks,
    // Serializes the conflict check in submit against concurrent submits.
    submit_lock: Arc<Mutex<()>>,
}

impl DeploymentManager {
    pub fn builder() -> DeploymentManagerBuilder {
        DeploymentManagerBuilder::default()
    }

    /// Accept a deployment request: persist it as PENDING and enqueue it.
    ///
    /// Rejects when the project already has a non-terminal deployment,
    /// unless `force` is set, in which case the active run is cancelled and
    /// awaited before the new one takes its place.
    #[instrument(skip(self), fields(project_id = %request.project_id))]
    pub async fn submit(&self, request: DeployRequest) -> Result<Uuid> {
        let project = self
            .context
            .projects
            .find_by_id(request.project_id)
            .await?
            .ok_or(Error::ProjectNotFound)?;

        let _submitting = self.submit_lock.lock().await;

        if let Some(active) = self
            .context
            .store
            .find_active_by_project(project.id)
            .await?
        {
            if !request.force {
                return Err(Error::Conflict(active.id));
            }

            info!(superseded = %active.id, "force submit: cancelling active deployment");
            // Ignore the cancel outcome: the run may reach a terminal state
            // on its own while we are asking.
            let _ = self.cancel(active.id, "superseded by a forced deploy").await;
            self.wait_until_terminal(active.id).await?;
        }

        let deployment = Deployment {
            id: Uuid::new_v4(),
            project_id: project.id,
            state: DeploymentState::Pending,
            environment: request.environment,
            branch: request
                .branch
                .unwrap_or_else(|| project.default_branch.clone()),
            commit_sha: request.commit_sha,
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
        };

        self.context.store.create(&deployment).await?;
        self.context
            .emit(
                EventType::DeploymentCreated,
                deployment.id,
                project.id,
                json!({
                    "branch": deployment.branch,
                    "environment": deployment.environment,
                }),
            )
            .await;

        let id = deployment.id;
        self.active
            .lock()
            .await
            .insert(id, CancellationToken::new());

        self.queue_send
            .send(Queued {
                deployment,
                project,
                pr_number: request.pr_number,
            })
            .await
            .map_err(|_| Error::Internal(anyhow::anyhow!("pipeline queue is closed")))?;

        info!(deployment_id = %id, "deployment accepted");
        Ok(id)
    }

    /// Cancel a non-terminal deployment. Cooperative: the running step
    /// observes the token at its next I/O boundary. Best effort past the
    /// push step.
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<()> {
        let deployment = self
            .context
            .store
            .find_by_id(id)
            .await?
            .ok_or(Error::DeploymentNotFound)?;

        if deployment.state.is_terminal() {
            return Err(Error::AlreadyCompleted);
        }

        info!(reason, "cancelling deployment");
        self.context
            .log(
                id,
                BuildStep::Summary,
                LogLevel::Warn,
                format!("cancellation requested: {reason}"),
            )
            .await;

        if let Some(token) = self.active.lock().await.get(&id) {
            token.cancel();
        }

        Ok(())
    }

    /// Start a fresh deployment of the same commit.
    pub async fn redeploy(&self, id: Uuid) -> Result<Uuid> {
        let source = self
            .context
            .store
            .find_by_id(id)
            .await?
            .ok_or(Error::DeploymentNotFound)?;

        self.submit(DeployRequest {
            project_id: source.project_id,
            branch: Some(source.branch),
            commit_sha: source.commit_sha,
            environment: source.environment,
            force: false,
            pr_number: None,
        })
        .await
    }

    pub async fn status(&self, id: Uuid) -> Result<Deployment> {
        self.context
            .store
            .find_by_id(id)
            .await?
            .ok_or(Error::DeploymentNotFound)
    }

    pub async fn list(&self, project_id: Uuid, page: Page) -> Result<Vec<Deployment>> {
        self.context
            .store
            .list(
                &DeploymentFilter {
                    project_id: Some(project_id),
                    ..Default::default()
                },
                page,
            )
            .await
            .map_err(Into::into)
    }

    pub async fn find_project(&self, id: Uuid) -> Result<Project> {
        self.context
            .projects
            .find_by_id(id)
            .await?
            .ok_or(Error::ProjectNotFound)
    }

    /// Log history plus live tail for one deployment.
    pub async fn subscribe_logs(&self, id: Uuid) -> Result<LogSubscription> {
        self.context
            .logs
            .subscribe_logs(id)
            .await
            .map_err(|e| Error::Internal(e.into()))
    }

    /// Live lifecycle events matching a filter.
    pub async fn subscribe_events(&self, filter: EventFilter) -> EventStream {
        self.context.events.subscribe(filter).await
    }

    async fn wait_until_terminal(&self, id: Uuid) -> Result<()> {
        let deadline = tokio::time::Instant::now() + SUPERSEDE_GRACE;

        loop {
            let deployment = self
                .context
                .store
                .find_by_id(id)
                .await?
                .ok_or(Error::DeploymentNotFound)?;

            if deployment.state.is_terminal() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(anyhow::anyhow!(
                    "superseded deployment {id} did not finish cleanup in time"
                )));
            }

            sleep(Duration::from_millis(250)).await;
        }
    }
}

#[derive(Default)]
pub struct DeploymentManagerBuilder {
    config: Option<PipelineConfig>,
    store: Option<Arc<dyn DeploymentStore>>,
    projects: Option<Arc<dyn ProjectStore>>,
    git: Option<Arc<dyn GitAdapter>>,
    detector: Option<Detector>,
    builder: Option<Arc<dyn ImageBuilder>>,
    lifecycle: Option<Arc<dyn ContainerOrchestrator>>,
    events: Option<Arc<dyn EventBus>>,
    logs: Option<Arc<dyn LogBus>>,
}

impl DeploymentManagerBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn DeploymentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn projects(mut self, projects: Arc<dyn ProjectStore>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn git(mut self, git: Arc<dyn GitAdapter>) -> Self {
        self.git = Some(git);
        self
    }

    pub fn detector(mut self, detector: Detector) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn ContainerOrchestrator>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn logs(mut self, logs: Arc<dyn LogBus>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Wires the manager and spawns the worker pool.
    pub fn build(self) -> DeploymentManager {
        let config = self.config.unwrap_or_default();
        let workers = config.max_concurrent_pipelines.max(1);
        let build_gate = Semaphore::new(config.max_concurrent_builds.max(1));

        let context = Arc::new(PipelineContext {
            config,
            store: self.store.expect("store is required"),
            projects: self.projects.expect("projects store is required"),
            git: self.git.expect("git adapter is required"),
            detector: self.detector.unwrap_or_default(),
            builder: self.builder.expect("image builder is required"),
            lifecycle: self.lifecycle.expect("lifecycle manager is required"),
            events: self.events.expect("event bus is required"),
            logs: self.logs.expect("log bus is required"),
            build_gate,
        });

        let (queue_send, queue_recv) = mpsc::channel(QUEUE_BUFFER_SIZE);
        let queue_recv: SharedQueueReceiver = Arc::new(Mutex::new(queue_recv));
        let active: ActiveTasks = Default::default();

        for ident in 0..workers {
            let recv = Arc::clone(&queue_recv);
            let context = Arc::clone(&context);
            let active = Arc::clone(&active);
            tokio::spawn(worker_task(ident, recv, context, active));
        }

        DeploymentManager {
            context,
            queue_send,
            active,
            submit_lock: Default::default(),
        }
    }
}

/// One pipeline worker: takes a queued deployment, runs it to a terminal
/// state, repeats. Workers die only when the queue closes.
async fn worker_task(
    ident: usize,
    recv: SharedQueueReceiver,
    context: Arc<PipelineContext>,
    active: ActiveTasks,
) {
    info!("pipeline worker {ident} started");

    loop {
        let queued = { recv.lock().await.recv().await };
        let Some(queued) = queued else { break };

        let id = queued.deployment.id;
        let token = active
            .lock()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();

        execute(&context, queued, &token).await;

        active.lock().await.remove(&id);
    }

    info!("pipeline worker {ident} stopped");
}

/// Drives one deployment to a terminal state, whatever happens inside the
/// steps.
async fn execute(context: &Arc<PipelineContext>, queued: Queued, token: &CancellationToken) {
    let id = queued.deployment.id;
    let project_id = queued.project.id;
    let work_dir = context.work_dir(&queued.project, &id);

    // Cancelled while still waiting in the queue.
    if token.is_cancelled() {
        finalize_cancelled(context, id, project_id).await;
        return;
    }

    let result = pipeline(context, queued, token, &work_dir).await;

    match result {
        Ok(()) => {}
        // A cancellation observed anywhere in the pipeline (including
        // inside the build driver) ends in CANCELLED, not FAILED.
        Err(error) if error.kind() == ErrorKind::Cancelled => {
            finalize_cancelled(context, id, project_id).await
        }
        Err(error) => finalize_failed(context, id, project_id, error).await,
    }

    // The working tree never outlives the pipeline.
    if let Err(error) = context.git.cleanup(&work_dir).await {
        warn!(
            error = &error as &dyn std::error::Error,
            "failed to clean up working tree"
        );
    }
}

async fn pipeline(
    context: &Arc<PipelineContext>,
    queued: Queued,
    token: &CancellationToken,
    work_dir: &std::path::Path,
) -> Result<()> {
    let built = queue::handle(context, queued, token, work_dir).await?;
    run::handle(context, built, token).await
}

async fn finalize_cancelled(context: &Arc<PipelineContext>, id: Uuid, project_id: Uuid) {
    if let Err(error) = context
        .store
        .update_state(id, DeploymentState::Cancelled)
        .await
    {
        error!(
            error = &error as &dyn std::error::Error,
            "failed to record cancellation"
        );
        return;
    }

    let _ = context
        .store
        .update_metadata(
            id,
            &MetadataUpdate {
                finished_at: Some(Utc::now()),
                error_kind: Some(ErrorKind::Cancelled.to_string()),
                ..Default::default()
            },
        )
        .await;

    context.publish_status(id, DeploymentState::Cancelled).await;
    context
        .log(
            id,
            BuildStep::Summary,
            LogLevel::Warn,
            "deployment cancelled".to_string(),
        )
        .await;
    context
        .emit(
            EventType::DeploymentCancelled,
            id,
            project_id,
            json!({ "state": DeploymentState::Cancelled }),
        )
        .await;
}

async fn finalize_failed(context: &Arc<PipelineContext>, id: Uuid, project_id: Uuid, error: Error) {
    let kind = error.kind();
    error!(
        error = &error as &dyn std::error::Error,
        error_kind = %kind,
        "pipeline failed"
    );

    if let Err(store_error) = context.store.update_state(id, DeploymentState::Failed).await {
        error!(
            error = &store_error as &dyn std::error::Error,
            "failed to record pipeline failure"
        );
        return;
    }

    let _ = context
        .store
        .update_metadata(
            id,
            &MetadataUpdate {
                finished_at: Some(Utc::now()),
                error_kind: Some(kind.to_string()),
                error_detail: Some(sanitize_error_detail(&error)),
                ..Default::default()
            },
        )
        .await;

    context.publish_status(id, DeploymentState::Failed).await;
    context
        .log(
            id,
            BuildStep::Summary,
            LogLevel::Error,
            format!("deployment failed: {}", kind.user_message()),
        )
        .await;
    context
        .emit(
            EventType::DeploymentFailed,
            id,
            project_id,
            json!({
                "error_kind": kind,
                "message": kind.user_message(),
            }),
        )
        .await;
}

/// What callers get to see in `error_detail`: the error chain without
/// anything that could carry credentials (clone URLs, tokens).
fn sanitize_error_detail(error: &Error) -> String {
    let detail = error.to_string();
    if detail.contains("x-access-token") {
        return error.kind().user_message().to_string();
    }
    detail
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::time::timeout;

    use crate::test_support::{
        harness, seed_project, wait_for_state, wait_until_terminal, BuildBehavior,
    };

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn pipeline_reaches_live() {
        let h = harness(vec![BuildBehavior::Succeed { delay_ms: 10 }], 2).await;
        let project = seed_project(&h.store, "blog").await;

        let id = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                ..Default::default()
            })
            .await
            .unwrap();

        let live = wait_for_state(&h.store, id, DeploymentState::Live).await;

        assert_eq!(live.external_url.as_deref(), Some("http://blog.apps.test"));
        assert!(live.image_ref.is_some());
        assert!(live.container_ref.is_some());
        assert_eq!(live.commit_sha.as_deref(), Some("abc123def456"));
        assert!(live.started_at.is_some());
        assert!(live.finished_at.unwrap() >= live.started_at.unwrap());
        assert!(live.build_duration_ms.is_some());

        // One deploy, retention enforced, tree cleaned.
        assert_eq!(h.lifecycle.deployed.lock().await.len(), 1);
        assert_eq!(h.lifecycle.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(h.git.cleanups.lock().await.len(), 1);

        // Lifecycle events arrived in DAG order for the project partition.
        let history = h
            .events
            .history(project.id, Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        let kinds: Vec<EventType> = history.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::DeploymentCreated,
                EventType::DeploymentStarted,
                EventType::BuildStarted,
                EventType::BuildCompleted,
                EventType::DeploymentLive,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn build_failure_ends_failed() {
        let h = harness(vec![BuildBehavior::Fail], 2).await;
        let project = seed_project(&h.store, "shop").await;

        let id = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                ..Default::default()
            })
            .await
            .unwrap();

        let failed = wait_until_terminal(&h.store, id).await;

        assert_eq!(failed.state, DeploymentState::Failed);
        assert_eq!(failed.error_kind.as_deref(), Some("BUILD_FAILED"));
        assert!(failed.error_detail.is_some());

        // No container may exist for a failed build.
        assert!(h.lifecycle.deployed.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_mid_build_cleans_up() {
        let h = harness(vec![BuildBehavior::BlockUntilCancelled], 2).await;
        let project = seed_project(&h.store, "backend").await;

        let id = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                ..Default::default()
            })
            .await
            .unwrap();

        wait_for_state(&h.store, id, DeploymentState::Building).await;
        h.manager.cancel(id, "user abort").await.unwrap();

        let done = wait_until_terminal(&h.store, id).await;

        assert_eq!(done.state, DeploymentState::Cancelled);
        assert!(h.lifecycle.deployed.lock().await.is_empty());
        assert_eq!(h.git.cleanups.lock().await.len(), 1);

        // Cancelling a finished deployment is rejected.
        assert!(matches!(
            h.manager.cancel(id, "again").await,
            Err(Error::AlreadyCompleted)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicting_submit_is_rejected() {
        let h = harness(vec![BuildBehavior::BlockUntilCancelled], 2).await;
        let project = seed_project(&h.store, "docs").await;

        let first = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                ..Default::default()
            })
            .await
            .unwrap();

        wait_for_state(&h.store, first, DeploymentState::Building).await;

        let error = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Conflict(id) if id == first));

        h.manager.cancel(first, "test done").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forced_submit_supersedes_the_active_run() {
        let h = harness(
            vec![
                BuildBehavior::BlockUntilCancelled,
                BuildBehavior::Succeed { delay_ms: 10 },
            ],
            2,
        )
        .await;
        let project = seed_project(&h.store, "web").await;

        let first = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for_state(&h.store, first, DeploymentState::Building).await;

        let second = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                force: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let first_final = crate::persistence::DeploymentStore::find_by_id(&h.store, first)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first_final.state, DeploymentState::Cancelled);

        wait_for_state(&h.store, second, DeploymentState::Live).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_pool_bounds_in_flight_deployments() {
        let behaviors = (0..4)
            .map(|_| BuildBehavior::Succeed { delay_ms: 150 })
            .collect();
        let h = harness(behaviors, 2).await;

        let mut ids = Vec::new();
        for slug in ["p1", "p2", "p3", "p4"] {
            let project = seed_project(&h.store, slug).await;
            ids.push(
                h.manager
                    .submit(DeployRequest {
                        project_id: project.id,
                        ..Default::default()
                    })
                    .await
                    .unwrap(),
            );
        }

        let mut max_in_flight = 0usize;
        let all_terminal = timeout(Duration::from_secs(15), async {
            loop {
                let mut in_flight = 0;
                let mut terminal = 0;
                for id in &ids {
                    let d = crate::persistence::DeploymentStore::find_by_id(&h.store, *id)
                        .await
                        .unwrap()
                        .unwrap();
                    match d.state {
                        DeploymentState::Building | DeploymentState::Deploying => in_flight += 1,
                        state if state.is_terminal() => terminal += 1,
                        _ => {}
                    }
                }
                max_in_flight = max_in_flight.max(in_flight);
                if terminal == ids.len() {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        all_terminal.unwrap();

        assert!(
            max_in_flight <= 2,
            "observed {max_in_flight} concurrent pipelines with 2 workers"
        );

        for id in ids {
            let d = crate::persistence::DeploymentStore::find_by_id(&h.store, id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(d.state, DeploymentState::Live);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn redeploy_copies_branch_commit_and_environment() {
        let h = harness(
            vec![
                BuildBehavior::Succeed { delay_ms: 10 },
                BuildBehavior::Succeed { delay_ms: 10 },
            ],
            2,
        )
        .await;
        let project = seed_project(&h.store, "cms").await;

        let first = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                branch: Some("release".to_string()),
                environment: Environment::Staging,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for_state(&h.store, first, DeploymentState::Live).await;

        let second = h.manager.redeploy(first).await.unwrap();
        assert_ne!(first, second);

        let copied = wait_for_state(&h.store, second, DeploymentState::Live).await;
        assert_eq!(copied.branch, "release");
        assert_eq!(copied.environment, Environment::Staging);
        assert_eq!(copied.commit_sha.as_deref(), Some("abc123def456"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preview_deployments_get_a_preview_hostname() {
        let h = harness(vec![BuildBehavior::Succeed { delay_ms: 10 }], 2).await;
        let project = seed_project(&h.store, "feature").await;

        let id = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                environment: Environment::Preview,
                pr_number: Some(17),
                ..Default::default()
            })
            .await
            .unwrap();

        let live = wait_for_state(&h.store, id, DeploymentState::Live).await;
        assert_eq!(
            live.external_url.as_deref(),
            Some("http://feature-pr-17.apps.test")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn late_log_subscriber_sees_full_prefix() {
        let h = harness(vec![BuildBehavior::Succeed { delay_ms: 10 }], 2).await;
        let project = seed_project(&h.store, "logs").await;

        let id = h
            .manager
            .submit(DeployRequest {
                project_id: project.id,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for_state(&h.store, id, DeploymentState::Live).await;

        let subscription = h.manager.subscribe_logs(id).await.unwrap();
        let steps: Vec<BuildStep> = subscription.history.iter().map(|e| e.step).collect();

        assert!(steps.contains(&BuildStep::Clone));
        assert!(steps.contains(&BuildStep::Detect));
        assert!(steps.contains(&BuildStep::Deploy));
        assert!(steps.contains(&BuildStep::Summary));
    }
}
