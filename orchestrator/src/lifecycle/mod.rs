//! Container lifecycle: launching, health gating, routing labels, retention
//! GC and host-port management on the shared bridge network.

mod ports;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hyper::client::HttpConnector;
use hyper::Client;
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use zyphron_common::deployment::short_tag;
use zyphron_common::limits::ResourceLimits;
use zyphron_common::{ContainerRef, Environment, ImageRef, ProjectSlug};

pub use ports::PortAllocator;

pub const MANAGED_LABEL: &str = "zyphron.managed";
pub const PROJECT_ID_LABEL: &str = "zyphron.project.id";
pub const PROJECT_SLUG_LABEL: &str = "zyphron.project.slug";
pub const DEPLOYMENT_ID_LABEL: &str = "zyphron.deployment.id";

/// Per-probe deadline used by point-in-time `health()` checks
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long after starting a non-responsive container still counts as
/// `starting` for point-in-time `health()` checks
const STARTING_GRACE_SECS: i64 = 30;

// Client used for health checks
static CLIENT: Lazy<Client<HttpConnector>> = Lazy::new(Client::new);

/// One HTTP probe against the container's published host port. Anything in
/// the 2xx/3xx range passes.
async fn probe(container: &ContainerRef, path: &str, deadline: Duration) -> bool {
    let uri = match format!("http://127.0.0.1:{}{}", container.host_port, path).parse::<hyper::Uri>()
    {
        Ok(uri) => uri,
        Err(_) => return false,
    };

    matches!(
        tokio::time::timeout(deadline, CLIENT.get(uri)).await,
        Ok(Ok(response)) if response.status().is_success() || response.status().is_redirection()
    )
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("container did not become healthy within its budget")]
    HealthCheckTimeout,
    #[error("container reported unhealthy: {0}")]
    Unhealthy(String),
    #[error("port allocation failed: {0}")]
    Ports(#[from] sqlx::Error),
    #[error("container state is malformed: missing {0}")]
    MalformedContainer(&'static str),
}

/// Health gate parameters. The verification budget is
/// `start_period + retries * interval`.
#[derive(Clone, Debug)]
pub struct HealthCheckSpec {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            retries: 3,
            start_period: Duration::from_secs(10),
        }
    }
}

impl HealthCheckSpec {
    pub fn budget(&self) -> Duration {
        self.start_period + self.interval * self.retries
    }
}

/// Everything `deploy` needs to launch one deployment's container
#[derive(Clone, Debug)]
pub struct DeployOpts {
    pub deployment_id: Uuid,
    pub project_id: Uuid,
    pub slug: ProjectSlug,
    pub environment: Environment,
    /// Pull request number for preview deployments created from a webhook
    pub pr_number: Option<u32>,
    pub image: ImageRef,
    pub listen_port: u16,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

#[derive(Clone, Debug)]
pub struct DeployOutcome {
    pub container: ContainerRef,
    pub external_url: String,
    pub internal_url: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
    NotRunning,
}

/// The container capability the pipeline depends on. Implemented over the
/// Docker daemon in production and by stubs in pipeline tests.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync + 'static {
    async fn deploy(&self, opts: DeployOpts) -> Result<DeployOutcome, LifecycleError>;

    /// Polls until the container is healthy, reports unhealthy, or the
    /// health budget is exhausted. No partial success.
    async fn await_healthy(
        &self,
        container: &ContainerRef,
        health: &HealthCheckSpec,
    ) -> Result<(), LifecycleError>;

    async fn health(&self, container: &ContainerRef) -> Result<HealthState, LifecycleError>;

    async fn stop(&self, container: &ContainerRef) -> Result<(), LifecycleError>;

    async fn restart(&self, container: &ContainerRef) -> Result<(), LifecycleError>;

    /// Force-stops and removes the container along with its volumes.
    async fn remove(&self, container: &ContainerRef) -> Result<(), LifecycleError>;

    /// Removes managed containers for the project beyond the newest
    /// `keep_last` by creation time. Returns how many were removed.
    async fn cleanup_old_for_project(
        &self,
        project_id: Uuid,
        keep_last: usize,
    ) -> Result<usize, LifecycleError>;

    async fn logs(
        &self,
        container: &ContainerRef,
        tail: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, LifecycleError>;
}

/// Forms the externally routable hostname for a deployment.
///
/// Previews carry their pull-request number when one is known.
pub fn external_host(
    slug: &ProjectSlug,
    environment: Environment,
    pr_number: Option<u32>,
    base_domain: &str,
) -> String {
    match environment {
        Environment::Production => format!("{slug}.{base_domain}"),
        Environment::Preview => match pr_number {
            Some(n) => format!("{slug}-pr-{n}.{base_domain}"),
            None => format!("{slug}-preview.{base_domain}"),
        },
        Environment::Staging => format!("{slug}-staging.{base_domain}"),
    }
}

/// Which containers to retire: everything past the newest `keep_last` by
/// creation time. Input is `(container, created unix timestamp)`.
fn select_victims<T>(mut containers: Vec<(T, i64)>, keep_last: usize) -> Vec<T> {
    containers.sort_by_key(|(_, created)| std::cmp::Reverse(*created));
    containers
        .into_iter()
        .skip(keep_last)
        .map(|(container, _)| container)
        .collect()
}

#[derive(Clone)]
pub struct ContainerSettings {
    pub network_name: String,
    pub base_domain: String,
}

/// Lifecycle manager over the local Docker daemon
pub struct LifecycleManager {
    docker: Docker,
    settings: ContainerSettings,
    ports: PortAllocator,
}

impl LifecycleManager {
    pub fn new(docker: Docker, settings: ContainerSettings, ports: PortAllocator) -> Self {
        Self {
            docker,
            settings,
            ports,
        }
    }

    /// Creates the shared bridge network on first use.
    async fn ensure_network(&self) -> Result<(), LifecycleError> {
        let name = self.settings.network_name.as_str();

        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(error) => return Err(error.into()),
        }

        info!(network = name, "creating shared bridge network");
        self.docker
            .create_network(CreateNetworkOptions {
                name,
                driver: "bridge",
                check_duplicate: true,
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// Removes a previous container carrying this name, if one exists.
    async fn remove_existing(&self, name: &str) -> Result<(), LifecycleError> {
        match self.docker.inspect_container(name, None).await {
            Ok(existing) => {
                let id = existing
                    .id
                    .ok_or(LifecycleError::MalformedContainer("id"))?;
                warn!(name, "removing stale container with the same name");
                self.force_remove(&id).await;
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Stop (short grace) then remove with volumes. Failures are swallowed;
    /// callers decide whether that matters.
    async fn force_remove(&self, id: &str) {
        let _ = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 1 }))
            .await;
        let _ = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    fn container_labels(&self, opts: &DeployOpts, host: &str, name: &str) -> HashMap<String, String> {
        HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (PROJECT_ID_LABEL.to_string(), opts.project_id.to_string()),
            (PROJECT_SLUG_LABEL.to_string(), opts.slug.to_string()),
            (
                DEPLOYMENT_ID_LABEL.to_string(),
                opts.deployment_id.to_string(),
            ),
            ("traefik.enable".to_string(), "true".to_string()),
            (
                format!("traefik.http.routers.{name}.rule"),
                format!("Host(`{host}`)"),
            ),
            (
                format!("traefik.http.services.{name}.loadbalancer.server.port"),
                opts.listen_port.to_string(),
            ),
        ])
    }

    /// The container's start time, or `None` when it is not running.
    async fn container_started_at(
        &self,
        container_id: &str,
    ) -> Result<Option<DateTime<Utc>>, LifecycleError> {
        let inspection = self.docker.inspect_container(container_id, None).await?;

        let state = inspection
            .state
            .ok_or(LifecycleError::MalformedContainer("state"))?;

        if !state.running.unwrap_or(false) {
            return Ok(None);
        }

        let started_at = state
            .started_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok_or(LifecycleError::MalformedContainer("started_at"))?;

        Ok(Some(started_at))
    }
}

#[async_trait]
impl ContainerOrchestrator for LifecycleManager {
    #[instrument(skip_all, fields(deployment_id = %opts.deployment_id, slug = %opts.slug))]
    async fn deploy(&self, opts: DeployOpts) -> Result<DeployOutcome, LifecycleError> {
        self.ensure_network().await?;

        let name = ContainerRef::name_for(&opts.slug, &opts.deployment_id);
        self.remove_existing(&name).await?;

        let allocation_key = format!("{}-{}", opts.slug, short_tag(&opts.deployment_id));
        let host_port = self.ports.allocate(&allocation_key).await?;

        let host = external_host(
            &opts.slug,
            opts.environment,
            opts.pr_number,
            &self.settings.base_domain,
        );

        let exposed = format!("{}/tcp", opts.listen_port);
        let port_bindings = HashMap::from([(
            exposed.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        )]);

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let config = Config {
            image: Some(opts.image.to_string()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(self.container_labels(&opts, &host, &name)),
            exposed_ports: Some(HashMap::from([(exposed, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                memory: Some(opts.limits.memory_bytes),
                nano_cpus: Some(opts.limits.nano_cpus),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                network_mode: Some(self.settings.network_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await?;

        info!(container = %name, host_port, "container started");

        Ok(DeployOutcome {
            container: ContainerRef {
                id: created.id,
                name,
                host_port,
            },
            external_url: format!("http://{host}"),
            internal_url: format!("http://{}:{}", host, opts.listen_port),
        })
    }

    #[instrument(skip_all, fields(container = %container.name))]
    async fn await_healthy(
        &self,
        container: &ContainerRef,
        health: &HealthCheckSpec,
    ) -> Result<(), LifecycleError> {
        let started = tokio::time::Instant::now();
        let deadline = started + health.budget();
        let mut failures = 0u32;

        loop {
            if self.container_started_at(&container.id).await?.is_none() {
                return Err(LifecycleError::Unhealthy(
                    "container exited before becoming healthy".to_string(),
                ));
            }

            if probe(container, &health.path, health.timeout).await {
                info!("container is healthy");
                return Ok(());
            }

            // Failed probes inside the start period are the service booting,
            // not a verdict.
            if started.elapsed() >= health.start_period {
                failures += 1;
                if failures >= health.retries {
                    return Err(LifecycleError::Unhealthy(format!(
                        "health probe failed {failures} times after the start period"
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LifecycleError::HealthCheckTimeout);
            }

            sleep(health.interval).await;
        }
    }

    async fn health(&self, container: &ContainerRef) -> Result<HealthState, LifecycleError> {
        let Some(started_at) = self.container_started_at(&container.id).await? else {
            return Ok(HealthState::NotRunning);
        };

        if probe(container, "/", DEFAULT_PROBE_TIMEOUT).await {
            return Ok(HealthState::Healthy);
        }

        if Utc::now() - started_at < chrono::Duration::seconds(STARTING_GRACE_SECS) {
            Ok(HealthState::Starting)
        } else {
            Ok(HealthState::Unhealthy)
        }
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), LifecycleError> {
        self.docker
            .stop_container(&container.id, Some(StopContainerOptions { t: 30 }))
            .await
            .map_err(Into::into)
    }

    async fn restart(&self, container: &ContainerRef) -> Result<(), LifecycleError> {
        self.docker
            .restart_container(&container.id, None)
            .await
            .map_err(Into::into)
    }

    async fn remove(&self, container: &ContainerRef) -> Result<(), LifecycleError> {
        self.force_remove(&container.id).await;

        // Container gone, port assignment follows it.
        if let Some(key) = container.name.strip_prefix("zyphron-") {
            self.ports.release(key).await?;
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn cleanup_old_for_project(
        &self,
        project_id: Uuid,
        keep_last: usize,
    ) -> Result<usize, LifecycleError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{MANAGED_LABEL}=true"),
                format!("{PROJECT_ID_LABEL}={project_id}"),
            ],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let candidates: Vec<((String, Option<String>), i64)> = containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary.names.and_then(|names| {
                    names
                        .first()
                        .map(|name| name.trim_start_matches('/').to_string())
                });
                Some(((id, name), summary.created.unwrap_or_default()))
            })
            .collect();

        let victims = select_victims(candidates, keep_last);
        let removed = victims.len();

        for (id, name) in victims {
            debug!(container = %id, "retiring old deployment container");
            // Individual removal failures are logged, not fatal.
            self.force_remove(&id).await;

            let key = name
                .as_deref()
                .and_then(|name| name.strip_prefix("zyphron-"));
            if let Some(key) = key {
                if let Err(error) = self.ports.release(key).await {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to release retired container's port"
                    );
                }
            }
        }

        info!(removed, "project container retention enforced");
        Ok(removed)
    }

    async fn logs(
        &self,
        container: &ContainerRef,
        tail: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, LifecycleError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            since: since.map(|ts| ts.timestamp()).unwrap_or_default(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(&container.id, Some(options));
        let mut lines = Vec::new();

        while let Some(message) = stream.next().await {
            lines.push(message?.to_string());
        }

        Ok(lines)
    }
}
