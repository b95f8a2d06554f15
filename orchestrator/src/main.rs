use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use zyphron_common::limits::ResourceLimits;
use zyphron_fabric::{EventBus, LogBus, SqliteEventBus, SqliteLogBus};
use zyphron_orchestrator::args::Args;
use zyphron_orchestrator::builder::DockerImageBuilder;
use zyphron_orchestrator::deployment::PipelineConfig;
use zyphron_orchestrator::git::CliGit;
use zyphron_orchestrator::handlers::RouterBuilder;
use zyphron_orchestrator::lifecycle::{ContainerSettings, LifecycleManager, PortAllocator};
use zyphron_orchestrator::persistence::{DeploymentStore, Persistence};
use zyphron_orchestrator::DeploymentManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,zyphron_orchestrator=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let persistence = Persistence::new(&args.state).await?;

    // Anything left mid-pipeline by a previous process can never complete.
    let abandoned = persistence.fail_abandoned().await?;
    if abandoned > 0 {
        warn!(count = abandoned, "failed deployments abandoned by a previous run");
    }

    let state_url = args.state.to_string_lossy();
    let events: Arc<dyn EventBus> = Arc::new(SqliteEventBus::new(&state_url).await?);
    let logs: Arc<dyn LogBus> = Arc::new(SqliteLogBus::new(&state_url).await?);

    let docker = Docker::connect_with_local_defaults()?;
    let ports = PortAllocator::new(persistence.pool(), args.port_base).await?;
    let lifecycle = LifecycleManager::new(
        docker.clone(),
        ContainerSettings {
            network_name: args.network_name.clone(),
            base_domain: args.base_domain.clone(),
        },
        ports,
    );
    let image_builder = DockerImageBuilder::new(docker, Arc::clone(&logs));

    let deployment_manager = DeploymentManager::builder()
        .config(PipelineConfig {
            max_concurrent_pipelines: args.max_concurrent_pipelines,
            max_concurrent_builds: args.max_concurrent_builds,
            build_timeout: Duration::from_secs(args.build_timeout_secs),
            keep_last_deployments: args.keep_last_deployments,
            base_domain: args.base_domain.clone(),
            container_registry: args.container_registry.clone(),
            projects_dir: args.projects_dir.clone(),
            limits: ResourceLimits::parse(&args.memory_limit, &args.cpu_limit)?,
            ..Default::default()
        })
        .store(Arc::new(persistence.clone()))
        .projects(Arc::new(persistence.clone()))
        .git(Arc::new(CliGit))
        .image_builder(Arc::new(image_builder))
        .lifecycle(Arc::new(lifecycle))
        .events(events)
        .logs(logs)
        .build();

    let router = RouterBuilder::new(deployment_manager).into_router();

    info!(address = %args.api_address, "serving the deployment API");
    axum::Server::bind(&args.api_address)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
