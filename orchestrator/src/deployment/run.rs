//! The DEPLOYING phase: launch the container, gate on health, finalize and
//! retire old versions.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use zyphron_common::log::{BuildStep, LogLevel};
use zyphron_common::{ContainerRef, DeploymentState, EventType};

use crate::error::{Error, Result};
use crate::lifecycle::{DeployOpts, HealthCheckSpec};
use crate::persistence::MetadataUpdate;

use super::queue::{step, Built};
use super::PipelineContext;

#[instrument(
    skip_all,
    fields(deployment_id = %built.deployment.id, state = %DeploymentState::Deploying)
)]
pub(super) async fn handle(
    context: &Arc<PipelineContext>,
    built: Built,
    token: &CancellationToken,
) -> Result<()> {
    let Built {
        deployment,
        project,
        pr_number,
        profile,
        image,
        env,
    } = built;
    let id = deployment.id;
    let deploy_started = Instant::now();

    context
        .store
        .update_state(id, DeploymentState::Deploying)
        .await?;
    context.publish_status(id, DeploymentState::Deploying).await;
    context
        .log(
            id,
            BuildStep::Deploy,
            LogLevel::Info,
            format!("starting container from {image}"),
        )
        .await;

    let health = HealthCheckSpec {
        path: "/".to_string(),
        ..Default::default()
    };

    let opts = DeployOpts {
        deployment_id: id,
        project_id: project.id,
        slug: project.slug.clone(),
        environment: deployment.environment,
        pr_number,
        image,
        listen_port: profile.listen_port,
        env,
        limits: context.config.limits,
    };

    let outcome = step(
        token,
        context.config.deploy_timeout,
        "deploy",
        context.lifecycle.deploy(opts),
    )
    .await?;

    context
        .store
        .update_metadata(
            id,
            &MetadataUpdate {
                container_ref: Some(outcome.container.name.clone()),
                external_url: Some(outcome.external_url.clone()),
                ..Default::default()
            },
        )
        .await?;
    context
        .log(
            id,
            BuildStep::Deploy,
            LogLevel::Info,
            format!(
                "container {} started on host port {}",
                outcome.container.name, outcome.container.host_port
            ),
        )
        .await;

    // Verify. A container that was started but never became healthy (or
    // whose deployment was cancelled meanwhile) must not linger.
    context
        .log(
            id,
            BuildStep::Verify,
            LogLevel::Info,
            "waiting for the container to become healthy".to_string(),
        )
        .await;

    let verify_budget = health.budget() + context.config.verify_slack;
    let verified = step(
        token,
        verify_budget,
        "verify",
        context.lifecycle.await_healthy(&outcome.container, &health),
    )
    .await;

    if let Err(error) = verified {
        remove_container(context, &outcome.container).await;
        return Err(error);
    }

    // Finalize
    context
        .store
        .update_metadata(
            id,
            &MetadataUpdate {
                deploy_duration_ms: Some(deploy_started.elapsed().as_millis() as i64),
                finished_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    context.store.update_state(id, DeploymentState::Live).await?;
    context.publish_status(id, DeploymentState::Live).await;
    context
        .log(
            id,
            BuildStep::Summary,
            LogLevel::Info,
            format!("deployment live at {}", outcome.external_url),
        )
        .await;
    context
        .emit(
            EventType::DeploymentLive,
            id,
            project.id,
            json!({
                "external_url": outcome.external_url,
                "container": outcome.container.name,
            }),
        )
        .await;

    // Retention GC runs after LIVE; a failure here never takes the
    // deployment down with it.
    if let Err(error) = context
        .lifecycle
        .cleanup_old_for_project(project.id, context.config.keep_last_deployments)
        .await
    {
        warn!(
            error = &error as &dyn std::error::Error,
            "retention cleanup failed"
        );
    }

    Ok(())
}

async fn remove_container(context: &Arc<PipelineContext>, container: &ContainerRef) {
    if let Err(error) = context.lifecycle.remove(container).await {
        warn!(
            error = &error as &dyn std::error::Error,
            container = %container.name,
            "failed to remove unverified container"
        );
    }
}
