//! The BUILDING phase: clone, detect, build, push.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use zyphron_common::log::{BuildStep, LogLevel};
use zyphron_common::{Deployment, DeploymentState, EventType, ImageRef, Project};

use crate::builder::BuildRequest;
use crate::error::{Error, Result};
use crate::git::CloneRequest;

use super::{PipelineContext, Queued};

/// Push retry backoff: 250ms, 1s, 4s
const PUSH_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];

/// A deployment whose image exists, ready for the DEPLOYING phase
#[derive(Clone, Debug)]
pub struct Built {
    pub deployment: Deployment,
    pub project: Project,
    pub pr_number: Option<u32>,
    pub profile: crate::detector::BuildProfile,
    pub image: ImageRef,
    /// Plaintext runtime environment for the container
    pub env: Vec<(String, String)>,
}

/// Runs one fallible step under the deployment's cancellation token and a
/// deadline.
pub(super) async fn step<T, E>(
    token: &CancellationToken,
    deadline: Duration,
    name: &'static str,
    operation: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    Error: From<E>,
{
    let guarded = async { operation.await.map_err(Error::from) };

    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        outcome = timeout(deadline, guarded) => {
            outcome.map_err(|_| Error::StepTimeout { step: name })?
        }
    }
}

#[instrument(
    skip_all,
    fields(deployment_id = %queued.deployment.id, state = %DeploymentState::Building)
)]
pub(super) async fn handle(
    context: &Arc<PipelineContext>,
    queued: Queued,
    token: &CancellationToken,
    work_dir: &Path,
) -> Result<Built> {
    let Queued {
        deployment,
        project,
        pr_number,
    } = queued;
    let id = deployment.id;

    context
        .store
        .update_state(id, DeploymentState::Building)
        .await?;
    context
        .store
        .update_metadata(
            id,
            &super::MetadataUpdate {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    context.publish_status(id, DeploymentState::Building).await;
    context
        .emit(EventType::DeploymentStarted, id, project.id, json!({}))
        .await;

    // Clone
    context
        .emit(
            EventType::BuildStarted,
            id,
            project.id,
            json!({ "branch": deployment.branch }),
        )
        .await;
    context
        .log(
            id,
            BuildStep::Clone,
            LogLevel::Info,
            format!("cloning {} at {}", project.repo_url, deployment.branch),
        )
        .await;

    let clone_request = CloneRequest {
        repo_url: project.repo_url.clone(),
        branch: deployment.branch.clone(),
        commit_sha: deployment.commit_sha.clone(),
        work_dir: work_dir.to_path_buf(),
        auth_token: None,
        root_directory: project.root_directory.clone(),
    };
    let clone = step(
        token,
        context.config.clone_timeout,
        "clone",
        context.git.clone_repo(&clone_request),
    )
    .await?;

    context
        .store
        .update_metadata(
            id,
            &super::MetadataUpdate {
                commit_sha: Some(clone.commit_sha.clone()),
                commit_message: Some(clone.commit_message.clone()),
                commit_author: Some(clone.commit_author.clone()),
                ..Default::default()
            },
        )
        .await?;
    context
        .log(
            id,
            BuildStep::Clone,
            LogLevel::Info,
            format!(
                "checked out {} ({})",
                &clone.commit_sha[..clone.commit_sha.len().min(8)],
                clone.commit_message
            ),
        )
        .await;

    // Detect
    let profile = context.detector.detect(&clone.path);
    context
        .log(
            id,
            BuildStep::Detect,
            LogLevel::Info,
            format!(
                "detected framework={} package_manager={} port={} confidence={}",
                profile.framework, profile.package_manager, profile.listen_port, profile.confidence
            ),
        )
        .await;

    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // Environment: stored variables for this environment plus what the
    // profile adds; the container port is always present.
    let mut env: Vec<(String, String)> = context
        .projects
        .env_vars(project.id, deployment.environment)
        .await?
        .into_iter()
        .map(|var| (var.key, var.value))
        .collect();
    for (key, value) in &profile.env_additions {
        env.push((key.clone(), value.clone()));
    }
    env.push(("PORT".to_string(), profile.listen_port.to_string()));

    // Build, gated so at most `max_concurrent_builds` run at once while
    // other pipelines keep cloning and verifying.
    let image = ImageRef::for_deployment(&context.config.container_registry, &project.id, &id);
    let build_args: HashMap<String, String> = env.iter().cloned().collect();

    let permit = tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled),
        permit = context.build_gate.acquire() => {
            permit.map_err(|_| Error::Internal(anyhow::anyhow!("build gate closed")))?
        }
    };

    context
        .log(
            id,
            BuildStep::Build,
            LogLevel::Info,
            format!("building image {image}"),
        )
        .await;

    let build_request = BuildRequest {
        deployment_id: id,
        image: image.clone(),
        source_path: clone.path.clone(),
        profile: profile.clone(),
        build_args,
        limits: context.config.limits,
    };
    let output = step(
        token,
        context.config.build_timeout,
        "build",
        context.builder.build(&build_request, token.child_token()),
    )
    .await;
    drop(permit);
    let output = output?;

    context
        .store
        .update_metadata(
            id,
            &super::MetadataUpdate {
                image_ref: Some(image.to_string()),
                build_duration_ms: Some(output.duration_ms),
                ..Default::default()
            },
        )
        .await?;
    context
        .log(
            id,
            BuildStep::Build,
            LogLevel::Info,
            format!("image built in {} ms", output.duration_ms),
        )
        .await;

    // Push. Non-fatal: a single-node runtime can run the local image.
    if context.config.container_registry.is_empty() {
        info!("no registry configured, keeping image local");
    } else if token.is_cancelled() {
        return Err(Error::Cancelled);
    } else {
        push_with_retries(context, id, &image).await;
    }

    context
        .emit(
            EventType::BuildCompleted,
            id,
            project.id,
            json!({
                "image": image.to_string(),
                "duration_ms": output.duration_ms,
            }),
        )
        .await;

    Ok(Built {
        deployment,
        project,
        pr_number,
        profile,
        image,
        env,
    })
}

/// Pushes with exponential backoff. Failure is logged and recorded on the
/// log plane but never fails the pipeline.
async fn push_with_retries(context: &Arc<PipelineContext>, id: uuid::Uuid, image: &ImageRef) {
    let mut attempt = 0;
    loop {
        match timeout(context.config.push_timeout, context.builder.push(image)).await {
            Ok(Ok(output)) => {
                context
                    .log(
                        id,
                        BuildStep::Push,
                        LogLevel::Info,
                        match output.digest {
                            Some(digest) => format!("pushed {image} ({digest})"),
                            None => format!("pushed {image}"),
                        },
                    )
                    .await;

                if let Err(error) = context.builder.alias_latest(image).await {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to alias latest tag"
                    );
                }
                return;
            }
            Ok(Err(error)) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    attempt = attempt + 1,
                    "image push failed"
                );
            }
            Err(_) => {
                warn!(attempt = attempt + 1, "image push timed out");
            }
        }

        let Some(backoff) = PUSH_BACKOFF.get(attempt) else {
            break;
        };
        sleep(*backoff).await;
        attempt += 1;
    }

    context
        .log(
            id,
            BuildStep::Push,
            LogLevel::Warn,
            "PUSH_FAILED: registry unreachable, continuing with the local image".to_string(),
        )
        .await;
}
