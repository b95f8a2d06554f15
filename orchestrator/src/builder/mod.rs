//! Image production: Dockerfile synthesis, build-context assembly and the
//! bollard-backed build/push driver.

mod context;
mod dockerfile;
mod error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bollard::image::{BuildImageOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use zyphron_common::limits::ResourceLimits;
use zyphron_common::log::{BuildStep, LogEntry};
use zyphron_common::ImageRef;
use zyphron_fabric::LogBus;

use crate::detector::BuildProfile;

pub use context::{build_context, ensure_dockerignore, IgnoreRules};
pub use dockerfile::{synthesize, DEFAULT_DOCKERIGNORE, SYNTHETIC_DOCKERFILE};
pub use error::BuilderError;

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub deployment_id: Uuid,
    pub image: ImageRef,
    pub source_path: PathBuf,
    pub profile: BuildProfile,
    /// Plaintext environment for the target environment; production builds
    /// see these as build args (e.g. `NEXT_PUBLIC_*`).
    pub build_args: HashMap<String, String>,
    pub limits: ResourceLimits,
}

#[derive(Clone, Debug)]
pub struct BuildOutput {
    pub image: ImageRef,
    pub duration_ms: i64,
}

#[derive(Clone, Debug, Default)]
pub struct PushOutput {
    pub digest: Option<String>,
}

/// The narrow image capability the pipeline depends on. The production
/// implementation talks to the Docker daemon; tests substitute stubs.
#[async_trait]
pub trait ImageBuilder: Send + Sync + 'static {
    /// Produce a tagged image from a source tree and its profile.
    async fn build(
        &self,
        request: &BuildRequest,
        cancel: CancellationToken,
    ) -> Result<BuildOutput, BuilderError>;

    /// Push a built image to the configured registry.
    async fn push(&self, image: &ImageRef) -> Result<PushOutput, BuilderError>;

    /// Point the project's `latest` alias at this image.
    async fn alias_latest(&self, image: &ImageRef) -> Result<(), BuilderError>;
}

/// Builds images through the Docker daemon, forwarding every emitted line
/// to the log fabric tagged `step=build`.
pub struct DockerImageBuilder {
    docker: Docker,
    logs: Arc<dyn LogBus>,
}

impl DockerImageBuilder {
    pub fn new(docker: Docker, logs: Arc<dyn LogBus>) -> Self {
        Self { docker, logs }
    }

    async fn forward_line(&self, deployment_id: Uuid, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        // Log fan-out is best effort; a fabric hiccup never fails a build.
        let _ = self
            .logs
            .publish_log(LogEntry::new(deployment_id, BuildStep::Build, line))
            .await;
    }

    async fn drive(
        &self,
        request: &BuildRequest,
        dockerfile_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BuilderError> {
        let tarball = context::build_context(&request.source_path)?;
        debug!(bytes = tarball.len(), "assembled build context");

        let options = BuildImageOptions {
            dockerfile: dockerfile_name.to_string(),
            t: request.image.to_string(),
            rm: true,
            forcerm: true,
            memory: Some(request.limits.memory_bytes as u64),
            cpuperiod: Some(100_000),
            cpuquota: Some((request.limits.nano_cpus / 10_000) as u64),
            buildargs: request.build_args.clone(),
            labels: HashMap::from([(
                "zyphron.deployment.id".to_string(),
                request.deployment_id.to_string(),
            )]),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(tarball.into()));

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Err(BuilderError::Cancelled),
                message = stream.next() => message,
            };

            let Some(message) = message else { break };
            let info = message.map_err(|e| BuilderError::Driver(e.to_string()))?;

            if let Some(error) = info.error {
                return Err(BuilderError::Driver(error));
            }
            if let Some(output) = info.stream {
                for line in output.lines() {
                    self.forward_line(request.deployment_id, line).await;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    #[instrument(skip_all, fields(deployment_id = %request.deployment_id, image = %request.image))]
    async fn build(
        &self,
        request: &BuildRequest,
        cancel: CancellationToken,
    ) -> Result<BuildOutput, BuilderError> {
        let started = Instant::now();
        let synthetic_path = request.source_path.join(SYNTHETIC_DOCKERFILE);

        let dockerfile_name = if request.profile.has_user_dockerfile {
            info!("using the repository's own Dockerfile");
            "Dockerfile".to_string()
        } else {
            let rendered = dockerfile::synthesize(&request.profile)?;
            tokio::fs::write(&synthetic_path, rendered).await?;
            SYNTHETIC_DOCKERFILE.to_string()
        };

        context::ensure_dockerignore(&request.source_path).await?;

        let result = self.drive(request, &dockerfile_name, &cancel).await;

        // The synthetic recipe never outlives the build attempt.
        if !request.profile.has_user_dockerfile {
            let _ = tokio::fs::remove_file(&synthetic_path).await;
        }

        result?;

        let duration_ms = started.elapsed().as_millis() as i64;
        info!(duration_ms, "image built");

        Ok(BuildOutput {
            image: request.image.clone(),
            duration_ms,
        })
    }

    #[instrument(skip_all, fields(image = %image))]
    async fn push(&self, image: &ImageRef) -> Result<PushOutput, BuilderError> {
        let options = PushImageOptions {
            tag: image.tag.clone(),
        };

        let mut stream = self.docker.push_image(&image.name(), Some(options), None);
        let mut digest = None;

        while let Some(message) = stream.next().await {
            let info = message.map_err(|e| BuilderError::Push(e.to_string()))?;

            if let Some(error) = info.error {
                return Err(BuilderError::Push(error));
            }
            if let Some(status) = info.status {
                if let Some(rest) = status.split("digest: ").nth(1) {
                    digest = rest.split_whitespace().next().map(str::to_string);
                }
            }
        }

        info!(?digest, "image pushed");
        Ok(PushOutput { digest })
    }

    async fn alias_latest(&self, image: &ImageRef) -> Result<(), BuilderError> {
        self.docker
            .tag_image(
                &image.to_string(),
                Some(TagImageOptions {
                    repo: image.name(),
                    tag: "latest".to_string(),
                }),
            )
            .await
            .map_err(|e| BuilderError::Driver(e.to_string()))
    }
}
