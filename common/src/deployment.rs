use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// States a deployment can be in
#[derive(
    sqlx::Type, Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum DeploymentState {
    /// Accepted and persisted, waiting for a pipeline worker
    #[default]
    Pending,

    /// Source is being cloned, classified and turned into an image
    Building,

    /// Image exists, a container is being created and health gated
    Deploying,

    /// Container is healthy and routable
    Live,

    /// Pipeline ended with an error
    Failed,

    /// Pipeline was cancelled by a caller
    Cancelled,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Live | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Forward progress follows Pending -> Building -> Deploying -> Live,
    /// with Failed and Cancelled reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: DeploymentState) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            Self::Pending => false,
            Self::Building => matches!(self, Self::Pending),
            Self::Deploying => matches!(self, Self::Building),
            Self::Live => matches!(self, Self::Deploying),
            Self::Failed | Self::Cancelled => true,
        }
    }
}

/// Which environment a deployment is taking place in
#[derive(
    sqlx::Type, Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Environment {
    #[default]
    Production,
    Preview,
    Staging,
}

/// One end-to-end attempt to take a specific commit of a project to a
/// running container. Owned by the store; mutated only by the orchestrator
/// while non-terminal.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, sqlx::FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub state: DeploymentState,
    pub environment: Environment,
    pub branch: String,
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
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    /// The short hex tag derived from the deployment id, used for image tags
    /// and container names. A retry gets a fresh id, hence a fresh tag.
    pub fn short_tag(&self) -> String {
        short_tag(&self.id)
    }
}

pub fn short_tag(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Structured failure classes surfaced to callers on FAILED deployments
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    CloneFailed,
    CloneAuthFailed,
    DetectionFailed,
    DockerfileSynthesisFailed,
    BuildFailed,
    PushFailed,
    DeployFailed,
    HealthCheckTimeout,
    StepTimeout,
    Cancelled,
    Conflict,
    Internal,
}

impl ErrorKind {
    /// A short message safe to show to a caller without leaking internals.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::CloneFailed => "could not fetch the repository",
            Self::CloneAuthFailed => "repository authentication failed",
            Self::DetectionFailed => "could not classify the source tree",
            Self::DockerfileSynthesisFailed => "could not generate a build recipe",
            Self::BuildFailed => "the image build failed",
            Self::PushFailed => "pushing the image to the registry failed",
            Self::DeployFailed => "the container could not be started",
            Self::HealthCheckTimeout => "the service did not become healthy in time",
            Self::StepTimeout => "a pipeline step exceeded its deadline",
            Self::Cancelled => "the deployment was cancelled",
            Self::Conflict => "another deployment is already in progress",
            Self::Internal => "an internal error occurred",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn state_deser() {
        assert_eq!(
            DeploymentState::Building,
            DeploymentState::from_str("builDing").unwrap()
        );
        assert_eq!(
            DeploymentState::Pending,
            DeploymentState::from_str("pending").unwrap()
        );
        assert_eq!(
            DeploymentState::Cancelled,
            DeploymentState::from_str("Cancelled").unwrap()
        );
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [
            DeploymentState::Live,
            DeploymentState::Failed,
            DeploymentState::Cancelled,
        ] {
            for next in [
                DeploymentState::Pending,
                DeploymentState::Building,
                DeploymentState::Deploying,
                DeploymentState::Live,
                DeploymentState::Failed,
                DeploymentState::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn forward_path_is_the_only_progress() {
        assert!(DeploymentState::Pending.can_transition_to(DeploymentState::Building));
        assert!(DeploymentState::Building.can_transition_to(DeploymentState::Deploying));
        assert!(DeploymentState::Deploying.can_transition_to(DeploymentState::Live));

        assert!(!DeploymentState::Pending.can_transition_to(DeploymentState::Deploying));
        assert!(!DeploymentState::Pending.can_transition_to(DeploymentState::Live));
        assert!(!DeploymentState::Building.can_transition_to(DeploymentState::Live));
        assert!(!DeploymentState::Deploying.can_transition_to(DeploymentState::Building));
    }

    #[test]
    fn failure_reachable_from_any_non_terminal() {
        for state in [
            DeploymentState::Pending,
            DeploymentState::Building,
            DeploymentState::Deploying,
        ] {
            assert!(state.can_transition_to(DeploymentState::Failed));
            assert!(state.can_transition_to(DeploymentState::Cancelled));
        }
    }

    #[test]
    fn short_tag_is_eight_hex_chars() {
        let id = Uuid::new_v4();
        let tag = short_tag(&id);
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn error_kind_round_trips_screaming_case() {
        assert_eq!(ErrorKind::BuildFailed.to_string(), "BUILD_FAILED");
        assert_eq!(
            ErrorKind::from_str("HEALTH_CHECK_TIMEOUT").unwrap(),
            ErrorKind::HealthCheckTimeout
        );
    }
}
