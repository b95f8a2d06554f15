use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle transitions published on the durable event plane
#[derive(
    sqlx::Type, Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    DeploymentCreated,
    DeploymentStarted,
    BuildStarted,
    BuildCompleted,
    DeploymentLive,
    DeploymentFailed,
    DeploymentCancelled,
}

/// A durable lifecycle event.
///
/// Events are partitioned by `project_id` and outlive the deployments they
/// describe (at least 7 days on the bus).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub deployment_id: Uuid,
    pub project_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[sqlx(json)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        deployment_id: Uuid,
        project_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            deployment_id,
            project_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}
