use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Severity of a pipeline or runtime log line
#[derive(
    sqlx::Type, Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
    Debug,
}

/// The pipeline step a log line was produced in
#[derive(
    sqlx::Type, Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BuildStep {
    Clone,
    Detect,
    Build,
    Push,
    Deploy,
    Verify,
    Summary,
}

/// A single log line attached to a deployment.
///
/// Entries are ordered per deployment by `(timestamp, arrival sequence)` and
/// retained on the log plane for 24 hours.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, sqlx::FromRow)]
pub struct LogEntry {
    pub deployment_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub step: BuildStep,
    pub line: String,
    pub progress: Option<f32>,
}

impl LogEntry {
    pub fn new(deployment_id: Uuid, step: BuildStep, line: impl Into<String>) -> Self {
        Self {
            deployment_id,
            timestamp: Utc::now(),
            level: LogLevel::Info,
            step,
            line: line.into(),
            progress: None,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

/// A transient status update published on the status channel. No history is
/// kept for these; late subscribers poll the store instead.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub deployment_id: Uuid,
    pub state: crate::deployment::DeploymentState,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}
