//! The two planes of the event & log fabric.
//!
//! The [`EventBus`] carries typed lifecycle events: durable, partitioned by
//! project, ordered within a partition, retained for at least seven days.
//! The [`LogBus`] carries build and runtime output: best-effort, high
//! fan-out, with a rolling 24 hour history.
//!
//! Both planes come in two plug-compatible implementations: an in-memory
//! fan-out for tests and single-process setups, and a SQLite-backed one
//! whose history survives restarts. Subscribers consume plain streams and
//! never see a concrete backend.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use zyphron_common::log::StatusUpdate;
use zyphron_common::{Event, LogEntry};

pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryEventBus, InMemoryLogBus};
pub use sqlite::{SqliteEventBus, SqliteLogBus};

/// How long the event plane keeps history
pub const EVENT_RETENTION_DAYS: i64 = 7;

/// How long the log plane keeps history
pub const LOG_RETENTION_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("fabric database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("the fabric writer has shut down")]
    Closed,
}

/// Raised inside a subscription stream when the subscriber fell too far
/// behind and its buffer was dropped. The subscription ends right after;
/// clients resubscribe and re-read history.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("subscriber overflowed, {skipped} messages dropped")]
pub struct SubscriberOverflow {
    pub skipped: u64,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, SubscriberOverflow>> + Send>>;
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry, SubscriberOverflow>> + Send>>;
pub type StatusStream =
    Pin<Box<dyn Stream<Item = Result<StatusUpdate, SubscriberOverflow>> + Send>>;

/// Narrows an event subscription to a project or a single deployment
#[derive(Clone, Copy, Debug, Default)]
pub struct EventFilter {
    pub project_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
}

impl EventFilter {
    pub fn project(project_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            deployment_id: None,
        }
    }

    pub fn deployment(deployment_id: Uuid) -> Self {
        Self {
            project_id: None,
            deployment_id: Some(deployment_id),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.project_id.map_or(true, |id| event.project_id == id)
            && self
                .deployment_id
                .map_or(true, |id| event.deployment_id == id)
    }
}

/// A log subscription: everything appended so far, then the live tail.
///
/// The snapshot and the stream are carved out under the same lock as
/// publishes, so a subscriber sees each entry exactly once, in append order.
pub struct LogSubscription {
    pub history: Vec<LogEntry>,
    pub live: LogStream,
}

/// Position of a consumer group on the event plane. Opaque to consumers;
/// monotonically increasing in publish order.
pub type EventCursor = i64;

/// The durable event plane
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publish a lifecycle event. Publishers are never blocked by slow
    /// subscribers.
    async fn publish(&self, event: Event) -> Result<(), FabricError>;

    /// Subscribe to live events matching `filter`.
    async fn subscribe(&self, filter: EventFilter) -> EventStream;

    /// Events retained for a project since `since`, in publish order.
    async fn history(
        &self,
        project_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>, FabricError>;

    /// At-least-once consumption for a durable consumer group: the next
    /// batch of retained events after the group's committed cursor, in
    /// publish order. Polling again without a commit replays the batch.
    async fn poll_group(
        &self,
        group: &str,
        limit: u32,
    ) -> Result<Vec<(EventCursor, Event)>, FabricError>;

    /// Advance a group's cursor. Everything at or before `cursor` is
    /// considered processed.
    async fn commit_group(&self, group: &str, cursor: EventCursor) -> Result<(), FabricError>;
}

/// The best-effort log plane
#[async_trait]
pub trait LogBus: Send + Sync + 'static {
    /// Append a log entry to the deployment's list and fan it out.
    async fn publish_log(&self, entry: LogEntry) -> Result<(), FabricError>;

    /// Publish a transient status update. No history is kept.
    async fn publish_status(&self, update: StatusUpdate) -> Result<(), FabricError>;

    /// History snapshot plus live tail for one deployment.
    async fn subscribe_logs(&self, deployment_id: Uuid) -> Result<LogSubscription, FabricError>;

    /// Live status updates for one deployment.
    async fn subscribe_status(&self, deployment_id: Uuid) -> StatusStream;

    /// The retained log list for a deployment.
    async fn logs_so_far(&self, deployment_id: Uuid) -> Result<Vec<LogEntry>, FabricError>;
}

/// Wraps a broadcast receiver into a stream that surfaces one
/// [`SubscriberOverflow`] and then terminates, instead of silently skipping
/// messages on lag.
pub(crate) fn overflow_terminated<T: Clone + Send + 'static>(
    receiver: broadcast::Receiver<T>,
) -> Pin<Box<dyn Stream<Item = Result<T, SubscriberOverflow>> + Send>> {
    let stream = BroadcastStream::new(receiver)
        .map(|item| {
            item.map_err(|BroadcastStreamRecvError::Lagged(skipped)| SubscriberOverflow { skipped })
        })
        .scan(false, |overflowed, item| {
            if *overflowed {
                return future::ready(None);
            }
            *overflowed = item.is_err();
            future::ready(Some(item))
        });

    Box::pin(stream)
}
