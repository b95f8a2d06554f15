//! SQLite-backed fabric. History survives process restarts; fan-out still
//! happens over in-process broadcast channels. The event writer is a single
//! task, which is what provides per-project publish ordering.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json as SqlxJson;
use sqlx::Row;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, warn};
use uuid::Uuid;

use zyphron_common::log::StatusUpdate;
use zyphron_common::{Event, LogEntry};

use crate::{
    overflow_terminated, EventBus, EventCursor, EventFilter, EventStream, FabricError, LogBus,
    LogSubscription, StatusStream, EVENT_RETENTION_DAYS, LOG_RETENTION_HOURS,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LOG_CHANNEL_CAPACITY: usize = 1024;
const STATUS_CHANNEL_CAPACITY: usize = 64;
const PRUNE_INTERVAL: StdDuration = StdDuration::from_secs(60 * 60);

/// Durable event plane over a SQLite table plus a broadcast channel for the
/// live tail.
pub struct SqliteEventBus {
    pool: SqlitePool,
    sender: broadcast::Sender<Event>,
    write: mpsc::UnboundedSender<Event>,
}

impl SqliteEventBus {
    pub async fn new(path: &str) -> Result<Self, FabricError> {
        if !Path::new(path).exists() {
            Sqlite::create_database(path).await?;
        }

        let pool = SqlitePool::connect(path).await?;
        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, FabricError> {
        // A second connection would open a second, empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, FabricError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,      -- Event id
                event_type TEXT,          -- Lifecycle transition kind
                deployment_id TEXT,
                project_id TEXT,          -- Partition key
                timestamp TEXT,
                payload TEXT              -- JSON document
            );

            CREATE INDEX IF NOT EXISTS idx_events_project ON events (project_id, timestamp);

            CREATE TABLE IF NOT EXISTS event_consumer_offsets (
                grp TEXT PRIMARY KEY,  -- Consumer group name
                cursor INTEGER NOT NULL
            );",
        )
        .execute(&pool)
        .await?;

        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (write, mut write_recv) = mpsc::unbounded_channel::<Event>();

        // Single writer: inserts then fans out, one event at a time, so
        // subscribers observe each partition in publish order.
        let writer_pool = pool.clone();
        let writer_sender = sender.clone();
        tokio::spawn(async move {
            while let Some(event) = write_recv.recv().await {
                let result = sqlx::query(
                    "INSERT INTO events (id, event_type, deployment_id, project_id, timestamp, payload)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(event.id)
                .bind(event.event_type)
                .bind(event.deployment_id)
                .bind(event.project_id)
                .bind(event.timestamp)
                .bind(SqlxJson(event.payload.clone()))
                .execute(&writer_pool)
                .await;

                if let Err(error) = result {
                    error!(
                        error = &error as &dyn std::error::Error,
                        "failed to persist lifecycle event"
                    );
                }

                let _ = writer_sender.send(event);
            }
        });

        let prune_pool = pool.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                let horizon = Utc::now() - Duration::days(EVENT_RETENTION_DAYS);
                if let Err(error) = sqlx::query("DELETE FROM events WHERE timestamp < ?")
                    .bind(horizon)
                    .execute(&prune_pool)
                    .await
                {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to prune expired events"
                    );
                }
            }
        });

        Ok(Self {
            pool,
            sender,
            write,
        })
    }
}

#[async_trait]
impl EventBus for SqliteEventBus {
    async fn publish(&self, event: Event) -> Result<(), FabricError> {
        self.write.send(event).map_err(|_| FabricError::Closed)
    }

    async fn subscribe(&self, filter: EventFilter) -> EventStream {
        Box::pin(
            overflow_terminated(self.sender.subscribe()).filter(move |item| {
                futures::future::ready(match item {
                    Ok(event) => filter.matches(event),
                    Err(_) => true,
                })
            }),
        )
    }

    async fn history(
        &self,
        project_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>, FabricError> {
        sqlx::query_as(
            "SELECT * FROM events WHERE project_id = ? AND timestamp >= ? ORDER BY timestamp, rowid",
        )
        .bind(project_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn poll_group(
        &self,
        group: &str,
        limit: u32,
    ) -> Result<Vec<(EventCursor, Event)>, FabricError> {
        let rows = sqlx::query(
            "SELECT rowid, id, event_type, deployment_id, project_id, timestamp, payload
             FROM events
             WHERE rowid > COALESCE(
                 (SELECT cursor FROM event_consumer_offsets WHERE grp = ?), 0)
             ORDER BY rowid
             LIMIT ?",
        )
        .bind(group)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let cursor: EventCursor = row.get("rowid");
                let event = Event {
                    id: row.get("id"),
                    event_type: row.get("event_type"),
                    deployment_id: row.get("deployment_id"),
                    project_id: row.get("project_id"),
                    timestamp: row.get("timestamp"),
                    payload: row.get::<SqlxJson<serde_json::Value>, _>("payload").0,
                };
                (cursor, event)
            })
            .collect())
    }

    async fn commit_group(&self, group: &str, cursor: EventCursor) -> Result<(), FabricError> {
        sqlx::query(
            "INSERT INTO event_consumer_offsets (grp, cursor) VALUES (?, ?)
             ON CONFLICT (grp) DO UPDATE SET cursor = MAX(cursor, excluded.cursor)",
        )
        .bind(group)
        .bind(cursor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Log plane whose 24 hour history lives in a SQLite table. Appends and
/// subscription snapshots share one lock, preserving the exactly-once,
/// in-order contract for late subscribers.
pub struct SqliteLogBus {
    pool: SqlitePool,
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<LogEntry>>>>,
    status: broadcast::Sender<StatusUpdate>,
}

impl SqliteLogBus {
    pub async fn new(path: &str) -> Result<Self, FabricError> {
        if !Path::new(path).exists() {
            Sqlite::create_database(path).await?;
        }

        let pool = SqlitePool::connect(path).await?;
        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, FabricError> {
        // A second connection would open a second, empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, FabricError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logs (
                deployment_id TEXT,
                timestamp TEXT,
                level TEXT,
                step TEXT,     -- Pipeline step the line belongs to
                line TEXT,
                progress REAL
            );

            CREATE INDEX IF NOT EXISTS idx_logs_deployment ON logs (deployment_id, timestamp);",
        )
        .execute(&pool)
        .await?;

        let channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<LogEntry>>>> = Default::default();
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let prune_pool = pool.clone();
        let prune_channels = Arc::clone(&channels);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                let horizon = Utc::now() - Duration::hours(LOG_RETENTION_HOURS);
                if let Err(error) = sqlx::query("DELETE FROM logs WHERE timestamp < ?")
                    .bind(horizon)
                    .execute(&prune_pool)
                    .await
                {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to prune expired logs"
                    );
                }

                // Channels with no remaining subscribers can be recreated on
                // demand; drop them to bound the map.
                prune_channels
                    .lock()
                    .await
                    .retain(|_, sender| sender.receiver_count() > 0);
            }
        });

        Ok(Self {
            pool,
            channels,
            status,
        })
    }

    async fn insert(&self, entry: &LogEntry) -> Result<(), FabricError> {
        sqlx::query(
            "INSERT INTO logs (deployment_id, timestamp, level, step, line, progress)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.deployment_id)
        .bind(entry.timestamp)
        .bind(entry.level)
        .bind(entry.step)
        .bind(&entry.line)
        .bind(entry.progress)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, deployment_id: Uuid) -> Result<Vec<LogEntry>, FabricError> {
        sqlx::query_as(
            "SELECT * FROM logs WHERE deployment_id = ? ORDER BY timestamp, rowid",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[async_trait]
impl LogBus for SqliteLogBus {
    async fn publish_log(&self, entry: LogEntry) -> Result<(), FabricError> {
        let mut channels = self.channels.lock().await;

        self.insert(&entry).await?;

        if let Some(sender) = channels.get(&entry.deployment_id) {
            let _ = sender.send(entry);
        } else {
            let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
            let _ = sender.send(entry.clone());
            channels.insert(entry.deployment_id, sender);
        }

        Ok(())
    }

    async fn publish_status(&self, update: StatusUpdate) -> Result<(), FabricError> {
        let _ = self.status.send(update);
        Ok(())
    }

    async fn subscribe_logs(&self, deployment_id: Uuid) -> Result<LogSubscription, FabricError> {
        let mut channels = self.channels.lock().await;

        let history = self.fetch(deployment_id).await?;
        let sender = channels.entry(deployment_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
            sender
        });

        Ok(LogSubscription {
            history,
            live: overflow_terminated(sender.subscribe()),
        })
    }

    async fn subscribe_status(&self, deployment_id: Uuid) -> StatusStream {
        Box::pin(
            overflow_terminated(self.status.subscribe()).filter(move |item| {
                futures::future::ready(match item {
                    Ok(update) => update.deployment_id == deployment_id,
                    Err(_) => true,
                })
            }),
        )
    }

    async fn logs_so_far(&self, deployment_id: Uuid) -> Result<Vec<LogEntry>, FabricError> {
        self.fetch(deployment_id).await
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use zyphron_common::log::BuildStep;
    use zyphron_common::EventType;

    use super::*;

    #[tokio::test]
    async fn events_survive_in_history_and_fan_out_live() {
        let bus = SqliteEventBus::new_in_memory().await.unwrap();
        let project = Uuid::new_v4();
        let deployment = Uuid::new_v4();

        let mut stream = bus.subscribe(EventFilter::project(project)).await;

        bus.publish(Event::new(
            EventType::DeploymentCreated,
            deployment,
            project,
            serde_json::json!({ "branch": "main" }),
        ))
        .await
        .unwrap();

        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.event_type, EventType::DeploymentCreated);

        let history = bus
            .history(project, Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["branch"], "main");
    }

    #[tokio::test]
    async fn consumer_groups_replay_until_committed() {
        let bus = SqliteEventBus::new_in_memory().await.unwrap();
        let project = Uuid::new_v4();
        let deployment = Uuid::new_v4();

        for event_type in [
            EventType::DeploymentCreated,
            EventType::BuildStarted,
            EventType::BuildCompleted,
        ] {
            bus.publish(Event::new(
                event_type,
                deployment,
                project,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        }

        // Give the single writer a moment to drain.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if bus.poll_group("workers", 10).await.unwrap().len() == 3 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "events never landed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Polling again without a commit replays the same batch.
        let batch = bus.poll_group("workers", 10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].1.event_type, EventType::DeploymentCreated);

        // Another group has its own cursor.
        assert_eq!(bus.poll_group("bridge", 10).await.unwrap().len(), 3);

        let last = batch.last().unwrap().0;
        bus.commit_group("workers", last).await.unwrap();
        assert!(bus.poll_group("workers", 10).await.unwrap().is_empty());
        assert_eq!(bus.poll_group("bridge", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn log_history_is_ordered_and_snapshot_consistent() {
        let bus = SqliteLogBus::new_in_memory().await.unwrap();
        let id = Uuid::new_v4();

        for line in ["clone", "detect", "build"] {
            bus.publish_log(LogEntry::new(id, BuildStep::Build, line))
                .await
                .unwrap();
        }

        let mut subscription = bus.subscribe_logs(id).await.unwrap();
        assert_eq!(
            subscription
                .history
                .iter()
                .map(|e| e.line.as_str())
                .collect::<Vec<_>>(),
            vec!["clone", "detect", "build"]
        );

        bus.publish_log(LogEntry::new(id, BuildStep::Build, "push"))
            .await
            .unwrap();

        let live = subscription.live.next().await.unwrap().unwrap();
        assert_eq!(live.line, "push");

        let all = bus.logs_so_far(id).await.unwrap();
        assert_eq!(all.len(), 4);
    }
}
