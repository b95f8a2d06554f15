//! In-memory fan-out backends. The default for tests, and sufficient for a
//! single-process deployment where history does not need to survive a
//! restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
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

#[derive(Default)]
struct EventLog {
    /// Retained events, tagged with their publish sequence number
    entries: Vec<(EventCursor, Event)>,
    next_cursor: EventCursor,
    /// Committed cursor per consumer group
    offsets: HashMap<String, EventCursor>,
}

/// Durable-enough event plane for tests: retains history in memory and fans
/// out live events over a broadcast channel. Publishes take a single lock,
/// which is what gives the per-project ordering guarantee.
pub struct InMemoryEventBus {
    log: Mutex<EventLog>,
    sender: broadcast::Sender<Event>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            log: Mutex::new(EventLog::default()),
            sender,
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<(), FabricError> {
        let mut log = self.log.lock().await;

        let horizon = Utc::now() - Duration::days(EVENT_RETENTION_DAYS);
        log.entries.retain(|(_, event)| event.timestamp >= horizon);

        log.next_cursor += 1;
        let cursor = log.next_cursor;
        log.entries.push((cursor, event.clone()));

        // A send error only means there are no live subscribers right now.
        let _ = self.sender.send(event);

        Ok(())
    }

    async fn subscribe(&self, filter: EventFilter) -> EventStream {
        let receiver = {
            // Taking the lock orders this subscription against in-flight
            // publishes.
            let _log = self.log.lock().await;
            self.sender.subscribe()
        };

        Box::pin(
            overflow_terminated(receiver)
                .filter(move |item| {
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
        Ok(self
            .log
            .lock()
            .await
            .entries
            .iter()
            .filter(|(_, event)| event.project_id == project_id && event.timestamp >= since)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn poll_group(
        &self,
        group: &str,
        limit: u32,
    ) -> Result<Vec<(EventCursor, Event)>, FabricError> {
        let log = self.log.lock().await;
        let committed = log.offsets.get(group).copied().unwrap_or(0);

        Ok(log
            .entries
            .iter()
            .filter(|(cursor, _)| *cursor > committed)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn commit_group(&self, group: &str, cursor: EventCursor) -> Result<(), FabricError> {
        let mut log = self.log.lock().await;
        let committed = log.offsets.entry(group.to_string()).or_insert(0);
        *committed = (*committed).max(cursor);
        Ok(())
    }
}

struct LogChannel {
    history: Vec<LogEntry>,
    sender: broadcast::Sender<LogEntry>,
    last_append: DateTime<Utc>,
}

impl LogChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            history: Vec::new(),
            sender,
            last_append: Utc::now(),
        }
    }
}

/// Best-effort log plane backed by per-deployment broadcast channels.
///
/// History snapshots and appends share one lock so that a late subscriber
/// observes exactly the prefix already appended plus all subsequent
/// entries, without duplication or reordering.
pub struct InMemoryLogBus {
    deployments: Arc<Mutex<HashMap<Uuid, LogChannel>>>,
    status: broadcast::Sender<StatusUpdate>,
}

impl Default for InMemoryLogBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogBus {
    pub fn new() -> Self {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            deployments: Arc::new(Mutex::new(HashMap::new())),
            status,
        }
    }

    fn prune(deployments: &mut HashMap<Uuid, LogChannel>) {
        let horizon = Utc::now() - Duration::hours(LOG_RETENTION_HOURS);
        deployments.retain(|_, channel| channel.last_append >= horizon);
    }
}

#[async_trait]
impl LogBus for InMemoryLogBus {
    async fn publish_log(&self, entry: LogEntry) -> Result<(), FabricError> {
        let mut deployments = self.deployments.lock().await;
        Self::prune(&mut deployments);

        let channel = deployments
            .entry(entry.deployment_id)
            .or_insert_with(LogChannel::new);

        channel.history.push(entry.clone());
        channel.last_append = Utc::now();
        let _ = channel.sender.send(entry);

        Ok(())
    }

    async fn publish_status(&self, update: StatusUpdate) -> Result<(), FabricError> {
        let _ = self.status.send(update);
        Ok(())
    }

    async fn subscribe_logs(&self, deployment_id: Uuid) -> Result<LogSubscription, FabricError> {
        let mut deployments = self.deployments.lock().await;

        let channel = deployments
            .entry(deployment_id)
            .or_insert_with(LogChannel::new);

        Ok(LogSubscription {
            history: channel.history.clone(),
            live: overflow_terminated(channel.sender.subscribe()),
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
        Ok(self
            .deployments
            .lock()
            .await
            .get(&deployment_id)
            .map(|channel| channel.history.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use zyphron_common::log::BuildStep;
    use zyphron_common::{DeploymentState, EventType};

    use super::*;

    fn entry(deployment_id: Uuid, line: &str) -> LogEntry {
        LogEntry::new(deployment_id, BuildStep::Build, line)
    }

    #[tokio::test]
    async fn late_subscriber_sees_prefix_then_live_tail() {
        let bus = InMemoryLogBus::new();
        let id = Uuid::new_v4();

        bus.publish_log(entry(id, "one")).await.unwrap();
        bus.publish_log(entry(id, "two")).await.unwrap();

        let mut subscription = bus.subscribe_logs(id).await.unwrap();
        assert_eq!(
            subscription
                .history
                .iter()
                .map(|e| e.line.as_str())
                .collect::<Vec<_>>(),
            vec!["one", "two"]
        );

        bus.publish_log(entry(id, "three")).await.unwrap();

        let live = subscription.live.next().await.unwrap().unwrap();
        assert_eq!(live.line, "three");
    }

    #[tokio::test]
    async fn logs_are_isolated_per_deployment() {
        let bus = InMemoryLogBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        bus.publish_log(entry(a, "for a")).await.unwrap();
        bus.publish_log(entry(b, "for b")).await.unwrap();

        let logs = bus.logs_so_far(a).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].line, "for a");
    }

    #[tokio::test]
    async fn events_delivered_in_publish_order_per_project() {
        let bus = InMemoryEventBus::new();
        let project = Uuid::new_v4();
        let deployment = Uuid::new_v4();

        let mut stream = bus.subscribe(EventFilter::project(project)).await;

        for event_type in [
            EventType::DeploymentCreated,
            EventType::BuildStarted,
            EventType::BuildCompleted,
            EventType::DeploymentLive,
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

        // An event for another project must not show up in this stream.
        bus.publish(Event::new(
            EventType::DeploymentFailed,
            Uuid::new_v4(),
            Uuid::new_v4(),
            serde_json::Value::Null,
        ))
        .await
        .unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(stream.next().await.unwrap().unwrap().event_type);
        }

        assert_eq!(
            received,
            vec![
                EventType::DeploymentCreated,
                EventType::BuildStarted,
                EventType::BuildCompleted,
                EventType::DeploymentLive,
            ]
        );
    }

    #[tokio::test]
    async fn event_history_is_filtered_by_project_and_time() {
        let bus = InMemoryEventBus::new();
        let project = Uuid::new_v4();

        bus.publish(Event::new(
            EventType::DeploymentCreated,
            Uuid::new_v4(),
            project,
            serde_json::Value::Null,
        ))
        .await
        .unwrap();
        bus.publish(Event::new(
            EventType::DeploymentCreated,
            Uuid::new_v4(),
            Uuid::new_v4(),
            serde_json::Value::Null,
        ))
        .await
        .unwrap();

        let since = Utc::now() - Duration::minutes(1);
        let history = bus.history(project, since).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].project_id, project);

        let history = bus.history(project, Utc::now() + Duration::minutes(1)).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn consumer_groups_are_at_least_once() {
        let bus = InMemoryEventBus::new();
        let project = Uuid::new_v4();

        for _ in 0..2 {
            bus.publish(Event::new(
                EventType::DeploymentCreated,
                Uuid::new_v4(),
                project,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        }

        let batch = bus.poll_group("workers", 10).await.unwrap();
        assert_eq!(batch.len(), 2);

        // Replay until committed.
        assert_eq!(bus.poll_group("workers", 10).await.unwrap().len(), 2);

        bus.commit_group("workers", batch[0].0).await.unwrap();
        assert_eq!(bus.poll_group("workers", 10).await.unwrap().len(), 1);

        bus.commit_group("workers", batch[1].0).await.unwrap();
        assert!(bus.poll_group("workers", 10).await.unwrap().is_empty());

        // Commits never move a cursor backwards.
        bus.commit_group("workers", 0).await.unwrap();
        assert!(bus.poll_group("workers", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_updates_have_no_history() {
        let bus = InMemoryLogBus::new();
        let id = Uuid::new_v4();

        // Published before anyone subscribes: dropped by design.
        bus.publish_status(StatusUpdate {
            deployment_id: id,
            state: DeploymentState::Building,
            timestamp: Utc::now(),
            message: None,
        })
        .await
        .unwrap();

        let mut stream = bus.subscribe_status(id).await;

        bus.publish_status(StatusUpdate {
            deployment_id: id,
            state: DeploymentState::Deploying,
            timestamp: Utc::now(),
            message: None,
        })
        .await
        .unwrap();

        let update = stream.next().await.unwrap().unwrap();
        assert_eq!(update.state, DeploymentState::Deploying);
    }
}
