//! Status event delivery with bounded per-subscriber queues.
//!
//! Publishers never block on a slow consumer: each subscriber gets a bounded
//! queue, a full queue is retried briefly, and past the retry budget the
//! configured drop policy applies. Used for both deploy status and build
//! log streaming.

use crate::types::{AppId, EnvironmentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Events emitted by the runtime manager as an application moves through
/// its deploy/start/stop cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    DeployStarted {
        app_id: AppId,
        environment_id: EnvironmentId,
    },
    BuildLog {
        app_id: AppId,
        line: String,
    },
    AppReady {
        app_id: AppId,
        environment_id: EnvironmentId,
    },
    AppStopped {
        app_id: AppId,
    },
    DeployFailed {
        app_id: AppId,
        environment_id: EnvironmentId,
        error: String,
    },
    EnvironmentUnhealthy {
        app_id: Option<AppId>,
        environment_id: EnvironmentId,
    },
}

impl StatusEvent {
    /// The application this event concerns, if any.
    pub fn app_id(&self) -> Option<&AppId> {
        match self {
            StatusEvent::DeployStarted { app_id, .. }
            | StatusEvent::BuildLog { app_id, .. }
            | StatusEvent::AppReady { app_id, .. }
            | StatusEvent::AppStopped { app_id }
            | StatusEvent::DeployFailed { app_id, .. } => Some(app_id),
            StatusEvent::EnvironmentUnhealthy { app_id, .. } => app_id.as_ref(),
        }
    }
}

/// Event plus delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: StatusEvent,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: StatusEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }
}

/// What to do with a new event once a subscriber's queue stays full past
/// the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Drop the incoming event, keep the queued backlog.
    DropNewest,
    /// Disconnect the subscriber entirely; it missed too much to be useful.
    Disconnect,
}

/// Delivery tuning for the broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Queue bound per subscriber.
    pub queue_capacity: usize,
    /// Send retries against a full queue before the drop policy applies.
    pub retry_attempts: u32,
    /// Base backoff between retries; doubles per attempt.
    pub retry_backoff: Duration,
    pub drop_policy: DropPolicy,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            drop_policy: DropPolicy::DropNewest,
        }
    }
}

struct SubscriberSlot {
    tx: mpsc::Sender<EventEnvelope>,
    /// Only events for this app are delivered; None receives everything.
    filter: Option<AppId>,
    dropped: u64,
}

/// Handle returned from [`StatusBroadcaster::subscribe`].
pub struct Subscription {
    pub id: uuid::Uuid,
    pub rx: mpsc::Receiver<EventEnvelope>,
}

/// Fan-out of status events to any number of bounded subscribers.
pub struct StatusBroadcaster {
    config: BroadcasterConfig,
    subscribers: Arc<RwLock<HashMap<uuid::Uuid, SubscriberSlot>>>,
}

impl StatusBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            config,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to events, optionally filtered to a single application.
    pub async fn subscribe(&self, filter: Option<AppId>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let id = uuid::Uuid::new_v4();
        self.subscribers.write().await.insert(
            id,
            SubscriberSlot {
                tx,
                filter,
                dropped: 0,
            },
        );
        Subscription { id, rx }
    }

    /// Remove a subscriber. Dropping the receiver has the same effect on the
    /// next publish.
    pub async fn unsubscribe(&self, id: uuid::Uuid) {
        self.subscribers.write().await.remove(&id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Never blocks indefinitely: a persistently full queue costs at most the
    /// retry budget, after which the drop policy applies.
    pub async fn publish(&self, event: StatusEvent) {
        let envelope = EventEnvelope::new(event);
        let mut disconnect = Vec::new();

        let mut subscribers = self.subscribers.write().await;
        for (id, slot) in subscribers.iter_mut() {
            if let Some(filter) = &slot.filter {
                if envelope.event.app_id() != Some(filter) {
                    continue;
                }
            }

            match self.deliver(&slot.tx, envelope.clone()).await {
                DeliveryOutcome::Sent => {}
                DeliveryOutcome::Closed => disconnect.push(*id),
                DeliveryOutcome::Full => {
                    slot.dropped += 1;
                    match self.config.drop_policy {
                        DropPolicy::DropNewest => {
                            warn!(
                                subscriber = %id,
                                dropped = slot.dropped,
                                "subscriber queue full, dropping event"
                            );
                        }
                        DropPolicy::Disconnect => {
                            warn!(subscriber = %id, "subscriber queue full, disconnecting");
                            disconnect.push(*id);
                        }
                    }
                }
            }
        }

        for id in disconnect {
            subscribers.remove(&id);
            debug!(subscriber = %id, "subscriber removed");
        }
    }

    async fn deliver(
        &self,
        tx: &mpsc::Sender<EventEnvelope>,
        envelope: EventEnvelope,
    ) -> DeliveryOutcome {
        let mut envelope = envelope;
        let mut backoff = self.config.retry_backoff;
        for attempt in 0..=self.config.retry_attempts {
            match tx.try_send(envelope) {
                Ok(()) => return DeliveryOutcome::Sent,
                Err(mpsc::error::TrySendError::Closed(_)) => return DeliveryOutcome::Closed,
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    envelope = returned;
                    if attempt == self.config.retry_attempts {
                        return DeliveryOutcome::Full;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        DeliveryOutcome::Full
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

enum DeliveryOutcome {
    Sent,
    Full,
    Closed,
}
