//! Queue lifecycle events.
//!
//! Events are published to registered [`EventHandler`]s and to a broadcast
//! channel. Delivery is best effort: a handler that fails, panics or runs
//! past its time limit is logged and the queue carries on.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use courier_queue::{QueueItem, QueueItemId, QueueStatus};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    QueueStarted,
    QueueStopped,
    MessageEnqueued,
    MessageProcessing,
    MessageSent,
    MessageDeferred,
    MessageRetryQueued,
    MessageDeadLetter,
    QueuePurged,
    /// An operator re-armed a failed or dead-lettered item.
    MessageRequeued,
    /// A stale `processing` item was reset to `pending`.
    MessageRecovered,
}

impl QueueEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueStarted => "queue_started",
            Self::QueueStopped => "queue_stopped",
            Self::MessageEnqueued => "message_enqueued",
            Self::MessageProcessing => "message_processing",
            Self::MessageSent => "message_sent",
            Self::MessageDeferred => "message_deferred",
            Self::MessageRetryQueued => "message_retry_queued",
            Self::MessageDeadLetter => "message_dead_letter",
            Self::QueuePurged => "queue_purged",
            Self::MessageRequeued => "message_requeued",
            Self::MessageRecovered => "message_recovered",
        }
    }
}

impl Display for QueueEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEvent {
    pub event_type: QueueEventType,
    pub queue_item_id: Option<QueueItemId>,
    pub message_id: Option<String>,
    pub status: Option<QueueStatus>,
    pub error: Option<String>,
    pub timestamp: SystemTime,
    pub metadata: BTreeMap<String, String>,
}

impl QueueEvent {
    /// A queue-wide event not tied to any item.
    #[must_use]
    pub fn queue(event_type: QueueEventType) -> Self {
        Self {
            event_type,
            queue_item_id: None,
            message_id: None,
            status: None,
            error: None,
            timestamp: SystemTime::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// An event about `item` as it stands now; carries its last error.
    #[must_use]
    pub fn item(event_type: QueueEventType, item: &QueueItem) -> Self {
        Self {
            queue_item_id: Some(item.id.clone()),
            message_id: Some(item.message_id.clone()),
            status: Some(item.status),
            error: item.error_message.clone(),
            ..Self::queue(event_type)
        }
        .with("recipient", &item.recipient)
        .with("attempts", item.attempts)
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &QueueEvent) -> anyhow::Result<()>;
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &QueueEvent) -> anyhow::Result<()> {
        let id = event
            .queue_item_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let message_id = event.message_id.as_deref().unwrap_or_default();

        match event.event_type {
            QueueEventType::MessageDeadLetter => warn!(
                event = %event.event_type,
                id,
                message_id,
                error = event.error.as_deref().unwrap_or_default(),
                "Queue event"
            ),
            _ => info!(
                event = %event.event_type,
                id,
                message_id,
                metadata = ?event.metadata,
                "Queue event"
            ),
        }

        Ok(())
    }
}

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Fan-out of queue events.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    sender: broadcast::Sender<QueueEvent>,
    handler_timeout: Duration,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .field("subscribers", &self.sender.receiver_count())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// `capacity` bounds how far a broadcast subscriber may lag before it
    /// starts missing events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            sender,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// How long [`EventBus::emit`] waits for each handler before abandoning
    /// it.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Hand `event` to every handler in registration order, then to the
    /// broadcast channel. Never fails, and waits at most the handler timeout
    /// for each handler.
    pub async fn emit(&self, event: QueueEvent) {
        let handlers = self.handlers.read().clone();
        let event = Arc::new(event);

        for handler in handlers {
            let shared = Arc::clone(&event);
            // Own task so a panicking handler cannot take the caller down.
            let mut task = tokio::spawn(async move { handler.handle(&shared).await });
            match tokio::time::timeout(self.handler_timeout, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(event = %event.event_type, %err, "Event handler failed");
                }
                Ok(Err(join)) => {
                    error!(event = %event.event_type, %join, "Event handler panicked");
                }
                Err(_) => {
                    task.abort();
                    warn!(
                        event = %event.event_type,
                        timeout = ?self.handler_timeout,
                        "Event handler timed out, abandoned"
                    );
                }
            }
        }

        // No subscribers is not an error.
        let _ = self.sender.send(Arc::unwrap_or_clone(event));
    }
}
