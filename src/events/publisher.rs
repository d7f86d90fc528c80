use tokio::sync::broadcast;

use super::EngineEvent;

/// High-throughput publisher for engine lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// An event together with its publication timestamp
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: EngineEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an engine event.
    ///
    /// A broadcast send fails only when there are no subscribers, which is
    /// acceptable here: the engine publishes whether or not anyone listens.
    pub fn publish(&self, event: EngineEvent) {
        tracing::debug!(
            event = event.name(),
            execution_id = %event.correlation().execution_id,
            "publishing engine event"
        );
        let published = PublishedEvent {
            event,
            published_at: chrono::Utc::now(),
        };
        if let Err(broadcast::error::SendError(_)) = self.sender.send(published) {
            // No subscribers; nothing to deliver
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event channel is closed")]
    ChannelClosed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
