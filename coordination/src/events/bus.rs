//! Event bus for pipeline observers
//!
//! Tokio broadcast pub/sub. Slow subscribers lag and lose events; publishers
//! never block and never fail because nobody is listening.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::PipelineEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast event bus
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: PipelineEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that only yields events of one run
pub struct RunEvents {
    receiver: broadcast::Receiver<PipelineEvent>,
    run_id: String,
}

impl RunEvents {
    pub fn new(receiver: broadcast::Receiver<PipelineEvent>, run_id: impl Into<String>) -> Self {
        Self {
            receiver,
            run_id: run_id.into(),
        }
    }

    /// Next event for this run. Lagged gaps are skipped.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id() == self.run_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(run_id = %self.run_id, skipped, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cancelled(run_id: &str) -> PipelineEvent {
        PipelineEvent::RunCancelled {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        bus.publish(cancelled("r1"));
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "run_cancelled");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(cancelled("r1"));
    }

    #[tokio::test]
    async fn test_run_events_filters_other_runs() {
        let bus = EventBus::new().shared();
        let mut events = RunEvents::new(bus.subscribe(), "target");
        bus.publish(cancelled("other"));
        bus.publish(cancelled("target"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.run_id(), "target");
    }
}
