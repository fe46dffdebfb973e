//! Bounded in-process publish/subscribe for lifecycle events.
//!
//! Each subscriber owns a bounded buffer; a slow subscriber lags and loses
//! the oldest events instead of stalling the publisher.

use tokio::sync::broadcast;

use crate::event::HubEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// The hub event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Publishing never blocks; with no subscribers the
    /// event is dropped.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            dropped: 0,
            run_id: None,
        }
    }

    /// Subscribe to events of a single run.
    pub fn subscribe_run(&self, run_id: impl Into<String>) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            dropped: 0,
            run_id: Some(run_id.into()),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A bus subscription with drop-oldest back-pressure.
pub struct BusSubscription {
    rx: broadcast::Receiver<HubEvent>,
    dropped: u64,
    run_id: Option<String>,
}

impl BusSubscription {
    /// Receive the next event, skipping past any dropped backlog.
    ///
    /// Returns `None` when the bus is closed.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(ref run_id) = self.run_id {
                        if event.run_id() != Some(run_id.as_str()) {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events lost to back-pressure on this subscription so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HubEvent;

    fn token(run: &str, delta: &str) -> HubEvent {
        HubEvent::Token {
            run_id: run.into(),
            delta: delta.into(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        bus.publish(token("r1", "a"));
        bus.publish(token("r1", "b"));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.sse_payload()["delta"], "a");
        assert_eq!(second.sse_payload()["delta"], "b");
    }

    #[tokio::test]
    async fn test_run_filter() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_run("r2");
        bus.publish(token("r1", "skip"));
        bus.publish(token("r2", "keep"));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.run_id(), Some("r2"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..8 {
            bus.publish(token("r", &i.to_string()));
        }
        // The buffer holds the newest two; the rest were dropped.
        let event = sub.recv().await.unwrap();
        assert_eq!(event.sse_payload()["delta"], "6");
        assert!(sub.dropped() >= 6);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(token("r", "x"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
