//! In-process event bus over a tokio broadcast channel.

use async_trait::async_trait;
use futures::stream;
use kiln_core::events::{Event, subject_matches};
use kiln_core::ports::{EventBus, EventStream};
use kiln_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Publish counters for the bus.
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    lagged: AtomicU64,
}

impl BusMetrics {
    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events dropped by slow subscribers.
    pub fn messages_lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

/// Event bus delivering to in-process subscribers.
///
/// Publishing never fails for lack of subscribers. A subscriber that falls
/// more than `capacity` events behind skips the missed events.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
    metrics: Arc<BusMetrics>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        debug!("Publishing event to {}", event.subject());
        // A send error only means nobody is subscribed
        let _ = self.tx.send(event);
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        if pattern.trim().is_empty() {
            return Err(Error::EventBus("Empty subscription pattern".to_string()));
        }
        debug!("Subscribing to pattern: {}", pattern);

        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let metrics = Arc::clone(&self.metrics);

        let events = stream::unfold(rx, move |mut rx| {
            let pattern = pattern.clone();
            let metrics = Arc::clone(&metrics);
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if subject_matches(&pattern, &event.subject()) => {
                            return Some((Ok(event), rx));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, pattern = %pattern, "Subscriber lagged");
                            metrics.lagged.fetch_add(skipped, Ordering::Relaxed);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use kiln_core::events::{AdmissionHaltedPayload, BuildCancelledPayload};
    use kiln_core::ids::BuildId;

    fn cancelled() -> Event {
        Event::BuildCancelled(BuildCancelledPayload {
            build_id: BuildId::new(),
            cancelled_at: chrono::Utc::now(),
        })
    }

    fn halted() -> Event {
        Event::AdmissionHalted(AdmissionHaltedPayload {
            consecutive_failures: 5,
            halted_at: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::default();
        tokio_test::assert_ok!(bus.publish(cancelled()).await);
        assert_eq!(bus.metrics().messages_published(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_pattern() {
        let bus = BroadcastEventBus::new(16);
        let mut stream = bus.subscribe("scheduler.>").await.unwrap();

        bus.publish(cancelled()).await.unwrap();
        bus.publish(halted()).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert!(matches!(received, Event::AdmissionHalted(_)));
    }

    #[tokio::test]
    async fn test_empty_pattern_rejected() {
        let bus = BroadcastEventBus::default();
        assert!(bus.subscribe("").await.is_err());
    }
}
