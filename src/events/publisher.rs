//! Event fan-out without consumer coupling.
//!
//! The pipeline publishes through an intra-process [`EventPublisher`] that
//! knows its consumers only as [`EventSink`]s. The webhook subsystem and the
//! Chatwoot bridge each register a sink at startup; either can be absent and
//! the other keeps working.
//!
//! Delivery contract: `deliver` must be *fast*. Enqueue, or write a local
//! row and spawn the slow remote work. The per-session dispatch task awaits
//! `process()`, so anything slow in a sink would stall that session's event
//! stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::client::RawEvent;

use super::{enrich::enrich, Event};

/// A consumer of enriched events.
///
/// Implementations swallow their own errors: a failing consumer must never
/// break the dispatch task or a sibling consumer.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Short name for logs ("webhooks", "chatwoot").
    fn name(&self) -> &str;

    /// Accepts one event. Must return quickly; see the module contract.
    async fn deliver(&self, event: &Event);
}

/// Registry of sinks receiving every published event.
#[derive(Default)]
pub struct EventPublisher {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink. Intended for startup wiring.
    pub async fn register(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Delivers an event to every sink concurrently.
    ///
    /// One sink's failure (or slowness up to its internal bounds) does not
    /// block the others; the futures are joined, not sequenced.
    pub async fn publish(&self, event: &Event) {
        let sinks = self.sinks.read().await.clone();
        futures::future::join_all(sinks.iter().map(|sink| sink.deliver(event))).await;
    }

    /// Number of registered sinks.
    pub async fn sink_count(&self) -> usize {
        self.sinks.read().await.len()
    }
}

/// The event pipeline: raw event in, enriched event fanned out.
pub struct EventPipeline {
    publisher: Arc<EventPublisher>,
}

impl EventPipeline {
    pub fn new(publisher: Arc<EventPublisher>) -> Self {
        Self { publisher }
    }

    /// Processes one raw event from a session's client stream.
    ///
    /// Events outside the catalogue are dropped here and produce no output
    /// anywhere downstream.
    pub async fn process(&self, session_id: Uuid, raw: &RawEvent) {
        match enrich(session_id, raw) {
            Some(event) => {
                debug!(
                    session_id = %session_id,
                    event_type = %event.event_type,
                    "event published"
                );
                self.publisher.publish(&event).await;
            }
            None => {
                debug!(session_id = %session_id, "event dropped (not in catalogue)");
            }
        }
    }

    pub fn publisher(&self) -> Arc<EventPublisher> {
        Arc::clone(&self.publisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use serde_json::json;
    use std::sync::Mutex;

    /// Sink that records everything it sees.
    struct RecordingSink {
        name: &'static str,
        seen: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Event> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn deliver(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    /// Sink that dawdles on every delivery, to prove fan-out isolation.
    struct SlowSink {
        delivered: Mutex<usize>,
    }

    #[async_trait]
    impl EventSink for SlowSink {
        fn name(&self) -> &str {
            "slow"
        }

        async fn deliver(&self, _event: &Event) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            *self.delivered.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_sinks() {
        let publisher = Arc::new(EventPublisher::new());
        let a = RecordingSink::new("a");
        let b = RecordingSink::new("b");
        publisher.register(a.clone()).await;
        publisher.register(b.clone()).await;
        assert_eq!(publisher.sink_count().await, 2);

        let pipeline = EventPipeline::new(publisher);
        pipeline
            .process(Uuid::new_v4(), &RawEvent::Connected)
            .await;

        assert_eq!(a.seen().len(), 1);
        assert_eq!(b.seen().len(), 1);
        assert_eq!(a.seen()[0].event_type, EventType::Connected);
    }

    #[tokio::test]
    async fn test_dropped_event_reaches_no_sink() {
        let publisher = Arc::new(EventPublisher::new());
        let sink = RecordingSink::new("a");
        publisher.register(sink.clone()).await;

        let pipeline = EventPipeline::new(publisher);
        pipeline
            .process(
                Uuid::new_v4(),
                &RawEvent::Other {
                    tag: "AppState".to_string(),
                    data: json!({}),
                },
            )
            .await;

        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_lose_events_for_others() {
        let publisher = Arc::new(EventPublisher::new());
        let fast = RecordingSink::new("fast");
        let slow = Arc::new(SlowSink {
            delivered: Mutex::new(0),
        });
        publisher.register(fast.clone()).await;
        publisher.register(slow.clone()).await;

        let pipeline = EventPipeline::new(publisher);
        for _ in 0..3 {
            pipeline
                .process(Uuid::new_v4(), &RawEvent::KeepAliveRestored)
                .await;
        }

        assert_eq!(fast.seen().len(), 3);
        assert_eq!(*slow.delivered.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_publish_with_no_sinks_is_noop() {
        let pipeline = EventPipeline::new(Arc::new(EventPublisher::new()));
        pipeline
            .process(Uuid::new_v4(), &RawEvent::Connected)
            .await;
    }
}
