//! In-process pub/sub broker.
//!
//! Every observable event passes through here on its way to WebSocket
//! subscribers and the optional telemetry sink. Subscribers get their own
//! unbounded mailbox; publishing snapshots the subscriber list under a
//! short-held lock and enqueues outside it, so a slow consumer never blocks
//! a publisher. Per-subscriber delivery is strict FIFO; ordering across
//! subscribers is not guaranteed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::events::{OrchestratorEvent, PipelineMetric, PipelineStage};
use crate::state::StatusSnapshot;
use crate::telemetry::TelemetryClient;
use crate::util::round2;

/// Token identifying one subscription; used to unsubscribe.
pub type SubscriberToken = u64;

pub struct EventBroker {
    subscribers: Mutex<HashMap<SubscriberToken, mpsc::UnboundedSender<OrchestratorEvent>>>,
    counter: AtomicU64,
    telemetry: Option<TelemetryClient>,
}

impl EventBroker {
    pub fn new(telemetry: Option<TelemetryClient>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            telemetry,
        }
    }

    /// Allocate a fresh mailbox. The token is monotonically increasing and
    /// never reused within a process lifetime.
    pub fn subscribe(&self) -> (SubscriberToken, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.counter.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("broker subscriber lock poisoned")
            .insert(token, tx);
        (token, rx)
    }

    /// Remove a subscription. Unknown tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriberToken) {
        self.subscribers
            .lock()
            .expect("broker subscriber lock poisoned")
            .remove(&token);
    }

    /// Fan an event out to all subscribers, then forward to telemetry.
    ///
    /// Sends to closed mailboxes are ignored; the owning task unsubscribes
    /// on its own schedule.
    pub async fn publish(&self, event: OrchestratorEvent) {
        let senders: Vec<mpsc::UnboundedSender<OrchestratorEvent>> = {
            let subscribers = self
                .subscribers
                .lock()
                .expect("broker subscriber lock poisoned");
            subscribers.values().cloned().collect()
        };
        for sender in &senders {
            let _ = sender.send(event.clone());
        }

        if let Some(telemetry) = &self.telemetry {
            if let Err(error) = telemetry.publish_event(&event).await {
                tracing::debug!("Telemetry publish failed for {}: {error:#}", event.kind());
            }
        }
    }
}

/// Thin publishing facade over the broker.
///
/// Centralises how outbound payloads are shaped (status wrapping, metric
/// rounding) so the orchestration logic stays focused on state transitions.
#[derive(Clone)]
pub struct EventDispatcher {
    broker: Arc<EventBroker>,
}

impl EventDispatcher {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    /// Send a raw event through the broker.
    pub async fn publish(&self, event: OrchestratorEvent) {
        self.broker.publish(event).await;
    }

    /// Broadcast the current orchestrator snapshot.
    pub async fn publish_status(&self, snapshot: StatusSnapshot) {
        self.publish(OrchestratorEvent::Status { payload: snapshot })
            .await;
    }

    /// Emit a latency metric for one voice-pipeline stage.
    pub async fn publish_pipeline_metric(
        &self,
        stage: PipelineStage,
        latency_ms: f64,
        request_id: Option<String>,
        mode: &str,
    ) {
        self.publish(OrchestratorEvent::PipelineMetric {
            payload: PipelineMetric {
                stage,
                latency_ms: round2(latency_ms),
                mode: mode.to_string(),
                request_id,
            },
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_event(scene: &str) -> OrchestratorEvent {
        OrchestratorEvent::ObsScene {
            scene: scene.into(),
            ts: 1.0,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_publish_order() {
        let broker = EventBroker::new(None);
        let (_token, mut rx) = broker.subscribe();

        broker.publish(scene_event("one")).await;
        broker.publish(scene_event("two")).await;

        for expected in ["one", "two"] {
            match rx.recv().await {
                Some(OrchestratorEvent::ObsScene { scene, .. }) => assert_eq!(scene, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn tokens_are_monotonic_and_unsubscribe_stops_delivery() {
        let broker = EventBroker::new(None);
        let (first, _rx1) = broker.subscribe();
        let (second, mut rx2) = broker.subscribe();
        assert!(second > first);

        broker.unsubscribe(second);
        broker.publish(scene_event("after")).await;
        assert!(rx2.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_token_unsubscribe_is_ignored() {
        let broker = EventBroker::new(None);
        broker.unsubscribe(999);
        // Publishing to a broker with a dropped receiver must not panic.
        let (_token, rx) = broker.subscribe();
        drop(rx);
        broker.publish(scene_event("dropped")).await;
    }

    #[tokio::test]
    async fn dispatcher_rounds_metric_latency() {
        let broker = Arc::new(EventBroker::new(None));
        let dispatcher = EventDispatcher::new(broker.clone());
        let (_token, mut rx) = broker.subscribe();

        dispatcher
            .publish_pipeline_metric(PipelineStage::PolicyTotal, 12.3456, None, "streaming")
            .await;

        match rx.recv().await {
            Some(OrchestratorEvent::PipelineMetric { payload }) => {
                assert_eq!(payload.latency_ms, 12.35);
                assert_eq!(payload.mode, "streaming");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
