use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

pub const EVENT_JOB_QUEUED: &str = "job_queued";
pub const EVENT_JOB_QUEUE: &str = "job_queue";
pub const EVENT_JOB_UPDATE: &str = "job_update";
pub const EVENT_JOB_PROGRESS: &str = "job_progress";
pub const EVENT_SHUTDOWN: &str = "shutdown";

/// Buffer depth of one subscriber channel. Progress events are lossy-tolerant
/// (later events supersede earlier ones), so a stalled consumer only loses
/// its own messages.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// One lifecycle or progress notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl BusEvent {
    /// Render as one server-sent-events frame.
    pub fn sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind, self.payload)
    }
}

/// Fan-out publish/subscribe channel for job lifecycle and progress events.
///
/// Delivery is best-effort: publishing never blocks, and a subscriber whose
/// buffer is saturated silently misses the message without affecting other
/// subscribers. Per-subscriber ordering is FIFO; there is no ordering
/// guarantee across subscribers and no replay.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: DashMap<Uuid, mpsc::Sender<BusEvent>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        Subscription {
            id,
            bus: Arc::clone(self),
            rx,
            terminated: false,
        }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.remove(&id);
    }

    pub fn publish(&self, kind: &str, payload: serde_json::Value) {
        let event = BusEvent {
            kind: kind.to_string(),
            payload,
        };
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                // Saturated or disconnected subscribers lose this message
                // only; the publisher never blocks on a slow consumer.
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Publish the reserved terminal event so live subscribers can close
    /// their connections cleanly.
    pub fn shutdown(&self) {
        self.publish(EVENT_SHUTDOWN, serde_json::json!({}));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// A live subscriber channel. Dropping the subscription deregisters it from
/// the bus; the stream ends after the reserved `shutdown` event.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    bus: Arc<EventBus>,
    rx: mpsc::Receiver<BusEvent>,
    terminated: bool,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = BusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.kind == EVENT_SHUTDOWN {
                    self.terminated = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(EVENT_JOB_QUEUED, serde_json::json!({"job_id": "a"}));

        let event = first.recv().await.expect("first subscriber receives");
        assert_eq!(event.kind, EVENT_JOB_QUEUED);
        let event = second.recv().await.expect("second subscriber receives");
        assert_eq!(event.payload["job_id"], "a");
    }

    #[tokio::test]
    async fn saturated_subscriber_drops_without_affecting_others() {
        let bus = EventBus::new();
        let mut stalled = bus.subscribe();
        let mut healthy = bus.subscribe();

        for i in 0..SUBSCRIBER_BUFFER {
            bus.publish(EVENT_JOB_PROGRESS, serde_json::json!({"progress": i}));
        }
        // Drain only the healthy subscriber, then publish one more.
        for _ in 0..SUBSCRIBER_BUFFER {
            healthy.recv().await.expect("healthy drains buffer");
        }
        bus.publish(EVENT_JOB_PROGRESS, serde_json::json!({"progress": 100}));

        let extra = healthy.recv().await.expect("healthy receives overflow");
        assert_eq!(extra.payload["progress"], 100);

        let mut stalled_count = 0;
        while stalled.try_recv().is_some() {
            stalled_count += 1;
        }
        assert_eq!(stalled_count, SUBSCRIBER_BUFFER, "overflow message dropped");
    }

    #[tokio::test]
    async fn per_subscriber_order_is_fifo() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(EVENT_JOB_PROGRESS, serde_json::json!({"progress": i}));
        }
        for i in 0..5 {
            let event = sub.recv().await.expect("event in order");
            assert_eq!(event.payload["progress"], i);
        }
    }

    #[tokio::test]
    async fn dropping_subscription_deregisters_it() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_ends_after_shutdown_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(EVENT_JOB_UPDATE, serde_json::json!({"status": "processing"}));
        bus.shutdown();

        let first = sub.next().await.expect("lifecycle event");
        assert_eq!(first.kind, EVENT_JOB_UPDATE);
        let second = sub.next().await.expect("shutdown event");
        assert_eq!(second.kind, EVENT_SHUTDOWN);
        assert!(sub.next().await.is_none(), "stream terminates");
    }

    #[test]
    fn sse_frame_layout() {
        let event = BusEvent {
            kind: EVENT_JOB_QUEUED.to_string(),
            payload: serde_json::json!({"job_id": "a", "position": 1, "total": 1}),
        };
        assert_eq!(
            event.sse_frame(),
            "event: job_queued\ndata: {\"job_id\":\"a\",\"position\":1,\"total\":1}\n\n"
        );
    }

    #[test]
    fn shutdown_frame_has_empty_payload() {
        let event = BusEvent {
            kind: EVENT_SHUTDOWN.to_string(),
            payload: serde_json::json!({}),
        };
        assert_eq!(event.sse_frame(), "event: shutdown\ndata: {}\n\n");
    }
}
