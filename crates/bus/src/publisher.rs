//! Fire-and-forget publishing for change events, retried publishing for announcements.

use std::sync::Arc;

use kdash_core::{ClusterAnnouncement, KdashError, KdashResult, CLUSTER_REGISTERED};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::retry::{retry, RetryPolicy};
use crate::{Delivery, Message, Transport};

pub const DEFAULT_QUEUE: usize = 4096;

/// Non-blocking handle for enqueueing change events; cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Message>,
}

impl EventSink {
    /// Queue a message without waiting. A full or closed queue drops it with an error.
    pub fn enqueue(&self, msg: Message) -> KdashResult<()> {
        self.tx.try_send(msg).map_err(|e| {
            counter!("kdash_bus_dropped_total", 1, "reason" => "queue");
            match e {
                mpsc::error::TrySendError::Full(m) => {
                    KdashError::TransportUnavailable(format!("publish queue full, dropped {}", m.topic))
                }
                mpsc::error::TrySendError::Closed(m) => {
                    KdashError::TransportUnavailable(format!("publisher stopped, dropped {}", m.topic))
                }
            }
        })
    }
}

/// Owns the single task that drains queued events into the transport, preserving order.
pub struct EventPublisher {
    transport: Arc<dyn Transport>,
    sink: EventSink,
    retry: RetryPolicy,
    pump: JoinHandle<()>,
}

impl EventPublisher {
    pub fn spawn(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self::with_capacity(transport, retry, DEFAULT_QUEUE)
    }

    pub fn with_capacity(transport: Arc<dyn Transport>, retry: RetryPolicy, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pump = tokio::spawn(pump(Arc::clone(&transport), rx));
        Self { transport, sink: EventSink { tx }, retry, pump }
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Announce a cluster to the consumer side, retrying until a subscriber acknowledges it.
    /// A missing subscriber or an unavailable transport is retried; a handler's rejection is final.
    pub async fn announce_cluster(&self, cluster_id: &str, api_url: &str) -> KdashResult<()> {
        let msg = Message::announcement(
            cluster_id,
            &ClusterAnnouncement { cluster_name: cluster_id.to_string(), api_url: api_url.to_string() },
        )?;
        let transport = &self.transport;
        let msg = &msg;
        let result = retry(&self.retry, CLUSTER_REGISTERED, |_| async move {
            match transport.publish(msg).await? {
                Delivery::Delivered(_) => Ok(()),
                Delivery::NoSubscribers => {
                    Err(KdashError::TransportUnavailable(format!("no subscriber for {}", CLUSTER_REGISTERED)))
                }
            }
        })
        .await;
        match &result {
            Ok(()) => info!(cluster = %cluster_id, api_url, "cluster announced"),
            Err(e) => {
                counter!("kdash_bus_announce_failures_total", 1);
                warn!(cluster = %cluster_id, error = %e, "cluster announcement failed");
            }
        }
        result
    }

    /// Drop this publisher's sink and wait for the pump to drain. The pump ends once every
    /// [`EventSink`] clone is gone.
    pub async fn shutdown(self) {
        let Self { sink, pump, .. } = self;
        drop(sink);
        if let Err(e) = pump.await {
            warn!(error = %e, "publish pump panicked");
        }
    }
}

async fn pump(transport: Arc<dyn Transport>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        match transport.publish(&msg).await {
            Ok(Delivery::Delivered(n)) => {
                counter!("kdash_bus_published_total", 1, "topic" => msg.topic.clone());
                debug!(topic = %msg.topic, cluster = %msg.cluster_id, handlers = n, "event delivered");
            }
            Ok(Delivery::NoSubscribers) => {
                counter!("kdash_bus_dropped_total", 1, "reason" => "no_subscribers");
                debug!(topic = %msg.topic, cluster = %msg.cluster_id, "no subscribers, event dropped");
            }
            Err(e) => {
                counter!("kdash_bus_dropped_total", 1, "reason" => "error");
                warn!(topic = %msg.topic, cluster = %msg.cluster_id, error = %e, "event dropped");
            }
        }
    }
    debug!("publish pump drained");
}
