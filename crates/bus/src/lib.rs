//! kdash bus: publish/subscribe transport for resource change envelopes.
//!
//! A [`Transport`] moves [`Message`]s to the handlers subscribed to their topic, either
//! in-process ([`InProcTransport`]) or across a process boundary ([`TcpTransport`]).
//! Delivery is at-most-once with no replay.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod inproc;
pub mod publisher;
pub mod retry;
pub mod tcp;

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use kdash_core::{parse_topic, topic, ClusterAnnouncement, Envelope, KdashResult, ResourceKind, CLUSTER_REGISTERED};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

pub use bridge::{envelope_message, EnvelopeBridge};
pub use inproc::InProcTransport;
pub use publisher::{EventPublisher, EventSink};
pub use retry::{retry, ExponentialBackoff, RetryPolicy};
pub use tcp::TcpTransport;

/// One published unit: also the cross-process request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub event_type: String,
    pub topic: String,
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// JSON-encoded envelope or announcement.
    pub payload: String,
}

impl Message {
    pub fn new(topic: impl Into<String>, cluster_id: impl Into<String>, payload: impl Into<String>) -> Self {
        let topic = topic.into();
        let event_type = match parse_topic(&topic) {
            Some((_, ev)) => ev.as_str().to_string(),
            None => topic.clone(),
        };
        Self { event_type, topic, cluster_id: cluster_id.into(), payload: payload.into() }
    }

    pub fn from_envelope<T: Serialize>(kind: ResourceKind, envelope: &Envelope<T>) -> KdashResult<Self> {
        Ok(Self::new(topic(kind, envelope.event_type()), envelope.cluster_id(), envelope.to_json()?))
    }

    pub fn announcement(cluster_id: &str, announcement: &ClusterAnnouncement) -> KdashResult<Self> {
        Ok(Self::new(CLUSTER_REGISTERED, cluster_id, serde_json::to_string(announcement)?))
    }

    pub fn envelope<T: DeserializeOwned>(&self) -> KdashResult<Envelope<T>> {
        Envelope::from_json(&self.payload)
    }
}

/// Subscriber callback. Runs on the delivering task; must not block.
pub type Handler = Arc<dyn Fn(&Message) -> KdashResult<()> + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Message) -> KdashResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to this many handlers, all of which succeeded.
    Delivered(usize),
    /// Nobody subscribed to the topic; the message was dropped.
    NoSubscribers,
}

/// Topic → handlers, in subscription order.
#[derive(Default)]
pub struct HandlerTable {
    inner: RwLock<FxHashMap<String, SmallVec<[Handler; 2]>>>,
}

impl HandlerTable {
    pub fn subscribe(&self, topic: &str, handler: Handler) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).entry(topic.to_string()).or_default().push(handler);
    }

    /// Run every handler of the message's topic. All handlers run; the first failure is returned.
    pub fn dispatch(&self, msg: &Message) -> KdashResult<Delivery> {
        // cloned out so handlers may subscribe without deadlocking
        let handlers: SmallVec<[Handler; 2]> =
            self.inner.read().unwrap_or_else(PoisonError::into_inner).get(&msg.topic).cloned().unwrap_or_default();
        if handlers.is_empty() {
            return Ok(Delivery::NoSubscribers);
        }
        let mut first_err = None;
        for h in &handlers {
            if let Err(e) = h(msg) {
                counter!("kdash_bus_handler_errors_total", 1, "topic" => msg.topic.clone());
                warn!(topic = %msg.topic, cluster = %msg.cluster_id, error = %e, "handler failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(Delivery::Delivered(handlers.len())),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut out: Vec<_> = self.inner.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        out.sort();
        out
    }
}

/// Publish/subscribe contract shared by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Prepare the publishing side.
    async fn connect(&self) -> KdashResult<()>;

    /// Start accepting deliveries for local subscribers.
    async fn listen(&self) -> KdashResult<()>;

    async fn publish(&self, msg: &Message) -> KdashResult<Delivery>;

    /// Receive every message published to `topic` from now on.
    fn subscribe(&self, topic: &str, handler: Handler);

    async fn close(&self) -> KdashResult<()>;
}
