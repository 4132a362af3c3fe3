//! Watcher → bus: turn cache changes into envelopes on the publish queue.

use std::marker::PhantomData;

use kdash_core::{strip_managed_fields, Envelope, KdashResult};
use kdash_store::{Change, ChangeHandler, WatchedResource};

use crate::publisher::EventSink;
use crate::Message;

/// Build the message for one change: `<kind>_<event>` topic, envelope payload.
pub fn envelope_message<K: WatchedResource>(cluster_id: &str, change: &Change<K>) -> KdashResult<Message> {
    let mut value = serde_json::to_value(change.object())?;
    strip_managed_fields(&mut value);
    if let Some(obj) = value.as_object_mut() {
        obj.entry("kind").or_insert_with(|| K::KIND.kind_name().into());
        obj.entry("apiVersion").or_insert_with(|| "v1".into());
    }
    let envelope = Envelope::new(change.event_type(), cluster_id, value);
    Message::from_envelope(K::KIND, &envelope)
}

/// Subscriber that enqueues every change of one (cluster, kind) watcher; never blocks.
pub struct EnvelopeBridge<K> {
    cluster_id: String,
    sink: EventSink,
    _kind: PhantomData<fn() -> K>,
}

impl<K> EnvelopeBridge<K> {
    pub fn new(cluster_id: impl Into<String>, sink: EventSink) -> Self {
        Self { cluster_id: cluster_id.into(), sink, _kind: PhantomData }
    }
}

impl<K: WatchedResource> ChangeHandler<K> for EnvelopeBridge<K> {
    fn on_change(&self, change: &Change<K>) -> KdashResult<()> {
        self.sink.enqueue(envelope_message(&self.cluster_id, change)?)
    }
}
