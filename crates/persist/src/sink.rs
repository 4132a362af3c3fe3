//! Bus → repository: persist every change envelope received on the transport.

use std::sync::Arc;

use kdash_bus::{handler, Message, Transport};
use kdash_core::{
    topic, ClusterAnnouncement, EventType, KdashError, KdashResult, ResourceKind, ResourceMeta, CLUSTER_REGISTERED,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use crate::repository::{RecordFilter, Repository};

/// Apply one change message to the repository: added/updated save, deleted removes.
pub fn apply_message(repo: &dyn Repository, msg: &Message) -> KdashResult<()> {
    let envelope = msg.envelope::<Value>()?;
    let cluster_id = envelope.cluster_id();
    match envelope.event_type() {
        EventType::Added | EventType::Updated => {
            let record = repo.save(cluster_id, envelope.resource())?;
            debug!(id = %record.id, event = envelope.event_type().as_str(), "envelope persisted");
        }
        EventType::Deleted => {
            let meta = ResourceMeta::from_value(envelope.resource())?;
            let existed = repo.delete(cluster_id, meta.namespace.as_deref(), &meta.kind, &meta.name)?;
            debug!(id = %meta.composite_id(cluster_id), existed, "envelope deleted record");
        }
    }
    counter!("kdash_sink_applied_total", 1, "topic" => msg.topic.clone());
    Ok(())
}

/// Subscribe the repository to added/updated/deleted topics of every kind in `kinds`.
pub fn attach(transport: &dyn Transport, repo: Arc<dyn Repository>, kinds: &[ResourceKind]) {
    for kind in kinds {
        for event in [EventType::Added, EventType::Updated, EventType::Deleted] {
            let repo = Arc::clone(&repo);
            transport.subscribe(&topic(*kind, event), handler(move |msg| apply_message(repo.as_ref(), msg)));
        }
    }
    info!(kinds = ?kinds, "repository attached to transport");
}

/// Subscribe `on_cluster` to cluster announcements.
pub fn attach_announcements<F>(transport: &dyn Transport, on_cluster: F)
where
    F: Fn(ClusterAnnouncement) -> KdashResult<()> + Send + Sync + 'static,
{
    transport.subscribe(
        CLUSTER_REGISTERED,
        handler(move |msg| {
            let announcement: ClusterAnnouncement = serde_json::from_str(&msg.payload)?;
            if announcement.cluster_name.is_empty() {
                return Err(KdashError::Validation("cluster announcement without a name".into()));
            }
            on_cluster(announcement)
        }),
    );
}

/// Remove every record of a cluster.
pub fn purge_cluster(repo: &dyn Repository, cluster_id: &str) -> KdashResult<usize> {
    let removed = repo.delete_by_filter(&RecordFilter::cluster(cluster_id))?;
    info!(cluster = %cluster_id, removed, "cluster records purged");
    Ok(removed)
}
