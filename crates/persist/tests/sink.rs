#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use kdash_bus::{Delivery, InProcTransport, Message, Transport};
use kdash_core::{ClusterAnnouncement, Envelope, EventType, KdashError, ResourceKind};
use kdash_persist::sink::{attach, attach_announcements, purge_cluster};
use kdash_persist::{MemoryRepository, Repository, SqliteRepository};
use serde_json::json;

fn change(kind: ResourceKind, event: EventType, cluster: &str, resource: serde_json::Value) -> Message {
    Message::from_envelope(kind, &Envelope::new(event, cluster, resource)).unwrap()
}

fn config_map(name: &str, rv: &str) -> serde_json::Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "default", "resourceVersion": rv}})
}

#[tokio::test]
async fn envelopes_drive_save_and_delete() {
    let bus = InProcTransport::new();
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
    attach(&bus, Arc::clone(&repo), &ResourceKind::ALL);

    let added = change(ResourceKind::ConfigMap, EventType::Added, "c1", config_map("cfg", "1"));
    assert_eq!(bus.publish(&added).await.unwrap(), Delivery::Delivered(1));
    let updated = change(ResourceKind::ConfigMap, EventType::Updated, "c1", config_map("cfg", "2"));
    bus.publish(&updated).await.unwrap();
    let got = repo.get("c1", Some("default"), "ConfigMap", "cfg").unwrap();
    assert_eq!(got.resource_version, "2");

    let deleted = change(ResourceKind::ConfigMap, EventType::Deleted, "c1", config_map("cfg", "3"));
    bus.publish(&deleted).await.unwrap();
    assert!(matches!(repo.get("c1", Some("default"), "ConfigMap", "cfg"), Err(KdashError::NotFound(_))));
    // redelivered delete is harmless
    bus.publish(&deleted).await.unwrap();
}

#[tokio::test]
async fn namespace_envelopes_are_stored_cluster_scoped() {
    let bus = InProcTransport::new();
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    attach(&bus, Arc::clone(&repo), &[ResourceKind::Namespace]);
    let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "kube-system"}});
    bus.publish(&change(ResourceKind::Namespace, EventType::Added, "c1", ns)).await.unwrap();
    assert_eq!(repo.get("c1", None, "Namespace", "kube-system").unwrap().id, "c1:Namespace:kube-system");
}

#[tokio::test]
async fn malformed_payload_is_surfaced_to_publisher() {
    let bus = InProcTransport::new();
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    attach(&bus, repo, &[ResourceKind::Pod]);
    let err = bus.publish(&Message::new("pod_added", "c1", "not json")).await.unwrap_err();
    assert!(matches!(err, KdashError::Validation(_)));
}

#[tokio::test]
async fn announcements_reach_callback_and_purge_clears_cluster() {
    let bus = InProcTransport::new();
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    attach(&bus, Arc::clone(&repo), &[ResourceKind::ConfigMap]);
    let known = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&known);
    attach_announcements(&bus, move |a| {
        sink.lock().unwrap().push(a.cluster_name);
        Ok(())
    });

    let announce = Message::announcement("c1", &ClusterAnnouncement { cluster_name: "c1".into(), api_url: "https://c1".into() })
        .unwrap();
    bus.publish(&announce).await.unwrap();
    assert_eq!(*known.lock().unwrap(), vec!["c1".to_string()]);

    bus.publish(&change(ResourceKind::ConfigMap, EventType::Added, "c1", config_map("a", "1"))).await.unwrap();
    bus.publish(&change(ResourceKind::ConfigMap, EventType::Added, "c1", config_map("b", "1"))).await.unwrap();
    assert_eq!(purge_cluster(repo.as_ref(), "c1").unwrap(), 2);
    assert!(repo.list("c1", None, "").unwrap().is_empty());
}
