#![forbid(unsafe_code)]

use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kdash_core::{EventType, KdashError};
use kdash_kubehub::{ResourceWatcher, WatcherConfig};
use kdash_store::{Change, SyncState};
use kube::runtime::watcher::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Feed<K> = UnboundedSender<Result<Event<K>, String>>;

fn synthetic_feed<K>() -> (Feed<K>, UnboundedReceiver<Result<Event<K>, String>>) {
    unbounded()
}

fn pod(ns: &str, name: &str, rv: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            resource_version: Some(rv.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn config(namespace: Option<&str>) -> WatcherConfig {
    WatcherConfig { sync_timeout: Duration::from_millis(500), namespace: namespace.map(str::to_string) }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<(EventType, String)>) -> (EventType, String) {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("event in time").expect("channel open")
}

/// Watcher on a synthetic feed with a subscriber recording (event, name) pairs.
fn recording_watcher(
    namespace: Option<&str>,
) -> (ResourceWatcher<Pod>, mpsc::UnboundedReceiver<(EventType, String)>) {
    let mut w = ResourceWatcher::<Pod>::new("c1", config(namespace), CancellationToken::new());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    w.subscribe(move |c: &Change<Pod>| {
        let name = c.object().metadata.name.clone().unwrap_or_default();
        seen_tx.send((c.event_type(), name)).map_err(|e| KdashError::Internal(e.to_string()))
    })
    .unwrap();
    (w, seen_rx)
}

#[tokio::test]
async fn pod_lifecycle_reaches_cache_and_subscribers() {
    let (mut w, mut seen) = recording_watcher(Some("default"));
    let (feed, stream) = synthetic_feed();
    feed.unbounded_send(Ok(Event::Restarted(vec![]))).unwrap();
    w.start_with_stream(stream).await.unwrap();
    assert!(w.has_synced());
    assert!(w.list(None).unwrap().is_empty());

    feed.unbounded_send(Ok(Event::Applied(pod("default", "web-1", "1")))).unwrap();
    assert_eq!(next_event(&mut seen).await, (EventType::Added, "web-1".to_string()));
    assert_eq!(w.get("web-1").unwrap().metadata.resource_version.as_deref(), Some("1"));
    assert_eq!(w.state(), SyncState::Running);

    feed.unbounded_send(Ok(Event::Applied(pod("default", "web-1", "2")))).unwrap();
    assert_eq!(next_event(&mut seen).await, (EventType::Updated, "web-1".to_string()));

    feed.unbounded_send(Ok(Event::Deleted(pod("default", "web-1", "3")))).unwrap();
    assert_eq!(next_event(&mut seen).await, (EventType::Deleted, "web-1".to_string()));
    assert!(matches!(w.get("web-1"), Err(KdashError::NotFound(_))));
    assert!(w.list(Some("default")).unwrap().is_empty());
}

#[tokio::test]
async fn start_times_out_without_initial_listing() {
    let mut w = ResourceWatcher::<Pod>::new(
        "c1",
        WatcherConfig { sync_timeout: Duration::from_millis(50), namespace: None },
        CancellationToken::new(),
    );
    let (_feed, stream) = synthetic_feed::<Pod>();
    let err = w.start_with_stream(stream).await.unwrap_err();
    assert!(matches!(err, KdashError::NotReady(_)));
    assert!(matches!(w.list(None), Err(KdashError::NotReady(_))));
}

#[tokio::test]
async fn subscribe_after_start_is_rejected() {
    let (mut w, _seen) = recording_watcher(None);
    let (feed, stream) = synthetic_feed();
    feed.unbounded_send(Ok(Event::Restarted(vec![]))).unwrap();
    w.start_with_stream(stream).await.unwrap();
    let late = w.subscribe(|_: &Change<Pod>| Ok(()));
    assert!(matches!(late, Err(KdashError::Validation(_))));
    let (_feed2, stream2) = synthetic_feed::<Pod>();
    assert!(matches!(w.start_with_stream(stream2).await, Err(KdashError::Validation(_))));
}

#[tokio::test]
async fn failing_subscriber_and_stream_errors_do_not_stop_the_watch() {
    let mut w = ResourceWatcher::<Pod>::new("c1", config(None), CancellationToken::new());
    w.subscribe(|_: &Change<Pod>| Err(KdashError::TransportUnavailable("bus down".into()))).unwrap();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    w.subscribe(move |c: &Change<Pod>| {
        seen_tx
            .send((c.event_type(), c.object().metadata.name.clone().unwrap_or_default()))
            .map_err(|e| KdashError::Internal(e.to_string()))
    })
    .unwrap();

    let (feed, stream) = synthetic_feed();
    feed.unbounded_send(Ok(Event::Restarted(vec![pod("a", "x", "1")]))).unwrap();
    w.start_with_stream(stream).await.unwrap();
    assert_eq!(next_event(&mut seen).await, (EventType::Added, "x".to_string()));

    feed.unbounded_send(Err("410 Gone".to_string())).unwrap();
    feed.unbounded_send(Ok(Event::Applied(pod("b", "y", "2")))).unwrap();
    assert_eq!(next_event(&mut seen).await, (EventType::Added, "y".to_string()));
    assert_eq!(w.list(Some("all")).unwrap().len(), 2);
    assert_eq!(w.get_in("b", "y").unwrap().metadata.name.as_deref(), Some("y"));
}

#[tokio::test]
async fn relist_emits_deletes_for_vanished_objects() {
    let (mut w, mut seen) = recording_watcher(None);
    let (feed, stream) = synthetic_feed();
    feed.unbounded_send(Ok(Event::Restarted(vec![pod("a", "x", "1"), pod("a", "y", "1")]))).unwrap();
    w.start_with_stream(stream).await.unwrap();
    next_event(&mut seen).await;
    next_event(&mut seen).await;

    feed.unbounded_send(Ok(Event::Restarted(vec![pod("a", "x", "1")]))).unwrap();
    assert_eq!(next_event(&mut seen).await, (EventType::Deleted, "y".to_string()));
    assert_eq!(w.list(Some("a")).unwrap().len(), 1);
}

#[tokio::test]
async fn get_without_namespace_needs_explicit_namespace() {
    let (mut w, _seen) = recording_watcher(None);
    let (feed, stream) = synthetic_feed();
    feed.unbounded_send(Ok(Event::Restarted(vec![pod("a", "x", "1")]))).unwrap();
    w.start_with_stream(stream).await.unwrap();
    assert!(matches!(w.get("x"), Err(KdashError::Validation(_))));
    assert!(w.get_in("a", "x").is_ok());
}

#[tokio::test]
async fn cluster_scoped_get_ignores_namespace() {
    let mut w = ResourceWatcher::<Namespace>::new("c1", config(Some("default")), CancellationToken::new());
    let ns = Namespace { metadata: ObjectMeta { name: Some("kube-system".into()), ..Default::default() }, ..Default::default() };
    let (feed, stream) = synthetic_feed();
    feed.unbounded_send(Ok(Event::Restarted(vec![ns]))).unwrap();
    w.start_with_stream(stream).await.unwrap();
    assert!(w.get("kube-system").is_ok());
    assert!(w.get_in("ignored", "kube-system").is_ok());
}

#[tokio::test]
async fn cancelling_the_cluster_scope_stops_the_watcher() {
    let cluster = CancellationToken::new();
    let mut w = ResourceWatcher::<Pod>::new("c1", config(None), cluster.child_token());
    let (feed, stream) = synthetic_feed();
    feed.unbounded_send(Ok(Event::Restarted(vec![pod("a", "x", "1")]))).unwrap();
    w.start_with_stream(stream).await.unwrap();

    cluster.cancel();
    w.shutdown().await;
    assert_eq!(w.state(), SyncState::Stopped);
    assert!(matches!(w.list(None), Err(KdashError::NotReady(_))));
    // events after stop go nowhere
    assert!(feed.unbounded_send(Ok(Event::Applied(pod("a", "z", "2")))).is_err());
}
