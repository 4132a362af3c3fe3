//! Agent-side wiring: watchers per (cluster, kind) feeding the event publisher.

use std::sync::{Arc, Mutex, PoisonError};

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kdash_bus::{EnvelopeBridge, EventPublisher, EventSink};
use kdash_core::{KdashError, KdashResult, ResourceKind};
use kdash_kubehub::{start_all, ClusterRegistry, KubeconfigProvider, ResourceWatcher, WatcherConfig, WatcherHandle};
use kdash_store::WatchedResource;
use kube::Client;
use tracing::{info, warn};

pub type Registry = ClusterRegistry<KubeconfigProvider>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub kinds: Vec<ResourceKind>,
    pub watcher: WatcherConfig,
}

/// Keep a watcher whose start only timed out; its background watch keeps syncing.
fn keep_syncing<K: WatchedResource>(
    watcher: ResourceWatcher<K>,
    started: KdashResult<()>,
) -> KdashResult<Box<dyn WatcherHandle>> {
    match started {
        Ok(()) => Ok(Box::new(watcher)),
        Err(KdashError::NotReady(reason)) => {
            warn!(cluster = %watcher.cluster_id(), kind = %K::KIND, %reason, "initial sync still running in background");
            Ok(Box::new(watcher))
        }
        Err(e) => Err(e),
    }
}

async fn start_kind<K: WatchedResource>(
    cluster_id: &str,
    registry: &Registry,
    client: Client,
    sink: EventSink,
    cfg: &WatcherConfig,
) -> KdashResult<Box<dyn WatcherHandle>> {
    let conn = registry.get_connection(cluster_id).await?;
    let mut watcher = ResourceWatcher::<K>::for_connection(&conn, cfg.clone());
    watcher.subscribe(EnvelopeBridge::<K>::new(cluster_id, sink))?;
    let started = watcher.start(client).await;
    keep_syncing(watcher, started)
}

/// Start every configured kind of one cluster. Started watchers land in `handles` as they come
/// up, so a failing kind never takes the others down with it.
async fn start_cluster(
    registry: &Registry,
    publisher: &EventPublisher,
    cluster_id: &str,
    cfg: &AgentConfig,
    handles: &Mutex<Vec<Box<dyn WatcherHandle>>>,
) -> KdashResult<()> {
    let creds = registry.credentials(cluster_id).await?;
    if let Err(e) = publisher.announce_cluster(cluster_id, &creds.api_url).await {
        warn!(cluster = %cluster_id, error = %e, "consumer never acknowledged cluster; watching anyway");
    }
    let mut first_err = None;
    for kind in &cfg.kinds {
        let client = creds.client.clone();
        let sink = publisher.sink();
        let started = match kind {
            ResourceKind::Namespace => start_kind::<Namespace>(cluster_id, registry, client, sink, &cfg.watcher).await,
            ResourceKind::Pod => start_kind::<Pod>(cluster_id, registry, client, sink, &cfg.watcher).await,
            ResourceKind::ConfigMap => start_kind::<ConfigMap>(cluster_id, registry, client, sink, &cfg.watcher).await,
        };
        match started {
            Ok(handle) => handles.lock().unwrap_or_else(PoisonError::into_inner).push(handle),
            Err(e) => {
                warn!(cluster = %cluster_id, kind = %kind, error = %e, "watcher failed to start");
                first_err.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    registry.get_connection(cluster_id).await?.mark_running();
    info!(cluster = %cluster_id, kinds = ?cfg.kinds, "cluster watching");
    Ok(())
}

/// Start every registered cluster. Failures are reported together; whatever did start keeps
/// running, including watchers still finishing their initial sync.
pub async fn start_watchers(
    registry: &Arc<Registry>,
    publisher: &EventPublisher,
    cfg: &AgentConfig,
) -> (Vec<Box<dyn WatcherHandle>>, KdashResult<()>) {
    let handles: Mutex<Vec<Box<dyn WatcherHandle>>> = Mutex::new(Vec::new());
    let result = start_all(registry.list_clusters(), |id| {
        let handles = &handles;
        async move { start_cluster(registry, publisher, &id, cfg, handles).await }
    })
    .await;
    (handles.into_inner().unwrap_or_else(PoisonError::into_inner), result)
}
