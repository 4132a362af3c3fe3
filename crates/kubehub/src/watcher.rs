//! Typed list+watch of one kind on one cluster, feeding a cache and its subscribers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt, TryStreamExt};
use kdash_core::{namespace_filter, KdashError, KdashResult, ObjectKey, ResourceKind};
use kdash_store::{cache, CacheReader, CacheWriter, Change, ChangeHandler, SyncState, WatchedResource};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ClusterConnection;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// How long `start` waits for the initial listing.
    pub sync_timeout: Duration,
    /// Restrict namespaced kinds to one namespace; `None`, "" or "all" watches every namespace.
    pub namespace: Option<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { sync_timeout: Duration::from_secs(30), namespace: None }
    }
}

impl WatcherConfig {
    fn namespace(&self) -> Option<&str> {
        namespace_filter(self.namespace.as_deref())
    }
}

/// Type-erased view of a running watcher, for keeping heterogeneous kinds alive together.
pub trait WatcherHandle: Send + Sync {
    fn cluster_id(&self) -> &str;
    fn kind(&self) -> ResourceKind;
    fn has_synced(&self) -> bool;
    fn stop(&self);
}

pub struct ResourceWatcher<K: WatchedResource> {
    cluster_id: String,
    config: WatcherConfig,
    reader: CacheReader<K>,
    writer: Option<CacheWriter<K>>,
    handlers: Vec<Arc<dyn ChangeHandler<K>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<K: WatchedResource> ResourceWatcher<K> {
    pub fn new(cluster_id: impl Into<String>, config: WatcherConfig, cancel: CancellationToken) -> Self {
        let cluster_id = cluster_id.into();
        let (writer, reader) = cache::<K>(&cluster_id);
        Self { cluster_id, config, reader, writer: Some(writer), handlers: Vec::new(), cancel, task: None }
    }

    /// Watcher scoped to a registered cluster; stopping the cluster stops the watcher.
    pub fn for_connection<C>(conn: &ClusterConnection<C>, config: WatcherConfig) -> Self
    where
        C: crate::provider::ClusterCredentials,
    {
        Self::new(conn.id(), config, conn.cancel_token())
    }

    /// Add a subscriber. Subscribers run in registration order for every applied change.
    pub fn subscribe<H>(&mut self, handler: H) -> KdashResult<()>
    where
        H: ChangeHandler<K> + 'static,
    {
        if self.writer.is_none() {
            return Err(KdashError::Validation(format!("{} watcher already started", self.label())));
        }
        self.handlers.push(Arc::new(handler));
        Ok(())
    }

    fn label(&self) -> String {
        format!("{}/{}", self.cluster_id, K::KIND)
    }

    /// Start list+watch against the cluster and wait for the initial sync.
    pub async fn start(&mut self, client: Client) -> KdashResult<()> {
        let api: Api<K> = Api::all(client);
        let mut cfg = watcher::Config::default();
        if !K::KIND.is_cluster_scoped() {
            if let Some(ns) = self.config.namespace() {
                cfg = cfg.fields(&format!("metadata.namespace={}", ns));
            }
        }
        let stream = watcher::watcher(api, cfg).default_backoff();
        self.start_with_stream(stream).await
    }

    /// Drive the cache from an arbitrary watch event stream and wait for the initial sync.
    ///
    /// Returns `NotReady` if no full listing arrives within the sync timeout; the watcher
    /// keeps running in that case.
    pub async fn start_with_stream<S, E>(&mut self, stream: S) -> KdashResult<()>
    where
        S: Stream<Item = Result<Event<K>, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| KdashError::Validation(format!("{} watcher already started", self.label())))?;
        writer.begin_sync();
        let handlers = std::mem::take(&mut self.handlers);
        let label = self.label();
        info!(watcher = %label, namespace = ?self.config.namespace(), subscribers = handlers.len(), "watcher starting");
        let started = Instant::now();
        self.task = Some(tokio::spawn(drive(writer, stream, handlers, self.cancel.clone(), label.clone())));
        match self.reader.wait_synced(self.config.sync_timeout).await {
            Ok(()) => {
                histogram!("kdash_watch_sync_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => K::KIND.kind_name());
                info!(watcher = %label, objects = self.reader.len(), "watcher synced");
                Ok(())
            }
            Err(e) => {
                warn!(watcher = %label, error = %e, "watcher did not sync");
                Err(e)
            }
        }
    }

    pub fn reader(&self) -> CacheReader<K> {
        self.reader.clone()
    }

    pub fn state(&self) -> SyncState {
        self.reader.state()
    }

    pub fn has_synced(&self) -> bool {
        self.reader.has_synced()
    }

    /// Cached objects in `namespace` (`None`, "" or "all" lists every namespace).
    pub fn list(&self, namespace: Option<&str>) -> KdashResult<Vec<K>> {
        self.reader.list(namespace)
    }

    /// Look up by name; namespaced kinds use the configured namespace.
    pub fn get(&self, name: &str) -> KdashResult<K> {
        if K::KIND.is_cluster_scoped() {
            return self.reader.get(&ObjectKey::new(None, name));
        }
        match self.config.namespace() {
            Some(ns) => self.reader.get(&ObjectKey::new(Some(ns), name)),
            None => Err(KdashError::Validation(format!(
                "{} watches every namespace; name {} needs an explicit namespace",
                self.label(),
                name
            ))),
        }
    }

    pub fn get_in(&self, namespace: &str, name: &str) -> KdashResult<K> {
        let ns = if K::KIND.is_cluster_scoped() { None } else { Some(namespace) };
        self.reader.get(&ObjectKey::new(ns, name))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the watch task to release the cache.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(watcher = %self.label(), error = %e, "watch task panicked");
            }
        }
    }
}

impl<K: WatchedResource> WatcherHandle for ResourceWatcher<K> {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn kind(&self) -> ResourceKind {
        K::KIND
    }

    fn has_synced(&self) -> bool {
        ResourceWatcher::has_synced(self)
    }

    fn stop(&self) {
        ResourceWatcher::stop(self)
    }
}

impl<K: WatchedResource> Drop for ResourceWatcher<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive<K, S, E>(
    mut writer: CacheWriter<K>,
    stream: S,
    handlers: Vec<Arc<dyn ChangeHandler<K>>>,
    cancel: CancellationToken,
    label: String,
) where
    K: WatchedResource,
    S: Stream<Item = Result<Event<K>, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = stream.map_err(|e| e.to_string());
    futures::pin_mut!(stream);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(watcher = %label, "watcher stopped");
                break;
            }
            next = stream.next() => next,
        };
        match next {
            None => {
                warn!(watcher = %label, "watch stream ended");
                break;
            }
            Some(Err(e)) => {
                counter!("kdash_watch_errors_total", 1, "kind" => K::KIND.kind_name());
                warn!(watcher = %label, error = %e, "watch stream error");
            }
            Some(Ok(Event::Restarted(objs))) => {
                debug!(watcher = %label, count = objs.len(), "watch (re)listed");
                for change in writer.replace(objs) {
                    dispatch(&handlers, &change, &label);
                }
            }
            Some(Ok(Event::Applied(obj))) => {
                if let Some(change) = writer.apply(obj) {
                    dispatch(&handlers, &change, &label);
                }
            }
            Some(Ok(Event::Deleted(obj))) => {
                if let Some(change) = writer.delete(obj) {
                    dispatch(&handlers, &change, &label);
                }
            }
        }
    }
}

fn dispatch<K: WatchedResource>(handlers: &[Arc<dyn ChangeHandler<K>>], change: &Change<K>, label: &str) {
    counter!("kdash_watch_events_total", 1, "kind" => K::KIND.kind_name(), "event" => change.event_type().as_str());
    for handler in handlers {
        if let Err(e) = handler.on_change(change) {
            counter!("kdash_watch_handler_errors_total", 1, "kind" => K::KIND.kind_name());
            warn!(watcher = %label, event = %change.event_type().as_str(), error = %e, "subscriber failed");
        }
    }
}
