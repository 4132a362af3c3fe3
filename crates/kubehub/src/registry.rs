//! Cluster registry: lazy authentication, reauthentication and lifecycle of every cluster.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures::future::join_all;
use kdash_core::{ClusterInfo, KdashError, KdashResult};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ClusterConnection;
use crate::provider::{ClusterCredentials, CredentialProvider};

type Connection<P> = ClusterConnection<<P as CredentialProvider>::Credentials>;

pub struct ClusterRegistry<P: CredentialProvider> {
    provider: Arc<P>,
    clusters: RwLock<FxHashMap<String, Arc<Connection<P>>>>,
    root: CancellationToken,
}

impl<P: CredentialProvider> ClusterRegistry<P> {
    pub fn new(provider: P) -> Self {
        Self::with_shared(Arc::new(provider))
    }

    pub fn with_shared(provider: Arc<P>) -> Self {
        Self { provider, clusters: RwLock::new(FxHashMap::default()), root: CancellationToken::new() }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Register a cluster by ID without contacting it. Returns false if it was already registered.
    pub fn register(&self, cluster_id: &str) -> bool {
        let mut clusters = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
        if clusters.contains_key(cluster_id) {
            warn!(cluster = %cluster_id, "cluster already registered");
            return false;
        }
        clusters.insert(
            cluster_id.to_string(),
            Arc::new(ClusterConnection::new(cluster_id, self.root.child_token())),
        );
        info!(cluster = %cluster_id, "cluster registered");
        true
    }

    /// Like [`ClusterRegistry::register`] but a duplicate is an error.
    pub fn register_strict(&self, cluster_id: &str) -> KdashResult<()> {
        if self.register(cluster_id) {
            Ok(())
        } else {
            Err(KdashError::AlreadyExists(format!("cluster {}", cluster_id)))
        }
    }

    /// Register every cluster the provider can discover. Returns the newly registered IDs.
    pub async fn discover_and_register(&self) -> KdashResult<Vec<String>> {
        let found = self.provider.discover_clusters().await?;
        Ok(found.into_iter().filter(|d| self.register(&d.id)).map(|d| d.id).collect())
    }

    fn lookup(&self, cluster_id: &str) -> KdashResult<Arc<Connection<P>>> {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| KdashError::NotFound(format!("cluster {} not registered", cluster_id)))
    }

    /// Connection for `cluster_id`, authenticating on first use.
    ///
    /// Concurrent first callers share a single authentication attempt.
    pub async fn get_connection(&self, cluster_id: &str) -> KdashResult<Arc<Connection<P>>> {
        let conn = self.lookup(cluster_id)?;
        if conn.is_authenticated() {
            return Ok(conn);
        }
        {
            let _gate = conn.lock_auth().await;
            if !conn.is_authenticated() {
                self.authenticate_locked(&conn).await?;
            }
        }
        Ok(conn)
    }

    /// Authenticated credentials for `cluster_id`.
    pub async fn credentials(&self, cluster_id: &str) -> KdashResult<Arc<P::Credentials>> {
        let conn = self.get_connection(cluster_id).await?;
        conn.credentials()
            .ok_or_else(|| KdashError::Internal(format!("cluster {} authenticated without credentials", cluster_id)))
    }

    /// Run `op` with the cluster's credentials. On an authentication failure the cluster
    /// is reauthenticated and `op` retried exactly once; the retry's outcome is final.
    pub async fn with_reauthentication<T, F, Fut>(&self, cluster_id: &str, op: F) -> KdashResult<T>
    where
        F: Fn(Arc<P::Credentials>) -> Fut,
        Fut: Future<Output = KdashResult<T>>,
    {
        let conn = self.get_connection(cluster_id).await?;
        let seen = conn.generation();
        let creds = conn
            .credentials()
            .ok_or_else(|| KdashError::Internal(format!("cluster {} authenticated without credentials", cluster_id)))?;
        match op(creds).await {
            Err(e) if e.is_auth() => {
                warn!(cluster = %cluster_id, error = %e, "credentials rejected, reauthenticating");
                counter!("kdash_cluster_reauth_total", 1, "cluster" => cluster_id.to_string());
                let fresh = self.refresh(&conn, seen).await?;
                op(fresh).await
            }
            other => other,
        }
    }

    /// Reauthenticate unless someone else already did since `seen` generation.
    async fn refresh(&self, conn: &Connection<P>, seen: u64) -> KdashResult<Arc<P::Credentials>> {
        let _gate = conn.lock_auth().await;
        if conn.generation() != seen {
            if let Some(creds) = conn.credentials() {
                return Ok(creds);
            }
        }
        self.authenticate_locked(conn).await
    }

    async fn authenticate_locked(&self, conn: &Connection<P>) -> KdashResult<Arc<P::Credentials>> {
        let started = Instant::now();
        let result = self.provider.authenticate(conn.id()).await;
        histogram!("kdash_cluster_auth_ms", started.elapsed().as_secs_f64() * 1000.0);
        match result {
            Ok(creds) => {
                counter!("kdash_cluster_auth_total", 1, "outcome" => "ok");
                info!(cluster = %conn.id(), api_url = ?creds.api_url(), "cluster authenticated");
                Ok(conn.install_credentials(creds))
            }
            Err(e) => {
                counter!("kdash_cluster_auth_total", 1, "outcome" => "error");
                warn!(cluster = %conn.id(), error = %e, "cluster authentication failed");
                Err(match e {
                    KdashError::AuthenticationFailed(_) => e,
                    other => KdashError::AuthenticationFailed(format!("cluster {}: {}", conn.id(), other)),
                })
            }
        }
    }

    /// Stop the cluster's watchers and forget it.
    pub fn deregister(&self, cluster_id: &str) -> KdashResult<()> {
        let removed = self.clusters.write().unwrap_or_else(PoisonError::into_inner).remove(cluster_id);
        match removed {
            Some(conn) => {
                conn.stop();
                info!(cluster = %cluster_id, "cluster deregistered");
                Ok(())
            }
            None => Err(KdashError::NotFound(format!("cluster {} not registered", cluster_id))),
        }
    }

    /// Stop and forget every cluster. Never fails; an empty registry is fine.
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.clusters.write().unwrap_or_else(PoisonError::into_inner).drain().collect();
        for (_, conn) in &drained {
            conn.stop();
        }
        info!(clusters = drained.len(), "all clusters stopped");
    }

    /// Snapshot of every connection, ordered by cluster ID.
    pub fn connections(&self) -> Vec<Arc<Connection<P>>> {
        let mut out: Vec<_> = self.clusters.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn list_clusters(&self) -> Vec<String> {
        self.connections().iter().map(|c| c.id().to_string()).collect()
    }

    pub fn cluster_infos(&self) -> Vec<ClusterInfo> {
        self.connections().iter().map(|c| c.info()).collect()
    }

    /// Probe every cluster concurrently; unauthenticated clusters report unhealthy.
    pub async fn check_health(&self) -> Vec<(String, bool)> {
        let conns = self.connections();
        let probes = conns.iter().map(|c| async move { (c.id().to_string(), c.health().await) });
        join_all(probes).await
    }
}

/// Run `start` for every cluster concurrently. Every start runs to completion; failures
/// are aggregated into one error naming each failed cluster.
pub async fn start_all<I, F, Fut>(cluster_ids: I, start: F) -> KdashResult<()>
where
    I: IntoIterator<Item = String>,
    F: Fn(String) -> Fut,
    Fut: Future<Output = KdashResult<()>>,
{
    let runs = cluster_ids.into_iter().map(|id| {
        let fut = start(id.clone());
        async move { (id, fut.await) }
    });
    let failures: Vec<String> = join_all(runs)
        .await
        .into_iter()
        .filter_map(|(id, r)| r.err().map(|e| format!("{}: {}", id, e)))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(KdashError::Internal(format!("{} cluster(s) failed to start: {}", failures.len(), failures.join("; "))))
    }
}
