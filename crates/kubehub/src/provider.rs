//! Credential providers: where cluster credentials come from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kdash_core::{KdashError, KdashResult};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classify_kube_error;

/// A cluster a provider knows how to reach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub id: String,
    pub api_url: Option<String>,
    pub kubeconfig_path: Option<PathBuf>,
}

/// Opaque authenticated handle to one cluster.
#[async_trait]
pub trait ClusterCredentials: Clone + Send + Sync + 'static {
    fn api_url(&self) -> Option<String> {
        None
    }

    /// Cheap read against the live cluster.
    async fn probe(&self) -> KdashResult<()>;
}

/// Pluggable source of cluster credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    type Credentials: ClusterCredentials;

    async fn authenticate(&self, cluster_id: &str) -> KdashResult<Self::Credentials>;

    async fn discover_clusters(&self) -> KdashResult<Vec<ClusterDescriptor>>;
}

/// kube-rs client bound to one kubeconfig context.
#[derive(Clone)]
pub struct KubeCredentials {
    pub client: Client,
    pub api_url: String,
}

impl std::fmt::Debug for KubeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCredentials").field("api_url", &self.api_url).finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterCredentials for KubeCredentials {
    fn api_url(&self) -> Option<String> {
        Some(self.api_url.clone())
    }

    async fn probe(&self) -> KdashResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.list(&ListParams::default().limit(1)).await.map_err(classify_kube_error)?;
        Ok(())
    }
}

/// Treats every context of one kubeconfig file as a cluster; the context name is the cluster ID.
#[derive(Debug, Clone)]
pub struct KubeconfigProvider {
    path: PathBuf,
}

impl KubeconfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `KDASH_KUBECONFIG`, then the first entry of `KUBECONFIG`, then `~/.kube/config`.
    pub fn from_env() -> KdashResult<Self> {
        if let Some(p) = std::env::var_os("KDASH_KUBECONFIG") {
            return Ok(Self::new(p));
        }
        if let Some(list) = std::env::var_os("KUBECONFIG") {
            if let Some(first) = std::env::split_paths(&list).next() {
                return Ok(Self::new(first));
            }
        }
        let home = std::env::var_os("HOME")
            .ok_or_else(|| KdashError::Validation("no kubeconfig: HOME and KUBECONFIG unset".into()))?;
        let mut p = PathBuf::from(home);
        p.push(".kube");
        p.push("config");
        Ok(Self::new(p))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> KdashResult<Kubeconfig> {
        Kubeconfig::read_from(&self.path)
            .map_err(|e| KdashError::Validation(format!("reading kubeconfig {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl CredentialProvider for KubeconfigProvider {
    type Credentials = KubeCredentials;

    async fn authenticate(&self, cluster_id: &str) -> KdashResult<KubeCredentials> {
        let kubeconfig = self.read()?;
        let options = KubeConfigOptions { context: Some(cluster_id.to_string()), ..Default::default() };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| KdashError::AuthenticationFailed(format!("cluster {}: {}", cluster_id, e)))?;
        let api_url = config.cluster_url.to_string();
        let client = Client::try_from(config)
            .map_err(|e| KdashError::AuthenticationFailed(format!("cluster {}: building client: {}", cluster_id, e)))?;
        debug!(cluster = %cluster_id, api_url = %api_url, "kubeconfig credentials loaded");
        Ok(KubeCredentials { client, api_url })
    }

    async fn discover_clusters(&self) -> KdashResult<Vec<ClusterDescriptor>> {
        let kubeconfig = self.read()?;
        let mut out = Vec::with_capacity(kubeconfig.contexts.len());
        for named in &kubeconfig.contexts {
            let cluster_name = named.context.as_ref().map(|c| c.cluster.clone()).unwrap_or_default();
            let cluster = kubeconfig.clusters.iter().find(|c| c.name == cluster_name).ok_or_else(|| {
                KdashError::Validation(format!("context {} references unknown cluster {}", named.name, cluster_name))
            })?;
            let server = cluster.cluster.as_ref().and_then(|c| c.server.clone());
            info!(context = %named.name, cluster = %cluster_name, server = ?server, "discovered cluster");
            out.push(ClusterDescriptor {
                id: named.name.clone(),
                api_url: server,
                kubeconfig_path: Some(self.path.clone()),
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
