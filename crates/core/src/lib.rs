//! kdash core types: resource kinds, composite identity, envelopes and records.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod error;
pub mod record;

pub use envelope::{parse_topic, topic, ClusterAnnouncement, Envelope, EventType, CLUSTER_REGISTERED};
pub use error::{KdashError, KdashResult};
pub use record::{ResourceMeta, ResourceRecord};

pub mod prelude {
    pub use super::{
        composite_id, synthetic_uid, ClusterInfo, ClusterStatus, Envelope, EventType, KdashError, KdashResult,
        KindOf, ObjectKey, ResourceKind, ResourceMeta, ResourceRecord,
    };
}

/// Resource kinds the dashboard watches and persists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Pod,
    ConfigMap,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Namespace, ResourceKind::Pod, ResourceKind::ConfigMap];

    /// Upstream `kind` string.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Pod => "Pod",
            ResourceKind::ConfigMap => "ConfigMap",
        }
    }

    /// Prefix used to build `<prefix>_added` style topics.
    pub fn topic_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::Pod => "pod",
            ResourceKind::ConfigMap => "configmap",
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, ResourceKind::Namespace)
    }

    pub fn from_kind_name(kind: &str) -> Option<Self> {
        ResourceKind::ALL.into_iter().find(|k| k.kind_name() == kind)
    }

    pub fn from_topic_prefix(prefix: &str) -> Option<Self> {
        ResourceKind::ALL.into_iter().find(|k| k.topic_prefix() == prefix)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

impl FromStr for ResourceKind {
    type Err = KdashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "namespace" | "namespaces" | "ns" => Ok(ResourceKind::Namespace),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "configmap" | "configmaps" | "cm" => Ok(ResourceKind::ConfigMap),
            other => Err(KdashError::Validation(format!("unknown resource kind: {}", other))),
        }
    }
}

/// Static binding between a typed resource and its [`ResourceKind`].
pub trait KindOf {
    const KIND: ResourceKind;
}

impl KindOf for k8s_openapi::api::core::v1::Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;
}

impl KindOf for k8s_openapi::api::core::v1::Pod {
    const KIND: ResourceKind = ResourceKind::Pod;
}

impl KindOf for k8s_openapi::api::core::v1::ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;
}

/// Cluster-scoped kinds by upstream kind name. Repository keys omit the namespace for these.
pub fn is_cluster_scoped_kind(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "Node"
            | "PersistentVolume"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "StorageClass"
            | "CustomResourceDefinition"
    )
}

/// Namespace filter semantics shared by watchers and repositories: empty or "all" means cluster-wide.
pub fn namespace_filter(namespace: Option<&str>) -> Option<&str> {
    match namespace {
        None | Some("") | Some("all") => None,
        Some(ns) => Some(ns),
    }
}

/// Composite identity `cluster:namespace:kind:name`, or `cluster:kind:name` for cluster-scoped kinds.
pub fn composite_id(cluster_id: &str, kind: &str, namespace: Option<&str>, name: &str) -> String {
    if is_cluster_scoped_kind(kind) {
        format!("{}:{}:{}", cluster_id, kind, name)
    } else {
        format!("{}:{}:{}:{}", cluster_id, namespace.unwrap_or(""), kind, name)
    }
}

/// Deterministic substitute for a missing upstream UID.
///
/// Downstream idempotence relies on this exact derivation; do not change the format.
pub fn synthetic_uid(cluster_id: &str, namespace: Option<&str>, name: &str) -> String {
    format!("{}-{}-{}", cluster_id, namespace.unwrap_or(""), name)
}

/// Cache key of one object within a (cluster, kind) stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Registered,
    Authenticated,
    Running,
}

/// Summary of one registered cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "apiUrl")]
    pub api_url: String,
    pub status: ClusterStatus,
}

/// Remove `metadata.managedFields`; it dominates payload size and nobody downstream reads it.
pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if !cfg!(feature = "strip-managed-fields") {
        return;
    }
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_id_omits_namespace_for_cluster_scoped() {
        assert_eq!(composite_id("c1", "Namespace", Some("ignored"), "kube-system"), "c1:Namespace:kube-system");
        assert_eq!(composite_id("c1", "Pod", Some("default"), "web-1"), "c1:default:Pod:web-1");
        assert_eq!(composite_id("c1", "Pod", None, "web-1"), "c1::Pod:web-1");
    }

    #[test]
    fn synthetic_uid_is_deterministic() {
        let a = synthetic_uid("c1", Some("default"), "web-1");
        let b = synthetic_uid("c1", Some("default"), "web-1");
        assert_eq!(a, b);
        assert_eq!(a, "c1-default-web-1");
        assert_eq!(synthetic_uid("c1", None, "kube-system"), "c1--kube-system");
    }

    #[test]
    fn kind_parsing_and_names() {
        assert_eq!("pods".parse::<ResourceKind>().unwrap(), ResourceKind::Pod);
        assert_eq!("CM".parse::<ResourceKind>().unwrap(), ResourceKind::ConfigMap);
        assert!("deployment".parse::<ResourceKind>().is_err());
        assert_eq!(ResourceKind::from_kind_name("Namespace"), Some(ResourceKind::Namespace));
        assert!(ResourceKind::Namespace.is_cluster_scoped());
        assert!(!ResourceKind::Pod.is_cluster_scoped());
        assert!(is_cluster_scoped_kind("Node"));
    }

    #[test]
    fn namespace_filter_all_means_cluster_wide() {
        assert_eq!(namespace_filter(Some("all")), None);
        assert_eq!(namespace_filter(Some("")), None);
        assert_eq!(namespace_filter(Some("default")), Some("default"));
    }

    #[test]
    fn object_key_normalizes_empty_namespace() {
        assert_eq!(ObjectKey::new(Some(""), "a"), ObjectKey::new(None, "a"));
        assert_eq!(ObjectKey::new(Some("ns"), "a").to_string(), "ns/a");
    }

    #[test]
    fn strip_managed_fields_removes_only_that_key() {
        let mut v = serde_json::json!({"metadata": {"name": "a", "managedFields": [{"manager": "kubectl"}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "a");
    }
}
