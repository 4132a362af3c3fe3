//! Persisted record shape and metadata extraction at the storage boundary.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{composite_id, is_cluster_scoped_kind, synthetic_uid, KdashError, KdashResult};

/// Latest known state of one resource, addressed by its composite identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub id: String,
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub kind: String,
    pub api_version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    pub resource_version: String,
    pub resource: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Decode the stored resource into a typed object.
    pub fn decode<K: DeserializeOwned>(&self) -> KdashResult<K> {
        Ok(serde_json::from_value(self.resource.clone())?)
    }
}

/// Identity-relevant metadata pulled out of a serialized resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMeta {
    pub kind: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: String,
}

impl ResourceMeta {
    pub fn from_value(v: &serde_json::Value) -> KdashResult<Self> {
        let s = |val: Option<&serde_json::Value>| val.and_then(|x| x.as_str()).map(str::to_string);
        let meta = v.get("metadata");
        let name = s(meta.and_then(|m| m.get("name")))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| KdashError::Validation("resource must have a name".into()))?;
        let kind = s(v.get("kind")).unwrap_or_default();
        let namespace = if is_cluster_scoped_kind(&kind) {
            None
        } else {
            s(meta.and_then(|m| m.get("namespace"))).filter(|ns| !ns.is_empty())
        };
        Ok(Self {
            api_version: s(v.get("apiVersion")).unwrap_or_else(|| "v1".to_string()),
            kind,
            namespace,
            name,
            uid: s(meta.and_then(|m| m.get("uid"))).filter(|u| !u.is_empty()),
            resource_version: s(meta.and_then(|m| m.get("resourceVersion"))).unwrap_or_default(),
        })
    }

    pub fn composite_id(&self, cluster_id: &str) -> String {
        composite_id(cluster_id, &self.kind, self.namespace.as_deref(), &self.name)
    }

    /// Upstream UID, or the deterministic synthetic substitute.
    pub fn uid_or_synthetic(&self, cluster_id: &str) -> String {
        match &self.uid {
            Some(uid) => uid.clone(),
            None => synthetic_uid(cluster_id, self.namespace.as_deref(), &self.name),
        }
    }
}
