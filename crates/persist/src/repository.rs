//! Repository contract shared by every backend.

use chrono::{DateTime, Utc};
use kdash_core::{composite_id, namespace_filter, strip_managed_fields, KdashError, KdashResult, KindOf, ResourceMeta, ResourceRecord};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

/// Selects records for bulk deletion. At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub cluster_id: Option<String>,
    pub namespace: Option<String>,
    pub kind: Option<String>,
}

impl RecordFilter {
    pub fn cluster(cluster_id: impl Into<String>) -> Self {
        Self { cluster_id: Some(cluster_id.into()), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.cluster_id.is_none() && self.namespace.is_none() && self.kind.is_none()
    }

    pub fn matches(&self, r: &ResourceRecord) -> bool {
        self.cluster_id.as_deref().map_or(true, |c| c == r.cluster_id)
            && self.kind.as_deref().map_or(true, |k| k == r.kind)
            && self.namespace.as_deref().map_or(true, |ns| r.namespace.as_deref() == Some(ns))
    }

    pub(crate) fn ensure_not_empty(&self) -> KdashResult<()> {
        if self.is_empty() {
            Err(KdashError::Validation("refusing to delete with an empty filter".into()))
        } else {
            Ok(())
        }
    }
}

/// Durable latest-state store. Implementations serialize writes per key; a save replaces the
/// stored value in full and keeps the original creation time.
pub trait Repository: Send + Sync {
    /// Upsert one serialized resource and return the stored record.
    fn save(&self, cluster_id: &str, resource: &Value) -> KdashResult<ResourceRecord>;

    fn get(&self, cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> KdashResult<ResourceRecord>;

    /// Records of one cluster; `namespace` of `None`, "" or "all" and `kind` of "" match everything.
    fn list(&self, cluster_id: &str, namespace: Option<&str>, kind: &str) -> KdashResult<Vec<ResourceRecord>>;

    /// Remove one record. Returns whether it existed; a missing record is not an error.
    fn delete(&self, cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> KdashResult<bool>;

    fn delete_by_filter(&self, filter: &RecordFilter) -> KdashResult<usize>;

    fn close(&self) -> KdashResult<()> {
        Ok(())
    }
}

/// Build the record a save would write, stamped `now` for both timestamps.
pub fn new_record(cluster_id: &str, resource: &Value, now: DateTime<Utc>) -> KdashResult<ResourceRecord> {
    let meta = ResourceMeta::from_value(resource)?;
    if meta.kind.is_empty() {
        warn!(cluster = %cluster_id, name = %meta.name, "saving resource without kind");
    }
    let mut stored = resource.clone();
    strip_managed_fields(&mut stored);
    Ok(ResourceRecord {
        id: meta.composite_id(cluster_id),
        cluster_id: cluster_id.to_string(),
        uid: meta.uid_or_synthetic(cluster_id),
        kind: meta.kind,
        api_version: meta.api_version,
        namespace: meta.namespace,
        name: meta.name,
        resource_version: meta.resource_version,
        resource: stored,
        created_at: now,
        updated_at: now,
    })
}

pub(crate) fn record_id(cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> String {
    composite_id(cluster_id, kind, namespace_filter(namespace), name)
}

pub(crate) fn not_found(cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> KdashError {
    KdashError::NotFound(format!("record {}", record_id(cluster_id, namespace, kind, name)))
}

/// Typed helpers over any repository for the watched kinds.
pub trait RepositoryExt: Repository {
    fn save_object<K: KindOf + Serialize>(&self, cluster_id: &str, obj: &K) -> KdashResult<ResourceRecord> {
        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.entry("kind").or_insert_with(|| K::KIND.kind_name().into());
            map.entry("apiVersion").or_insert_with(|| "v1".into());
        }
        self.save(cluster_id, &value)
    }

    fn get_object<K: KindOf + DeserializeOwned>(&self, cluster_id: &str, namespace: Option<&str>, name: &str) -> KdashResult<K> {
        self.get(cluster_id, namespace, K::KIND.kind_name(), name)?.decode()
    }

    fn list_objects<K: KindOf + DeserializeOwned>(&self, cluster_id: &str, namespace: Option<&str>) -> KdashResult<Vec<K>> {
        self.list(cluster_id, namespace, K::KIND.kind_name())?.iter().map(ResourceRecord::decode).collect()
    }
}

impl<R: Repository + ?Sized> RepositoryExt for R {}
