//! In-memory repository sharded by record id. Saves for different shards never contend.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use kdash_core::{namespace_filter, KdashResult, ResourceRecord};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::repository::{new_record, not_found, record_id, RecordFilter, Repository};

const DEFAULT_SHARDS: usize = 16;

type Shard = Mutex<FxHashMap<String, ResourceRecord>>;

pub struct MemoryRepository {
    shards: Vec<Shard>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

/// FNV-1a; stable across runs so shard placement is deterministic.
fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(n: usize) -> Self {
        Self { shards: (0..n.max(1)).map(|_| Mutex::new(FxHashMap::default())).collect() }
    }

    fn shard(&self, id: &str) -> MutexGuard<'_, FxHashMap<String, ResourceRecord>> {
        let idx = (fnv1a(id) % self.shards.len() as u64) as usize;
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn each_shard(&self) -> impl Iterator<Item = MutexGuard<'_, FxHashMap<String, ResourceRecord>>> {
        self.shards.iter().map(|s| s.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.each_shard().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Repository for MemoryRepository {
    fn save(&self, cluster_id: &str, resource: &Value) -> KdashResult<ResourceRecord> {
        let mut record = new_record(cluster_id, resource, Utc::now())?;
        let mut shard = self.shard(&record.id);
        if let Some(prev) = shard.get(&record.id) {
            record.created_at = prev.created_at;
        }
        shard.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> KdashResult<ResourceRecord> {
        let id = record_id(cluster_id, namespace, kind, name);
        self.shard(&id).get(&id).cloned().ok_or_else(|| not_found(cluster_id, namespace, kind, name))
    }

    fn list(&self, cluster_id: &str, namespace: Option<&str>, kind: &str) -> KdashResult<Vec<ResourceRecord>> {
        let filter = RecordFilter {
            cluster_id: Some(cluster_id.to_string()),
            namespace: namespace_filter(namespace).map(str::to_string),
            kind: if kind.is_empty() { None } else { Some(kind.to_string()) },
        };
        let mut out: Vec<ResourceRecord> =
            self.each_shard().flat_map(|s| s.values().filter(|r| filter.matches(r)).cloned().collect::<Vec<_>>()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn delete(&self, cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> KdashResult<bool> {
        let id = record_id(cluster_id, namespace, kind, name);
        Ok(self.shard(&id).remove(&id).is_some())
    }

    fn delete_by_filter(&self, filter: &RecordFilter) -> KdashResult<usize> {
        filter.ensure_not_empty()?;
        let mut removed = 0;
        for mut shard in self.each_shard() {
            let before = shard.len();
            shard.retain(|_, r| !filter.matches(r));
            removed += before - shard.len();
        }
        Ok(removed)
    }
}
