//! SQLite-backed repository over a connection pool.
//!
//! File databases run in WAL mode, so reads never wait for writers. Each save is one upsert
//! statement; SQLite's own write lock orders concurrent saves, waiting up to the busy timeout.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use kdash_core::{namespace_filter, KdashError, KdashResult, ResourceRecord};
use metrics::{counter, histogram};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, ErrorCode, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};

use crate::repository::{new_record, not_found, record_id, RecordFilter, Repository};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resources (
    id               TEXT PRIMARY KEY,
    cluster_id       TEXT NOT NULL,
    kind             TEXT NOT NULL,
    api_version      TEXT NOT NULL,
    namespace        TEXT,
    name             TEXT NOT NULL,
    uid              TEXT NOT NULL,
    resource_version TEXT NOT NULL,
    resource         TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_resources_scope ON resources(cluster_id, kind, namespace);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_SIZE: u32 = 8;

const COLUMNS: &str =
    "id, cluster_id, kind, api_version, namespace, name, uid, resource_version, resource, created_at, updated_at";

fn store_err(e: rusqlite::Error) -> KdashError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
            KdashError::StoreConflict(e.to_string())
        }
        _ => KdashError::StoreIo(e.to_string()),
    }
}

fn millis_to_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(ResourceRecord, String)> {
    let resource: String = row.get(8)?;
    Ok((
        ResourceRecord {
            id: row.get(0)?,
            cluster_id: row.get(1)?,
            kind: row.get(2)?,
            api_version: row.get(3)?,
            namespace: row.get(4)?,
            name: row.get(5)?,
            uid: row.get(6)?,
            resource_version: row.get(7)?,
            resource: Value::Null,
            created_at: millis_to_time(row.get(9)?),
            updated_at: millis_to_time(row.get(10)?),
        },
        resource,
    ))
}

fn decode_row(parts: (ResourceRecord, String)) -> KdashResult<ResourceRecord> {
    let (mut record, raw) = parts;
    record.resource = serde_json::from_str(&raw)
        .map_err(|e| KdashError::StoreIo(format!("record {} holds invalid json: {}", record.id, e)))?;
    Ok(record)
}

fn pool_err(e: r2d2::Error) -> KdashError {
    KdashError::StoreIo(format!("sqlite pool: {}", e))
}

pub struct SqliteRepository {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteRepository {
    /// `KDASH_DB_PATH`, else `~/.kdash/kdash.db`.
    pub fn open_default() -> KdashResult<Self> {
        let path = std::env::var("KDASH_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> KdashResult<Self> {
        let started = Instant::now();
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.busy_timeout(BUSY_TIMEOUT)?;
            c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            c.pragma_update(None, "synchronous", "NORMAL")
        });
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .map_err(|e| KdashError::StoreIo(format!("opening sqlite db at {}: {}", path, e)))?;
        let me = Self::init(pool)?;
        histogram!("kdash_repo_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path, pool = POOL_SIZE, "repository opened");
        Ok(me)
    }

    /// Every `:memory:` connection is its own database, so the pool holds exactly one that
    /// never expires.
    pub fn open_in_memory() -> KdashResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())
            .map_err(pool_err)?;
        Self::init(pool)
    }

    fn init(pool: Pool<SqliteConnectionManager>) -> KdashResult<Self> {
        pool.get().map_err(pool_err)?.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> KdashResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(pool_err)
    }

    pub fn count(&self) -> KdashResult<usize> {
        let n: i64 = self.conn()?.query_row("SELECT COUNT(*) FROM resources", [], |r| r.get(0)).map_err(store_err)?;
        Ok(n as usize)
    }
}

impl Repository for SqliteRepository {
    fn save(&self, cluster_id: &str, resource: &Value) -> KdashResult<ResourceRecord> {
        let started = Instant::now();
        // stored at millisecond precision; keep the returned record identical to a later read
        let mut record = new_record(cluster_id, resource, millis_to_time(Utc::now().timestamp_millis()))?;
        let body = serde_json::to_string(&record.resource)?;
        let now_ms = record.updated_at.timestamp_millis();
        let created_ms: i64 = self
            .conn()?
            .query_row(
                "INSERT INTO resources (id, cluster_id, kind, api_version, namespace, name, uid, resource_version, resource, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    cluster_id = excluded.cluster_id,
                    kind = excluded.kind,
                    api_version = excluded.api_version,
                    namespace = excluded.namespace,
                    name = excluded.name,
                    uid = excluded.uid,
                    resource_version = excluded.resource_version,
                    resource = excluded.resource,
                    updated_at = excluded.updated_at
                 RETURNING created_at",
                params![
                    record.id,
                    record.cluster_id,
                    record.kind,
                    record.api_version,
                    record.namespace,
                    record.name,
                    record.uid,
                    record.resource_version,
                    body,
                    now_ms,
                ],
                |r| r.get(0),
            )
            .map_err(store_err)?;
        record.created_at = millis_to_time(created_ms);
        histogram!("kdash_repo_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("kdash_repo_save_total", 1, "kind" => record.kind.clone());
        debug!(id = %record.id, rv = %record.resource_version, "record saved");
        Ok(record)
    }

    fn get(&self, cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> KdashResult<ResourceRecord> {
        let started = Instant::now();
        let id = record_id(cluster_id, namespace, kind, name);
        let found = self
            .conn()?
            .query_row(&format!("SELECT {} FROM resources WHERE id = ?1", COLUMNS), [&id], row_to_record)
            .optional()
            .map_err(store_err)?;
        histogram!("kdash_repo_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        match found {
            Some(parts) => decode_row(parts),
            None => Err(not_found(cluster_id, namespace, kind, name)),
        }
    }

    fn list(&self, cluster_id: &str, namespace: Option<&str>, kind: &str) -> KdashResult<Vec<ResourceRecord>> {
        let ns = namespace_filter(namespace);
        let kind = if kind.is_empty() { None } else { Some(kind) };
        let rows: Vec<(ResourceRecord, String)> = {
            let db = self.conn()?;
            let mut stmt = db
                .prepare(&format!(
                    "SELECT {} FROM resources
                     WHERE cluster_id = ?1 AND (?2 IS NULL OR kind = ?2) AND (?3 IS NULL OR namespace = ?3)
                     ORDER BY id",
                    COLUMNS
                ))
                .map_err(store_err)?;
            let mapped = stmt.query_map(params![cluster_id, kind, ns], row_to_record).map_err(store_err)?;
            let rows = mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)?;
            rows
        };
        rows.into_iter().map(decode_row).collect()
    }

    fn delete(&self, cluster_id: &str, namespace: Option<&str>, kind: &str, name: &str) -> KdashResult<bool> {
        let id = record_id(cluster_id, namespace, kind, name);
        let n = self.conn()?.execute("DELETE FROM resources WHERE id = ?1", [&id]).map_err(store_err)?;
        debug!(id = %id, existed = n > 0, "record deleted");
        Ok(n > 0)
    }

    fn delete_by_filter(&self, filter: &RecordFilter) -> KdashResult<usize> {
        filter.ensure_not_empty()?;
        let mut clauses = Vec::new();
        let mut args: Vec<&str> = Vec::new();
        for (column, value) in [
            ("cluster_id", filter.cluster_id.as_deref()),
            ("kind", filter.kind.as_deref()),
            ("namespace", filter.namespace.as_deref()),
        ] {
            if let Some(v) = value {
                args.push(v);
                clauses.push(format!("{} = ?{}", column, args.len()));
            }
        }
        let sql = format!("DELETE FROM resources WHERE {}", clauses.join(" AND "));
        let n = self.conn()?.execute(&sql, params_from_iter(args)).map_err(store_err)?;
        info!(?filter, removed = n, "records purged");
        Ok(n)
    }

    fn close(&self) -> KdashResult<()> {
        self.conn()?.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").map_err(store_err)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".kdash");
        let _ = std::fs::create_dir_all(&p);
        p.push("kdash.db");
        return p.to_string_lossy().to_string();
    }
    "kdash.db".to_string()
}
