//! The reference `Cache` implementation: a Redis-backed blob store with
//! per-parent-key listing, grounded on the connection-manager idiom used
//! throughout the teacher's repository layer.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::Cache;
use crate::errors::{DbError, DbResult};

/// Wraps a single shared `ConnectionManager`; Redis's connection manager
/// already reconnects transparently, so no pool is needed here.
pub struct RedisCache {
    conn: Mutex<ConnectionManager>,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn: Mutex::new(conn) }
    }
}

#[async_trait]
impl Cache for RedisCache {
    /// Prefers `hashKey` when present (a selects-scoped projection of the
    /// same document), falling back to the full document blob under `key`.
    async fn load(&self, key: &str, ttl_seconds: u64, hash_key: Option<&str>) -> DbResult<Option<Value>> {
        let mut conn = self.conn.lock().await;
        let lookup_key = hash_key.unwrap_or(key);
        let raw: Option<String> = cmd("GET")
            .arg(lookup_key)
            .query_async(&mut *conn)
            .await
            .map_err(|err| DbError::database(format!("cache load failed: {err}")))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let _: Result<(), redis::RedisError> = cmd("EXPIRE").arg(lookup_key).arg(ttl_seconds).query_async(&mut *conn).await;
        serde_json::from_str(&raw).map(Some).map_err(|err| DbError::database(format!("corrupt cache entry: {err}")))
    }

    /// Writes the blob under `key`, then registers `key` as a member of
    /// `parentKey`'s listing set so `list(parentKey)` can enumerate it for
    /// bulk purge (§4.4 "empty marker").
    async fn save(&self, key: &str, value: Value, parent_key: Option<&str>) -> DbResult<bool> {
        let mut conn = self.conn.lock().await;
        let raw = serde_json::to_string(&value).map_err(|err| DbError::database(format!("cache encode failed: {err}")))?;
        let () = conn.set(key, raw).await.map_err(|err| DbError::database(format!("cache save failed: {err}")))?;
        if let Some(parent) = parent_key {
            let _: () = conn.sadd(parent, key).await.map_err(|err| DbError::database(format!("cache link failed: {err}")))?;
        }
        Ok(true)
    }

    async fn list(&self, parent_key: &str) -> DbResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        conn.smembers(parent_key).await.map_err(|err| DbError::database(format!("cache list failed: {err}")))
    }

    /// Tolerant of a missing key, per the Cache contract's idempotence
    /// requirement.
    async fn purge(&self, key: &str, parent_key: Option<&str>) -> DbResult<bool> {
        let mut conn = self.conn.lock().await;
        let _: () = conn.del(key).await.map_err(|err| DbError::database(format!("cache purge failed: {err}")))?;
        if let Some(parent) = parent_key {
            let _: () = conn.srem(parent, key).await.map_err(|err| DbError::database(format!("cache unlink failed: {err}")))?;
        }
        Ok(true)
    }

    async fn flush(&self) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        cmd("FLUSHDB").query_async(&mut *conn).await.map_err(|err| DbError::database(format!("cache flush failed: {err}")))
    }
}
