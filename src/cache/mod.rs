//! Cache key derivation and the `Cache` contract (§4.4 "Cache coherence").

pub mod redis;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::DbResult;

pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 86_400;

/// `load(key, ttl, hashKey?) → blob | null; save(key, value, parentKey?) →
/// bool; list(parentKey) → key[]; purge(key, parentKey?) → bool; flush()`
/// (§6 "Cache contract"). Implementations must be idempotent: `save`
/// replaces, `purge` tolerates a missing key.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn load(&self, key: &str, ttl_seconds: u64, hash_key: Option<&str>) -> DbResult<Option<Value>>;
    async fn save(&self, key: &str, value: Value, parent_key: Option<&str>) -> DbResult<bool>;
    async fn list(&self, parent_key: &str) -> DbResult<Vec<String>>;
    async fn purge(&self, key: &str, parent_key: Option<&str>) -> DbResult<bool>;
    async fn flush(&self) -> DbResult<()>;
}

/// Key-construction context: `<cacheName>-cache-<host?>:<prefix>:<tenant|
/// null>:collection:<collectionId>` and beyond, per §4.4. Adapted from the
/// `prefix:service:...` scheme of a Redis-key-builder struct, generalized
/// with tenant scoping and a "global collection" escape hatch.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    pub cache_name: String,
    pub host: Option<String>,
    pub prefix: String,
}

impl CacheKeys {
    pub fn new(cache_name: impl Into<String>, host: Option<String>, prefix: impl Into<String>) -> Self {
        Self { cache_name: cache_name.into(), host, prefix: prefix.into() }
    }

    fn namespace(&self) -> String {
        match &self.host {
            Some(host) => format!("{}-cache-{}", self.cache_name, host),
            None => format!("{}-cache", self.cache_name),
        }
    }

    /// `tenant=None` renders as the literal `null` segment — used for
    /// collections flagged as global (§4.4 "Global collections").
    pub fn collection_key(&self, tenant: Option<i64>, collection_id: &str, is_global: bool) -> String {
        let tenant_segment = if is_global {
            "null".to_string()
        } else {
            tenant.map(|t| t.to_string()).unwrap_or_else(|| "null".to_string())
        };
        format!("{}:{}:{}:collection:{}", self.namespace(), self.prefix, tenant_segment, collection_id)
    }

    pub fn document_key(&self, tenant: Option<i64>, collection_id: &str, document_id: &str, is_global: bool) -> String {
        format!("{}:{}", self.collection_key(tenant, collection_id, is_global), document_id)
    }

    /// `hashKey = documentKey + ":" + md5(join(selects))`, used only when
    /// the read specified `selects` (§4.4).
    pub fn hash_key(document_key: &str, selects: &[String]) -> String {
        let joined = selects.join(",");
        let digest = md5::compute(joined.as_bytes());
        format!("{document_key}:{digest:x}")
    }

    /// `map:<collectionId>:<id>` — reverse-edge references captured during
    /// relationship population, purged alongside the document (§4.4 "Purge
    /// rules").
    pub fn related_docs_map_key(collection_id: &str, document_id: &str) -> String {
        format!("map:{collection_id}:{document_id}")
    }
}
