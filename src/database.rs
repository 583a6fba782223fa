//! The top-level façade: wires the metadata catalog, schema managers,
//! relationship resolver, cache, and event bus together behind a single
//! `Adapter` (§4 "Component design", §5 "Concurrency & resource model").
//!
//! `Database` owns no documents — everything it touches is a value passed
//! through the adapter and cache by reference or by clone. The only
//! persistent in-process state is the metadata catalog mirror (`collections`,
//! kept in sync with the `_metadata` collection so lookups don't round-trip
//! through the adapter on every call) and the scoped skip/silence/fence
//! flags described in §4.5/§4.6/§5.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::adapter::Adapter;
use crate::cache::{Cache, CacheKeys, DEFAULT_CACHE_TTL_SECONDS};
use crate::document::Document;
use crate::engine::document::{apply_nested_selections, merge_patch, related_ids, should_update};
use crate::engine::encode::{cast_document, decode_document, encode_document};
use crate::errors::{DbError, DbResult};
use crate::events::{names, BatchEventPayload, EventBus, SilentGuard};
use crate::filters::{Filter, FilterRegistry};
use crate::id::generate_document_id;
use crate::metadata::{collection_to_document, Collection, METADATA_COLLECTION_ID};
use crate::permission::{authorize_unless_skipped, Action, SkipGuard};
use crate::query::{Query, QueryPlan};
use crate::relationship::manager as relationship_manager;
use crate::relationship::resolver::{self, RelationStacks, RelationshipHost};
use crate::schema::attribute_manager;
use crate::schema::index_manager;
use crate::schema::validator::{validate_document, validate_partial_document};
use crate::schema::{Attribute, AttributeType, Index, OnDelete, RelationOptions, RelationSide, RelationType};
use crate::transaction::{check_conflict, with_transaction, RequestTimestampGuard};

/// The engine instance. Cheap to hold behind an `Arc` and share across
/// concurrent callers — internal mutable state is limited to mutexed maps
/// and the scoped skip/timestamp flags.
pub struct Database {
    adapter: Arc<dyn Adapter>,
    cache: Arc<dyn Cache>,
    filters: FilterRegistry,
    events: EventBus,
    collections: Mutex<HashMap<String, Collection>>,
    global_collections: Mutex<HashSet<String>>,
    cache_name: String,
    host: Option<String>,
    skip_auth: AtomicBool,
    request_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl Database {
    pub fn new(adapter: Arc<dyn Adapter>, cache: Arc<dyn Cache>, cache_name: impl Into<String>) -> Self {
        let mut collections = HashMap::new();
        let metadata = Collection::bootstrap_metadata_descriptor();
        collections.insert(metadata.id.clone(), metadata);
        Self {
            adapter,
            cache,
            filters: FilterRegistry::new(),
            events: EventBus::new(),
            collections: Mutex::new(collections),
            global_collections: Mutex::new(HashSet::new()),
            cache_name: cache_name.into(),
            host: None,
            skip_auth: AtomicBool::new(false),
            request_timestamp: Mutex::new(None),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Registers a per-instance filter that shadows the global registry
    /// entry of the same name (§9 "Filter registry").
    pub fn register_filter(mut self, name: impl Into<String>, filter: Filter) -> Self {
        self.filters.register(name, filter);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Bootstraps the adapter connection and the `_metadata` backing table.
    pub async fn init(&self) -> DbResult<()> {
        self.adapter.init().await?;
        let metadata = Collection::bootstrap_metadata_descriptor();
        self.adapter.create_collection(&metadata.id, &metadata.attributes, &metadata.indexes).await?;
        Ok(())
    }

    /// Flags `collection_id` as global: its cache keys render `tenant=null`
    /// regardless of the ambient tenant (§4.4 "Global collections").
    pub fn register_global_collection(&self, collection_id: impl Into<String>) {
        self.global_collections.lock().expect("global collections mutex poisoned").insert(collection_id.into());
    }

    fn is_global(&self, collection_id: &str) -> bool {
        self.global_collections.lock().expect("global collections mutex poisoned").contains(collection_id)
    }

    /// Bypasses authorization for the duration of `f` (§4.5 "skip"). Used
    /// internally by relationship traversal; exposed for host applications
    /// doing their own internal loads (e.g. cache warm-up).
    pub async fn skip<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = SkipGuard::new(&self.skip_auth);
        f().await
    }

    /// Scopes the optimistic-concurrency fence used by `update`/`delete`
    /// conflict checks (§5 "Cancellation & timeouts").
    pub async fn with_request_timestamp<F, Fut, T>(&self, timestamp: Option<DateTime<Utc>>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = RequestTimestampGuard::new(&self.request_timestamp, timestamp);
        f().await
    }

    /// Scopes event suppression (§4.6). `None` suppresses everything,
    /// `Some(&[])` suppresses nothing, `Some(names)` suppresses exactly those.
    pub fn silence(&self, names: Option<&[&str]>) -> SilentGuard<'_> {
        self.events.silence(names)
    }

    fn request_timestamp(&self) -> Option<DateTime<Utc>> {
        *self.request_timestamp.lock().expect("request timestamp mutex poisoned")
    }

    fn cache_keys(&self) -> CacheKeys {
        CacheKeys::new(self.cache_name.clone(), self.host.clone(), self.adapter.prefix())
    }

    // ---- Database (top-level schema) lifecycle -------------------------

    pub async fn create_database(&self, name: &str) -> DbResult<()> {
        self.adapter.create(name).await?;
        self.events.emit(names::DATABASE_CREATE, serde_json::json!({ "name": name }));
        Ok(())
    }

    /// Drops the underlying schema and flushes the cache wholesale — the one
    /// place a full `cache.flush()` is correct rather than a scoped purge
    /// (§4.4 "On deleteDatabase: flush").
    pub async fn delete_database(&self, name: &str) -> DbResult<()> {
        self.adapter.drop(name).await?;
        self.cache.flush().await?;
        self.events.emit(names::DATABASE_DELETE, serde_json::json!({ "name": name }));
        Ok(())
    }

    // ---- Collection management -------------------------------------------

    pub fn get_collection(&self, collection_id: &str) -> DbResult<Collection> {
        let collection = self
            .collections
            .lock()
            .expect("collections mutex poisoned")
            .get(collection_id)
            .cloned()
            .ok_or_else(|| DbError::not_found(format!("collection `{collection_id}`")))?;
        self.events.emit(names::COLLECTION_READ, collection_event_payload(&collection));
        Ok(collection)
    }

    pub fn list_collections(&self) -> Vec<Collection> {
        let collections: Vec<Collection> = self.collections.lock().expect("collections mutex poisoned").values().cloned().collect();
        self.events.emit(names::COLLECTION_LIST, serde_json::json!({ "count": collections.len() }));
        collections
    }

    #[instrument(skip(self, attributes, indexes, permissions), fields(collection_id = %collection_id))]
    pub async fn create_collection(
        &self,
        collection_id: &str,
        name: &str,
        attributes: Vec<Attribute>,
        indexes: Vec<Index>,
        document_security: bool,
        permissions: Vec<String>,
    ) -> DbResult<Collection> {
        if self.collections.lock().expect("collections mutex poisoned").contains_key(collection_id) {
            return Err(DbError::duplicate(format!("collection `{collection_id}`")));
        }
        let mut collection = Collection::new(collection_id, name);
        collection.attributes = attributes;
        collection.indexes = indexes;
        collection.document_security = document_security;
        collection.permissions = permissions;

        self.adapter.create_collection(collection_id, &collection.attributes, &collection.indexes).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection.clone());
        self.events.emit(names::COLLECTION_CREATE, collection_event_payload(&collection));
        debug!("collection created");
        Ok(collection)
    }

    /// Cascades: drops every relationship (and its junction collection),
    /// drops the backing table, removes the metadata doc, purges the cache
    /// (§3 "Lifecycles").
    #[instrument(skip(self), fields(collection_id = %collection_id))]
    pub async fn delete_collection(&self, collection_id: &str) -> DbResult<()> {
        let collection = self.get_collection(collection_id)?;
        let relationship_keys: Vec<String> = collection.relationship_attributes().map(|a| a.key.clone()).collect();
        for key in relationship_keys {
            self.delete_relationship(collection_id, &key).await?;
        }

        self.adapter.drop_collection(collection_id).await?;
        self.collections.lock().expect("collections mutex poisoned").remove(collection_id);
        match self.adapter.delete_document(METADATA_COLLECTION_ID, collection_id).await {
            Ok(_) | Err(DbError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::COLLECTION_DELETE, serde_json::json!({ "$id": collection_id }));
        Ok(())
    }

    async fn persist_metadata(&self, collection: &Collection) -> DbResult<()> {
        let doc = collection_to_document(collection);
        match self.adapter.update_document(METADATA_COLLECTION_ID, doc.clone()).await {
            Ok(_) => Ok(()),
            Err(DbError::NotFound { .. }) => {
                self.adapter.create_document(METADATA_COLLECTION_ID, doc).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // ---- Attribute management ---------------------------------------------

    pub async fn create_attribute(&self, collection_id: &str, attribute: Attribute) -> DbResult<Attribute> {
        let mut collection = self.get_collection(collection_id)?;
        let created = attribute_manager::create_attribute(self.adapter.as_ref(), &mut collection, attribute).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection);
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::ATTRIBUTE_CREATE, serde_json::json!({ "collection": collection_id, "key": created.key }));
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_attribute(
        &self,
        collection_id: &str,
        key: &str,
        new_key: Option<String>,
        attribute_type: Option<AttributeType>,
        required: Option<bool>,
        default: Option<Option<Value>>,
        size: Option<u32>,
        signed: Option<bool>,
        array: Option<bool>,
        format: Option<Option<String>>,
    ) -> DbResult<Attribute> {
        let mut collection = self.get_collection(collection_id)?;
        let updated = attribute_manager::update_attribute(self.adapter.as_ref(), &mut collection, key, new_key, attribute_type, required, default, size, signed, array, format).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection);
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::ATTRIBUTE_UPDATE, serde_json::json!({ "collection": collection_id, "key": updated.key }));
        Ok(updated)
    }

    pub async fn rename_attribute(&self, collection_id: &str, old_key: &str, new_key: &str) -> DbResult<()> {
        let mut collection = self.get_collection(collection_id)?;
        attribute_manager::rename_attribute(self.adapter.as_ref(), &mut collection, old_key, new_key).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection);
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::ATTRIBUTE_UPDATE, serde_json::json!({ "collection": collection_id, "key": new_key }));
        Ok(())
    }

    pub async fn delete_attribute(&self, collection_id: &str, key: &str) -> DbResult<()> {
        let mut collection = self.get_collection(collection_id)?;
        attribute_manager::delete_attribute(self.adapter.as_ref(), &mut collection, key).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection);
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::ATTRIBUTE_DELETE, serde_json::json!({ "collection": collection_id, "key": key }));
        Ok(())
    }

    // ---- Index management --------------------------------------------------

    pub async fn create_index(&self, collection_id: &str, index: Index) -> DbResult<Index> {
        let mut collection = self.get_collection(collection_id)?;
        let created = index_manager::create_index(self.adapter.as_ref(), &mut collection, index).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection);
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::INDEX_CREATE, serde_json::json!({ "collection": collection_id, "key": created.id }));
        Ok(created)
    }

    pub async fn rename_index(&self, collection_id: &str, old_key: &str, new_key: &str) -> DbResult<()> {
        let mut collection = self.get_collection(collection_id)?;
        index_manager::rename_index(self.adapter.as_ref(), &mut collection, old_key, new_key).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection);
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::INDEX_RENAME, serde_json::json!({ "collection": collection_id, "key": new_key }));
        Ok(())
    }

    pub async fn delete_index(&self, collection_id: &str, id: &str) -> DbResult<()> {
        let mut collection = self.get_collection(collection_id)?;
        index_manager::delete_index(self.adapter.as_ref(), &mut collection, id).await?;
        self.persist_metadata(&collection).await?;
        self.collections.lock().expect("collections mutex poisoned").insert(collection_id.to_string(), collection);
        self.purge_collection_cache(collection_id).await;
        self.events.emit(names::INDEX_DELETE, serde_json::json!({ "collection": collection_id, "key": id }));
        Ok(())
    }

    // ---- Relationship management --------------------------------------------
    //
    // Reflexive relationships (`parent == child`) are supported: `parent`
    // and `child` start as independent clones of the same stored collection,
    // so `relationship::manager` folds every mutation onto `parent` and
    // mirrors it onto `child` before returning, rather than risking one
    // clone's writes silently overwriting the other's when both get inserted
    // back into the collection map (§9 "Reflexive relationships").

    #[allow(clippy::too_many_arguments)]
    pub async fn create_relationship(
        &self,
        parent_collection_id: &str,
        child_collection_id: &str,
        key: Option<String>,
        two_way: bool,
        two_way_key: Option<String>,
        relation_type: RelationType,
        on_delete: OnDelete,
    ) -> DbResult<Attribute> {
        let mut parent = self.get_collection(parent_collection_id)?;
        let mut child = self.get_collection(child_collection_id)?;
        let (parent_attr, _child_attr, junction) =
            relationship_manager::create_relationship(self.adapter.as_ref(), &mut parent, &mut child, key, two_way, two_way_key, relation_type, on_delete).await?;

        if let Some(junction) = junction {
            self.collections.lock().expect("collections mutex poisoned").insert(junction.id.clone(), junction.clone());
            self.persist_metadata(&junction).await?;
        }
        self.persist_metadata(&parent).await?;
        self.persist_metadata(&child).await?;
        {
            let mut collections = self.collections.lock().expect("collections mutex poisoned");
            collections.insert(parent.id.clone(), parent.clone());
            collections.insert(child.id.clone(), child.clone());
        }
        self.purge_collection_cache(parent_collection_id).await;
        self.purge_collection_cache(child_collection_id).await;
        self.events.emit(names::ATTRIBUTE_CREATE, serde_json::json!({ "collection": parent_collection_id, "key": parent_attr.key }));
        Ok(parent_attr)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_relationship(
        &self,
        collection_id: &str,
        current_key: &str,
        new_key: Option<String>,
        new_two_way_key: Option<String>,
        new_two_way: Option<bool>,
        new_on_delete: Option<OnDelete>,
    ) -> DbResult<()> {
        let mut parent = self.get_collection(collection_id)?;
        let related_collection_id = parent
            .find_attribute(current_key)
            .and_then(|a| a.relation.as_ref())
            .map(|r| r.related_collection.clone())
            .ok_or_else(|| DbError::not_found(format!("relationship `{current_key}`")))?;
        let mut child = self.get_collection(&related_collection_id)?;
        relationship_manager::update_relationship(self.adapter.as_ref(), &mut parent, &mut child, current_key, new_key, new_two_way_key, new_two_way, new_on_delete).await?;
        self.persist_metadata(&parent).await?;
        self.persist_metadata(&child).await?;
        {
            let mut collections = self.collections.lock().expect("collections mutex poisoned");
            collections.insert(parent.id.clone(), parent.clone());
            collections.insert(child.id.clone(), child.clone());
        }
        self.purge_collection_cache(collection_id).await;
        self.purge_collection_cache(&related_collection_id).await;
        self.events.emit(names::ATTRIBUTE_UPDATE, serde_json::json!({ "collection": collection_id, "key": current_key }));
        Ok(())
    }

    pub async fn delete_relationship(&self, collection_id: &str, key: &str) -> DbResult<()> {
        let mut parent = self.get_collection(collection_id)?;
        let relation = parent
            .find_attribute(key)
            .and_then(|a| a.relation.clone())
            .ok_or_else(|| DbError::not_found(format!("relationship `{key}`")))?;
        let related_collection_id = relation.related_collection.clone();
        let mut child = self.get_collection(&related_collection_id)?;

        let junction_id = relationship_manager::delete_relationship(self.adapter.as_ref(), &mut parent, &mut child, key).await?;
        if let Some(junction_id) = junction_id {
            self.adapter.drop_collection(&junction_id).await?;
            self.collections.lock().expect("collections mutex poisoned").remove(&junction_id);
            let _ = self.adapter.delete_document(METADATA_COLLECTION_ID, &junction_id).await;
        }

        self.persist_metadata(&parent).await?;
        self.persist_metadata(&child).await?;
        {
            let mut collections = self.collections.lock().expect("collections mutex poisoned");
            collections.insert(parent.id.clone(), parent.clone());
            collections.insert(child.id.clone(), child.clone());
        }
        self.purge_collection_cache(collection_id).await;
        self.purge_collection_cache(&related_collection_id).await;
        self.events.emit(names::ATTRIBUTE_DELETE, serde_json::json!({ "collection": collection_id, "key": key }));
        Ok(())
    }

    async fn junction_id_for(&self, collection: &Collection, relation: &RelationOptions) -> DbResult<String> {
        let related = self.get_collection(&relation.related_collection)?;
        Ok(match relation.side {
            RelationSide::Parent => relationship_manager::junction_collection_id(collection, &related),
            RelationSide::Child => relationship_manager::junction_collection_id(&related, collection),
        })
    }

    /// Pre-checks a `oneToOne` relationship's related doc for an existing,
    /// different owner before a write would otherwise violate the
    /// uniqueness invariant (§8 scenario 5).
    async fn enforce_one_to_one_uniqueness(&self, collection: &Collection, doc: &Document) -> DbResult<()> {
        for attribute in collection.relationship_attributes() {
            let Some(relation) = &attribute.relation else { continue };
            if relation.relation_type != RelationType::OneToOne {
                continue;
            }
            let Some(related_id) = doc.relation_id_at(&attribute.key) else { continue };
            let related = self.adapter.get_document(&relation.related_collection, &related_id).await?;
            if related.is_empty() {
                continue;
            }
            if let Some(existing_owner) = related.relation_id_at(&relation.two_way_key) {
                if Some(existing_owner.as_str()) != doc.id() {
                    return Err(DbError::duplicate(format!("relationship `{}` already claims `{related_id}`", attribute.key)));
                }
            }
        }
        Ok(())
    }

    // ---- Cache coherence -------------------------------------------------

    async fn purge_document_cache(&self, collection_id: &str, document_id: &str) {
        let tenant = self.adapter.tenant_id();
        let is_global = self.is_global(collection_id);
        let keys = self.cache_keys();
        let collection_key = keys.collection_key(tenant, collection_id, is_global);
        let document_key = keys.document_key(tenant, collection_id, document_id, is_global);

        if let Err(err) = self.cache.purge(&document_key, Some(&collection_key)).await {
            warn!(%err, "cache purge failed");
        }

        let related_map_key = CacheKeys::related_docs_map_key(collection_id, document_id);
        if let Ok(related) = self.cache.list(&related_map_key).await {
            for related_key in related {
                let _ = self.cache.purge(&related_key, None).await;
            }
        }
        let _ = self.cache.purge(&related_map_key, None).await;
    }

    async fn purge_collection_cache(&self, collection_id: &str) {
        let tenant = self.adapter.tenant_id();
        let is_global = self.is_global(collection_id);
        let collection_key = self.cache_keys().collection_key(tenant, collection_id, is_global);
        if let Ok(keys) = self.cache.list(&collection_key).await {
            for key in keys {
                let _ = self.cache.purge(&key, Some(&collection_key)).await;
            }
        }
        let _ = self.cache.purge(&collection_key, None).await;
    }

    // ---- Document lifecycle ----------------------------------------------

    async fn create_document_core(&self, collection: &Collection, mut doc: Document, caller_roles: &[String], preserve_dates: bool) -> DbResult<Document> {
        authorize_unless_skipped(&self.skip_auth, &collection.permissions, None, false, caller_roles, Action::Create)?;
        validate_document(&collection.attributes, &doc)?;

        if doc.id().is_none() {
            doc.set_id(generate_document_id());
        }
        doc.set_collection(collection.id.clone());
        let now = Utc::now();
        if !(preserve_dates && doc.created_at().is_some()) {
            doc.set_created_at(now);
        }
        if !(preserve_dates && doc.updated_at().is_some()) {
            doc.set_updated_at(now);
        }
        if self.adapter.shared_tables() {
            doc.set_tenant(self.adapter.tenant_id());
        }

        self.enforce_one_to_one_uniqueness(collection, &doc).await?;
        {
            let _guard = SkipGuard::new(&self.skip_auth);
            let mut stacks = RelationStacks::new();
            resolver::create_relations(self, collection, &mut doc, &mut stacks).await?;
        }
        finalize_relationship_columns(collection, &mut doc);

        let encoded = encode_document(&collection.attributes, &self.filters, &doc)?;
        let stored = self.adapter.create_document(&collection.id, encoded).await?;

        let mut result = stored;
        {
            let _guard = SkipGuard::new(&self.skip_auth);
            let mut stacks = RelationStacks::new();
            resolver::populate(self, collection, &mut result, &mut stacks).await?;
        }
        let result = cast_document(&collection.attributes, self.adapter.as_ref(), result);
        let result = decode_document(&collection.attributes, &self.filters, result, &QueryPlan::default())?;
        Ok(result)
    }

    #[instrument(skip(self, doc, caller_roles), fields(collection_id = %collection_id))]
    pub async fn create_document(&self, collection_id: &str, doc: Document, caller_roles: &[String], preserve_dates: bool) -> DbResult<Document> {
        let collection = self.get_collection(collection_id)?;
        let result = with_transaction(self.adapter.as_ref(), self.create_document_core(&collection, doc, caller_roles, preserve_dates)).await?;
        debug!(document_id = ?result.id(), "document created");
        self.events.emit(names::DOCUMENT_CREATE, document_event_payload(&result));
        Ok(result)
    }

    #[instrument(skip(self, docs, caller_roles), fields(collection_id = %collection_id))]
    pub async fn create_documents(&self, collection_id: &str, docs: Vec<Document>, caller_roles: &[String], preserve_dates: bool) -> DbResult<Vec<Document>> {
        let collection = self.get_collection(collection_id)?;
        let count = docs.len();
        let results = with_transaction(self.adapter.as_ref(), async {
            let mut created = Vec::with_capacity(docs.len());
            for doc in docs {
                created.push(self.create_document_core(&collection, doc, caller_roles, preserve_dates).await?);
            }
            Ok(created)
        })
        .await?;
        self.events
            .emit(names::DOCUMENTS_CREATE, batch_event_value(BatchEventPayload { modified: count, collection_id: collection_id.to_string() }));
        Ok(results)
    }

    #[instrument(skip(self, queries, caller_roles), fields(collection_id = %collection_id, document_id = %id))]
    pub async fn get_document(&self, collection_id: &str, id: &str, queries: &[Query], caller_roles: &[String]) -> DbResult<Document> {
        let Ok(collection) = self.get_collection(collection_id) else {
            return Ok(Document::new());
        };
        let plan = QueryPlan::build(queries);
        let tenant = self.adapter.tenant_id();
        let is_global = self.is_global(collection_id);
        let keys = self.cache_keys();
        let collection_key = keys.collection_key(tenant, collection_id, is_global);
        let document_key = keys.document_key(tenant, collection_id, id, is_global);
        let select_names: Vec<String> = plan.selections.iter().map(|s| s.0.clone()).collect();
        let hash_key = if select_names.is_empty() { None } else { Some(CacheKeys::hash_key(&document_key, &select_names)) };

        match self.cache.load(&document_key, DEFAULT_CACHE_TTL_SECONDS, hash_key.as_deref()).await {
            Ok(Some(cached)) => {
                debug!("cache hit");
                if let Ok(doc) = document_from_cache_value(cached) {
                    return Ok(doc);
                }
            }
            Ok(None) => debug!("cache miss"),
            Err(err) => warn!(%err, "cache load failed, treating as miss"),
        }

        let doc = self.adapter.get_document(collection_id, id).await?;
        if doc.is_empty() {
            return Ok(doc);
        }
        let document_permissions: Vec<String> = doc.permissions().iter().cloned().collect();
        if authorize_unless_skipped(&self.skip_auth, &collection.permissions, Some(&document_permissions), collection.document_security, caller_roles, Action::Read).is_err() {
            return Ok(Document::new());
        }

        let cast = cast_document(&collection.attributes, self.adapter.as_ref(), doc);
        let decoded = decode_document(&collection.attributes, &self.filters, cast, &plan)?;

        let has_relationships = collection.relationship_attributes().next().is_some();
        if !has_relationships {
            let content_key = hash_key.as_deref().unwrap_or(&document_key);
            if let Err(err) = self.cache.save(content_key, document_to_cache_value(&decoded), Some(&collection_key)).await {
                warn!(%err, "cache save failed");
            }
        }

        let mut result = decoded;
        {
            let _guard = SkipGuard::new(&self.skip_auth);
            let mut stacks = RelationStacks::new();
            resolver::populate(self, &collection, &mut result, &mut stacks).await?;
        }
        apply_nested_selections(&collection, &plan, &mut result);
        self.events.emit(names::DOCUMENT_READ, document_event_payload(&result));
        Ok(result)
    }

    async fn update_document_core(&self, collection: &Collection, old: Document, partial: Document, caller_roles: &[String], preserve_dates: bool) -> DbResult<Document> {
        validate_partial_document(&collection.attributes, &partial)?;
        let has_changes = should_update(collection, &old, &partial);
        let action = if has_changes { Action::Update } else { Action::Read };
        let document_permissions: Vec<String> = old.permissions().iter().cloned().collect();
        authorize_unless_skipped(&self.skip_auth, &collection.permissions, Some(&document_permissions), collection.document_security, caller_roles, action)?;
        check_conflict(self.request_timestamp(), old.updated_at())?;

        let mut merged = merge_patch(&old, &partial);
        merged.set_id(old.id().unwrap_or_default().to_string());
        merged.set_collection(collection.id.clone());
        if let Some(created_at) = old.created_at() {
            merged.set_created_at(created_at);
        }
        merged.set_tenant(old.tenant());
        if has_changes || !preserve_dates {
            merged.set_updated_at(Utc::now());
        } else if let Some(updated_at) = old.updated_at() {
            merged.set_updated_at(updated_at);
        }

        self.enforce_one_to_one_uniqueness(collection, &merged).await?;
        {
            let _guard = SkipGuard::new(&self.skip_auth);
            self.apply_relationship_diff(collection, &old, &partial).await?;
        }
        finalize_relationship_columns(collection, &mut merged);

        let encoded = encode_document(&collection.attributes, &self.filters, &merged)?;
        let stored = self.adapter.update_document(&collection.id, encoded).await?;

        let mut result = stored;
        {
            let _guard = SkipGuard::new(&self.skip_auth);
            let mut stacks = RelationStacks::new();
            resolver::populate(self, collection, &mut result, &mut stacks).await?;
        }
        let result = cast_document(&collection.attributes, self.adapter.as_ref(), result);
        let result = decode_document(&collection.attributes, &self.filters, result, &QueryPlan::default())?;
        self.purge_document_cache(&collection.id, result.id().unwrap_or_default()).await;
        Ok(result)
    }

    /// Diffs `partial`'s relationship attributes against `old`'s related-id
    /// sets and applies the difference: removed ids are unlinked (or their
    /// junction row dropped), added ids/sub-docs are upserted via the
    /// resolver's own `create_relations` rather than duplicating its private
    /// write path (§4.3 "Update relations"). Sub-documents whose `$id`
    /// already belongs to the related set are re-linked but not deep-diffed
    /// for other changed fields — see `DESIGN.md`.
    async fn apply_relationship_diff(&self, collection: &Collection, old: &Document, partial: &Document) -> DbResult<()> {
        for attribute in collection.relationship_attributes() {
            let Some(relation) = &attribute.relation else { continue };
            let Some(new_raw) = partial.get(&attribute.key).cloned() else { continue };

            let old_ids: HashSet<String> = old.get(&attribute.key).map(related_ids).unwrap_or_default().into_iter().collect();
            let new_ids: HashSet<String> = related_ids(&new_raw).into_iter().collect();
            let removed: Vec<String> = old_ids.difference(&new_ids).cloned().collect();
            let self_id = old.id().unwrap_or_default().to_string();

            for related_id in removed {
                if relation.relation_type == RelationType::ManyToMany {
                    let junction_id = self.junction_id_for(collection, relation).await?;
                    let plan = QueryPlan::build(&[Query::equal("key", Value::String(related_id.clone())), Query::equal("twoWayKey", Value::String(self_id.clone()))]);
                    for row in self.adapter.find(&junction_id, &plan).await? {
                        if let Some(row_id) = row.id() {
                            self.adapter.delete_document(&junction_id, row_id).await?;
                        }
                    }
                } else {
                    let mut patch = Document::new();
                    patch.set_id(related_id);
                    patch.set(relation.two_way_key.clone(), Value::Null);
                    RelationshipHost::update_document(self, &relation.related_collection, patch).await?;
                }
            }

            let mut temp = Document::new();
            temp.set_id(self_id);
            temp.set(attribute.key.clone(), new_raw);
            let mut stacks = RelationStacks::new();
            resolver::create_relations(self, collection, &mut temp, &mut stacks).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, partial, caller_roles), fields(collection_id = %collection_id, document_id = %id))]
    pub async fn update_document(&self, collection_id: &str, id: &str, partial: Document, caller_roles: &[String], preserve_dates: bool) -> DbResult<Document> {
        let collection = self.get_collection(collection_id)?;
        let old = self.adapter.get_document(collection_id, id).await?;
        if old.is_empty() {
            return Err(DbError::not_found(format!("document `{id}`")));
        }
        let result = with_transaction(self.adapter.as_ref(), self.update_document_core(&collection, old, partial, caller_roles, preserve_dates)).await?;
        self.events.emit(names::DOCUMENT_UPDATE, document_event_payload(&result));
        Ok(result)
    }

    #[instrument(skip(self, changes, queries, caller_roles), fields(collection_id = %collection_id))]
    pub async fn update_documents(&self, collection_id: &str, changes: Document, queries: &[Query], caller_roles: &[String], batch_size: u32) -> DbResult<u64> {
        let collection = self.get_collection(collection_id)?;
        validate_partial_document(&collection.attributes, &changes)?;
        let mut modified = 0u64;
        let mut cursor: Option<String> = None;
        with_transaction(self.adapter.as_ref(), async {
            loop {
                let mut batch_queries = queries.to_vec();
                if let Some(after) = &cursor {
                    batch_queries.push(Query::CursorAfter { after: after.clone(), before: false });
                }
                batch_queries.push(Query::Limit(batch_size));
                let plan = QueryPlan::build(&batch_queries);
                let batch = self.adapter.find(collection_id, &plan).await?;
                if batch.is_empty() {
                    break;
                }
                let batch_len = batch.len();
                for doc in batch {
                    cursor = doc.internal_id().map(str::to_string).or(cursor);
                    self.update_document_core(&collection, doc, changes.clone(), caller_roles, false).await?;
                }
                modified += batch_len as u64;
                if (batch_len as u32) < batch_size {
                    break;
                }
            }
            Ok::<(), DbError>(())
        })
        .await?;
        self.events
            .emit(names::DOCUMENTS_UPDATE, batch_event_value(BatchEventPayload { modified: modified as usize, collection_id: collection_id.to_string() }));
        Ok(modified)
    }

    async fn delete_document_core(&self, collection: &Collection, doc: Document, caller_roles: &[String]) -> DbResult<()> {
        let document_permissions: Vec<String> = doc.permissions().iter().cloned().collect();
        authorize_unless_skipped(&self.skip_auth, &collection.permissions, Some(&document_permissions), collection.document_security, caller_roles, Action::Delete)?;
        {
            let _guard = SkipGuard::new(&self.skip_auth);
            let mut stacks = RelationStacks::new();
            resolver::delete_relations(self, collection, &doc, &mut stacks).await?;
        }
        self.adapter.delete_document(&collection.id, doc.id().unwrap_or_default()).await?;
        self.purge_document_cache(&collection.id, doc.id().unwrap_or_default()).await;
        Ok(())
    }

    #[instrument(skip(self, caller_roles), fields(collection_id = %collection_id, document_id = %id))]
    pub async fn delete_document(&self, collection_id: &str, id: &str, caller_roles: &[String]) -> DbResult<()> {
        let collection = self.get_collection(collection_id)?;
        let doc = self.adapter.get_document(collection_id, id).await?;
        if doc.is_empty() {
            return Ok(());
        }
        with_transaction(self.adapter.as_ref(), self.delete_document_core(&collection, doc, caller_roles)).await?;
        self.events.emit(names::DOCUMENT_DELETE, serde_json::json!({ "$id": id, "$collection": collection_id }));
        Ok(())
    }

    #[instrument(skip(self, queries, caller_roles), fields(collection_id = %collection_id))]
    pub async fn delete_documents(&self, collection_id: &str, queries: &[Query], caller_roles: &[String], batch_size: u32) -> DbResult<u64> {
        let collection = self.get_collection(collection_id)?;
        let mut deleted = 0u64;
        with_transaction(self.adapter.as_ref(), async {
            loop {
                let mut batch_queries = queries.to_vec();
                batch_queries.push(Query::Limit(batch_size));
                let plan = QueryPlan::build(&batch_queries);
                let batch = self.adapter.find(collection_id, &plan).await?;
                if batch.is_empty() {
                    break;
                }
                let batch_len = batch.len();
                for doc in batch {
                    self.delete_document_core(&collection, doc, caller_roles).await?;
                }
                deleted += batch_len as u64;
                if (batch_len as u32) < batch_size {
                    break;
                }
            }
            Ok::<(), DbError>(())
        })
        .await?;
        self.events
            .emit(names::DOCUMENTS_DELETE, batch_event_value(BatchEventPayload { modified: deleted as usize, collection_id: collection_id.to_string() }));
        Ok(deleted)
    }

    async fn adjust_document_attribute(
        &self,
        collection_id: &str,
        id: &str,
        attribute: &str,
        delta: f64,
        min: Option<f64>,
        max: Option<f64>,
        caller_roles: &[String],
        event_name: &'static str,
    ) -> DbResult<Document> {
        let collection = self.get_collection(collection_id)?;
        let attr = collection.find_attribute(attribute).ok_or_else(|| DbError::not_found(format!("attribute `{attribute}`")))?;
        if !matches!(attr.attribute_type, crate::schema::AttributeType::Integer | crate::schema::AttributeType::Float) {
            return Err(DbError::query(format!("attribute `{attribute}` is not numeric")));
        }
        let doc = self.adapter.get_document(collection_id, id).await?;
        if doc.is_empty() {
            return Err(DbError::not_found(format!("document `{id}`")));
        }
        let document_permissions: Vec<String> = doc.permissions().iter().cloned().collect();
        authorize_unless_skipped(&self.skip_auth, &collection.permissions, Some(&document_permissions), collection.document_security, caller_roles, Action::Update)?;
        check_conflict(self.request_timestamp(), doc.updated_at())?;

        self.adapter.increase_document_attribute(collection_id, id, attribute, delta, min, max).await?;
        self.purge_document_cache(collection_id, id).await;
        let updated = self.adapter.get_document(collection_id, id).await?;
        self.events.emit(event_name, document_event_payload(&updated));
        Ok(updated)
    }

    pub async fn increase_document_attribute(&self, collection_id: &str, id: &str, attribute: &str, value: f64, max: Option<f64>, caller_roles: &[String]) -> DbResult<Document> {
        self.adjust_document_attribute(collection_id, id, attribute, value, None, max, caller_roles, names::DOCUMENT_INCREASE).await
    }

    pub async fn decrease_document_attribute(&self, collection_id: &str, id: &str, attribute: &str, value: f64, min: Option<f64>, caller_roles: &[String]) -> DbResult<Document> {
        self.adjust_document_attribute(collection_id, id, attribute, -value, min, None, caller_roles, names::DOCUMENT_DECREASE).await
    }

    #[instrument(skip(self, queries, caller_roles), fields(collection_id = %collection_id))]
    pub async fn find(&self, collection_id: &str, queries: &[Query], caller_roles: &[String]) -> DbResult<Vec<Document>> {
        let collection = self.get_collection(collection_id)?;
        authorize_unless_skipped(&self.skip_auth, &collection.permissions, None, false, caller_roles, Action::Read)?;
        let plan = QueryPlan::build(queries);
        let rows = self.adapter.find(collection_id, &plan).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let cast = cast_document(&collection.attributes, self.adapter.as_ref(), row);
            let mut decoded = decode_document(&collection.attributes, &self.filters, cast, &plan)?;
            {
                let _guard = SkipGuard::new(&self.skip_auth);
                let mut stacks = RelationStacks::new();
                resolver::populate(self, &collection, &mut decoded, &mut stacks).await?;
            }
            apply_nested_selections(&collection, &plan, &mut decoded);
            results.push(decoded);
        }
        self.events.emit(names::DOCUMENT_FIND, serde_json::json!({ "collection": collection_id, "count": results.len() }));
        Ok(results)
    }

    pub async fn find_one(&self, collection_id: &str, queries: &[Query], caller_roles: &[String]) -> DbResult<Document> {
        let mut queries = queries.to_vec();
        queries.push(Query::Limit(1));
        Ok(self.find(collection_id, &queries, caller_roles).await?.into_iter().next().unwrap_or_default())
    }

    pub async fn count(&self, collection_id: &str, queries: &[Query], caller_roles: &[String]) -> DbResult<u64> {
        let collection = self.get_collection(collection_id)?;
        authorize_unless_skipped(&self.skip_auth, &collection.permissions, None, false, caller_roles, Action::Read)?;
        let plan = QueryPlan::build(queries);
        let count = self.adapter.count(collection_id, &plan).await?;
        self.events.emit(names::DOCUMENT_COUNT, serde_json::json!({ "collection": collection_id, "count": count }));
        Ok(count)
    }

    pub async fn sum(&self, collection_id: &str, queries: &[Query], attribute: &str, caller_roles: &[String]) -> DbResult<f64> {
        let collection = self.get_collection(collection_id)?;
        authorize_unless_skipped(&self.skip_auth, &collection.permissions, None, false, caller_roles, Action::Read)?;
        let plan = QueryPlan::build(queries);
        let total = self.adapter.sum(collection_id, &plan, attribute).await?;
        self.events.emit(names::DOCUMENT_SUM, serde_json::json!({ "collection": collection_id, "attribute": attribute, "sum": total }));
        Ok(total)
    }
}

/// Whether a relationship attribute's related id is physically stored as a
/// column on this side's own document, vs. purely derived by querying the
/// related collection (or junction) on read. Mirrors
/// `relationship::manager`'s index-placement matrix (§4.2 "createRelationship").
fn stores_direct_column(relation: &RelationOptions) -> bool {
    matches!(
        (relation.relation_type, relation.side),
        (RelationType::OneToOne, _) | (RelationType::OneToMany, RelationSide::Child) | (RelationType::ManyToOne, RelationSide::Parent)
    )
}

/// Collapses each relationship attribute's materialized value down to the
/// bare id column it actually persists, or drops it entirely when this side
/// carries no column at all, right before encoding (§4.1 "Encoding" treats
/// relationship attributes as opaque; this is the step that makes them so).
fn finalize_relationship_columns(collection: &Collection, doc: &mut Document) {
    for attribute in collection.relationship_attributes() {
        let Some(relation) = &attribute.relation else { continue };
        if stores_direct_column(relation) {
            if let Some(id) = doc.relation_id_at(&attribute.key) {
                doc.set(attribute.key.clone(), Value::String(id));
            }
        } else {
            doc.remove(&attribute.key);
        }
    }
}

fn collection_event_payload(collection: &Collection) -> Value {
    serde_json::json!({ "$id": collection.id, "name": collection.name })
}

fn document_event_payload(doc: &Document) -> Value {
    let mut obj = doc.attributes().clone();
    if let Some(id) = doc.id() {
        obj.insert("$id".to_string(), Value::String(id.to_string()));
    }
    if let Some(collection) = doc.collection() {
        obj.insert("$collection".to_string(), Value::String(collection.to_string()));
    }
    Value::Object(obj)
}

fn batch_event_value(payload: BatchEventPayload) -> Value {
    serde_json::json!({ "modified": payload.modified, "collectionId": payload.collection_id })
}

/// Packs a `Document` into a plain JSON blob for the cache, since `Document`
/// carries no `Serialize` derive (its system fields are private).
fn document_to_cache_value(doc: &Document) -> Value {
    let mut obj = doc.attributes().clone();
    if let Some(id) = doc.id() {
        obj.insert("$id".to_string(), Value::String(id.to_string()));
    }
    if let Some(internal_id) = doc.internal_id() {
        obj.insert("$internalId".to_string(), Value::String(internal_id.to_string()));
    }
    if let Some(collection) = doc.collection() {
        obj.insert("$collection".to_string(), Value::String(collection.to_string()));
    }
    if let Some(created_at) = doc.created_at() {
        obj.insert("$createdAt".to_string(), Value::String(created_at.to_rfc3339()));
    }
    if let Some(updated_at) = doc.updated_at() {
        obj.insert("$updatedAt".to_string(), Value::String(updated_at.to_rfc3339()));
    }
    obj.insert("$permissions".to_string(), Value::Array(doc.permissions().iter().cloned().map(Value::String).collect()));
    if let Some(tenant) = doc.tenant() {
        obj.insert("$tenant".to_string(), Value::from(tenant));
    }
    Value::Object(obj)
}

fn document_from_cache_value(value: Value) -> DbResult<Document> {
    let Value::Object(mut obj) = value else {
        return Err(DbError::database("corrupt cache entry"));
    };
    let mut doc = Document::new();
    if let Some(Value::String(id)) = obj.remove("$id") {
        doc.set_id(id);
    }
    if let Some(Value::String(internal_id)) = obj.remove("$internalId") {
        doc.set_internal_id(internal_id);
    }
    if let Some(Value::String(collection)) = obj.remove("$collection") {
        doc.set_collection(collection);
    }
    if let Some(Value::String(created_at)) = obj.remove("$createdAt") {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&created_at) {
            doc.set_created_at(parsed.with_timezone(&Utc));
        }
    }
    if let Some(Value::String(updated_at)) = obj.remove("$updatedAt") {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&updated_at) {
            doc.set_updated_at(parsed.with_timezone(&Utc));
        }
    }
    if let Some(Value::Array(perms)) = obj.remove("$permissions") {
        doc.set_permissions(perms.into_iter().filter_map(|v| v.as_str().map(str::to_string)));
    }
    if let Some(tenant) = obj.remove("$tenant").and_then(|v| v.as_i64()) {
        doc.set_tenant(Some(tenant));
    }
    for (key, value) in obj {
        doc.set(key, value);
    }
    Ok(doc)
}

#[async_trait::async_trait]
impl RelationshipHost for Database {
    fn collection(&self, id: &str) -> Option<Collection> {
        self.collections.lock().expect("collections mutex poisoned").get(id).cloned()
    }

    async fn get_document(&self, collection: &str, id: &str) -> DbResult<Document> {
        let doc = self.adapter.get_document(collection, id).await?;
        if doc.is_empty() {
            return Ok(doc);
        }
        let attributes = RelationshipHost::collection(self, collection).map(|c| c.attributes).unwrap_or_default();
        let cast = cast_document(&attributes, self.adapter.as_ref(), doc);
        decode_document(&attributes, &self.filters, cast, &QueryPlan::default())
    }

    async fn find(&self, collection: &str, plan: &QueryPlan) -> DbResult<Vec<Document>> {
        let rows = self.adapter.find(collection, plan).await?;
        let attributes = RelationshipHost::collection(self, collection).map(|c| c.attributes).unwrap_or_default();
        rows.into_iter()
            .map(|doc| {
                let cast = cast_document(&attributes, self.adapter.as_ref(), doc);
                decode_document(&attributes, &self.filters, cast, plan)
            })
            .collect()
    }

    async fn create_document(&self, collection: &str, mut doc: Document) -> DbResult<Document> {
        if doc.id().is_none() {
            doc.set_id(generate_document_id());
        }
        doc.set_collection(collection.to_string());
        let now = Utc::now();
        if doc.created_at().is_none() {
            doc.set_created_at(now);
        }
        if doc.updated_at().is_none() {
            doc.set_updated_at(now);
        }
        if self.adapter.shared_tables() {
            doc.set_tenant(self.adapter.tenant_id());
        }
        let attributes = RelationshipHost::collection(self, collection).map(|c| c.attributes).unwrap_or_default();
        let encoded = encode_document(&attributes, &self.filters, &doc)?;
        self.adapter.create_document(collection, encoded).await
    }

    /// Loads the existing row and merges `doc`'s attributes onto it before
    /// writing: `adapter.update_document` replaces the whole row (see
    /// `test_support::MemoryAdapter`), while relationship writes here only
    /// ever carry a minimal patch (`$id` plus the one changed attribute).
    async fn update_document(&self, collection: &str, doc: Document) -> DbResult<Document> {
        let id = doc.id().ok_or_else(|| DbError::database("relationship update requires $id"))?.to_string();
        let existing = self.adapter.get_document(collection, &id).await?;
        let mut merged = merge_patch(&existing, &doc);
        merged.set_id(id.clone());
        let attributes = RelationshipHost::collection(self, collection).map(|c| c.attributes).unwrap_or_default();
        let encoded = encode_document(&attributes, &self.filters, &merged)?;
        let result = self.adapter.update_document(collection, encoded).await?;
        self.purge_document_cache(collection, &id).await;
        Ok(result)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> DbResult<()> {
        self.adapter.delete_document(collection, id).await?;
        self.purge_document_cache(collection, id).await;
        Ok(())
    }

    async fn link_related_cache(&self, host_collection: &str, host_id: &str, related_collection: &str, related_id: &str) {
        let tenant = self.adapter.tenant_id();
        let is_global = self.is_global(host_collection);
        let host_key = self.cache_keys().document_key(tenant, host_collection, host_id, is_global);
        let related_map_key = CacheKeys::related_docs_map_key(related_collection, related_id);
        if let Err(err) = self.cache.save(&host_key, Value::Bool(true), Some(&related_map_key)).await {
            warn!(%err, "cache related-map save failed");
        }
    }
}
