//! The SQL adapter contract (§6 "Adapter contract") — the pluggable,
//! out-of-scope persistence collaborator the engine is layered over. This
//! module declares the trait and a minimal in-memory implementation used
//! only by this crate's own tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::document::Document;
use crate::errors::DbResult;
use crate::query::QueryPlan;
use crate::schema::{Attribute, Index};

/// Per-collection DDL/DML surface plus connection lifecycle and adapter
/// limits, consumed by the document engine and schema managers. Kept
/// intentionally thin: the adapter owns its own connection pool, SQL
/// dialect, and transaction machinery (§6).
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn init(&self) -> DbResult<()>;
    async fn ping(&self) -> DbResult<()>;
    async fn close(&self) -> DbResult<()>;

    fn connection_id(&self) -> String;

    fn prefix(&self) -> String;
    fn set_prefix(&mut self, prefix: String);

    fn database(&self) -> String;
    fn set_database(&mut self, database: String);

    fn tenant_id(&self) -> Option<i64>;
    fn set_tenant_id(&mut self, tenant_id: Option<i64>);

    /// Whether this adapter multiplexes tenants onto shared tables rather
    /// than one table per tenant (affects duplicate-swallowing during
    /// schema migration, §7 "Propagation").
    fn shared_tables(&self) -> bool;

    async fn create(&self, name: &str) -> DbResult<bool>;
    async fn exists(&self, name: &str, collection: Option<&str>) -> DbResult<bool>;
    async fn drop(&self, name: &str) -> DbResult<bool>;

    async fn create_collection(&self, id: &str, attributes: &[Attribute], indexes: &[Index]) -> DbResult<bool>;
    async fn drop_collection(&self, id: &str) -> DbResult<bool>;

    async fn create_attribute(&self, collection: &str, attribute: &Attribute) -> DbResult<bool>;
    async fn update_attribute(&self, collection: &str, attribute: &Attribute) -> DbResult<bool>;
    async fn rename_attribute(&self, collection: &str, old_key: &str, new_key: &str) -> DbResult<bool>;
    async fn delete_attribute(&self, collection: &str, key: &str) -> DbResult<bool>;

    async fn create_index(&self, collection: &str, index: &Index) -> DbResult<bool>;
    async fn rename_index(&self, collection: &str, old_key: &str, new_key: &str) -> DbResult<bool>;
    async fn delete_index(&self, collection: &str, key: &str) -> DbResult<bool>;

    async fn create_relationship(&self, collection: &str, related_collection: &str, attribute: &Attribute) -> DbResult<bool>;
    async fn update_relationship(&self, collection: &str, attribute: &Attribute) -> DbResult<bool>;
    async fn delete_relationship(&self, collection: &str, key: &str) -> DbResult<bool>;

    async fn get_document(&self, collection: &str, id: &str) -> DbResult<Document>;
    async fn create_document(&self, collection: &str, document: Document) -> DbResult<Document>;
    async fn create_documents(&self, collection: &str, documents: Vec<Document>) -> DbResult<Vec<Document>>;
    async fn update_document(&self, collection: &str, document: Document) -> DbResult<Document>;
    async fn update_documents(&self, collection: &str, plan: &QueryPlan, changes: &Document) -> DbResult<u64>;
    async fn delete_document(&self, collection: &str, id: &str) -> DbResult<bool>;
    async fn delete_documents(&self, collection: &str, plan: &QueryPlan) -> DbResult<u64>;
    async fn increase_document_attribute(&self, collection: &str, id: &str, attribute: &str, delta: f64, min: Option<f64>, max: Option<f64>) -> DbResult<f64>;

    async fn find(&self, collection: &str, plan: &QueryPlan) -> DbResult<Vec<Document>>;
    async fn count(&self, collection: &str, plan: &QueryPlan) -> DbResult<u64>;
    async fn sum(&self, collection: &str, plan: &QueryPlan, attribute: &str) -> DbResult<f64>;

    async fn size_of_collection(&self, collection: &str) -> DbResult<u64>;
    async fn size_of_collection_on_disk(&self, collection: &str) -> DbResult<u64>;

    async fn start_transaction(&self) -> DbResult<()>;
    async fn commit(&self) -> DbResult<()>;
    async fn rollback(&self) -> DbResult<()>;

    fn max_index_length(&self) -> u32;
    fn limit_for_string(&self) -> u32;
    fn limit_for_int(&self) -> u32;
    fn limit_for_attributes(&self) -> u32;
    fn limit_for_indexes(&self) -> u32;
    fn document_size_limit(&self) -> u32;
    fn attribute_width(&self, attribute: &Attribute) -> u32;

    fn count_of_attributes(&self, collection_attribute_count: usize) -> usize;
    fn count_of_indexes(&self, collection_index_count: usize) -> usize;
    fn count_of_default_attributes(&self) -> usize;
    fn count_of_default_indexes(&self) -> usize;

    fn internal_indexes_keys(&self) -> Vec<&'static str>;

    fn min_date_time(&self) -> DateTime<Utc>;
    fn max_date_time(&self) -> DateTime<Utc>;

    fn array_index_length(&self) -> u32;

    fn support_for_index(&self) -> bool;
    fn support_for_unique_index(&self) -> bool;
    fn support_for_fulltext_index(&self) -> bool;
    fn support_for_casting(&self) -> bool;
}
