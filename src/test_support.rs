//! In-memory `Adapter`/`Cache` test doubles. Used only behind `#[cfg(test)]`
//! by this crate's own unit and integration tests — never a production
//! persistence backend (§10.4 "Test tooling").

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::adapter::Adapter;
use crate::cache::Cache;
use crate::document::Document;
use crate::errors::{DbError, DbResult};
use crate::id::generate_document_id;
use crate::query::{FilterOperator, QueryPlan};
use crate::schema::{Attribute, Index};

/// A single process-local collection store, keyed by `$id`.
#[derive(Default)]
struct Table {
    rows: Vec<Document>,
}

/// Implements the full `Adapter` contract over an in-process `HashMap`, with
/// no real SQL behind it. Good enough to exercise the engine's contract with
/// its external collaborator without running a database.
#[derive(Default)]
pub struct MemoryAdapter {
    tables: Mutex<HashMap<String, Table>>,
    prefix: Mutex<String>,
    database: Mutex<String>,
    tenant_id: Mutex<Option<i64>>,
    sequence: Mutex<u64>,
}

impl MemoryAdapter {
    fn next_internal_id(&self) -> String {
        let mut seq = self.sequence.lock().unwrap();
        *seq += 1;
        seq.to_string()
    }

    fn matches(condition: &crate::query::FilterCondition, doc: &Document) -> bool {
        let actual = doc.get(&condition.attribute);
        match condition.operator {
            FilterOperator::IsNull => actual.is_none_or(Value::is_null),
            FilterOperator::IsNotNull => actual.is_some_and(|v| !v.is_null()),
            FilterOperator::Equal => actual == condition.values.first(),
            FilterOperator::NotEqual => actual != condition.values.first(),
            FilterOperator::Contains => match (actual, condition.values.first()) {
                (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                _ => false,
            },
            FilterOperator::StartsWith => matches!((actual, condition.values.first()), (Some(Value::String(s)), Some(Value::String(p))) if s.starts_with(p.as_str())),
            FilterOperator::EndsWith => matches!((actual, condition.values.first()), (Some(Value::String(s)), Some(Value::String(p))) if s.ends_with(p.as_str())),
            FilterOperator::GreaterThan | FilterOperator::GreaterThanEqual | FilterOperator::LessThan | FilterOperator::LessThanEqual => {
                let (Some(actual), Some(bound)) = (actual.and_then(Value::as_f64), condition.values.first().and_then(Value::as_f64)) else {
                    return false;
                };
                match condition.operator {
                    FilterOperator::GreaterThan => actual > bound,
                    FilterOperator::GreaterThanEqual => actual >= bound,
                    FilterOperator::LessThan => actual < bound,
                    FilterOperator::LessThanEqual => actual <= bound,
                    _ => unreachable!(),
                }
            }
            FilterOperator::Between => {
                let (Some(actual), Some(lo), Some(hi)) = (actual.and_then(Value::as_f64), condition.values.first().and_then(Value::as_f64), condition.values.get(1).and_then(Value::as_f64)) else {
                    return false;
                };
                actual >= lo && actual <= hi
            }
            FilterOperator::Search => matches!((actual, condition.values.first()), (Some(Value::String(s)), Some(Value::String(needle))) if s.to_lowercase().contains(&needle.to_lowercase())),
        }
    }

    fn filtered<'a>(rows: &'a [Document], plan: &QueryPlan) -> Vec<&'a Document> {
        rows.iter().filter(|doc| plan.filters.iter().all(|c| Self::matches(c, doc))).collect()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn init(&self) -> DbResult<()> {
        Ok(())
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        Ok(())
    }

    fn connection_id(&self) -> String {
        "memory".to_string()
    }

    fn prefix(&self) -> String {
        self.prefix.lock().unwrap().clone()
    }

    fn set_prefix(&mut self, prefix: String) {
        *self.prefix.lock().unwrap() = prefix;
    }

    fn database(&self) -> String {
        self.database.lock().unwrap().clone()
    }

    fn set_database(&mut self, database: String) {
        *self.database.lock().unwrap() = database;
    }

    fn tenant_id(&self) -> Option<i64> {
        *self.tenant_id.lock().unwrap()
    }

    fn set_tenant_id(&mut self, tenant_id: Option<i64>) {
        *self.tenant_id.lock().unwrap() = tenant_id;
    }

    fn shared_tables(&self) -> bool {
        false
    }

    async fn create(&self, name: &str) -> DbResult<bool> {
        self.tables.lock().unwrap().entry(name.to_string()).or_default();
        Ok(true)
    }

    async fn exists(&self, name: &str, _collection: Option<&str>) -> DbResult<bool> {
        Ok(self.tables.lock().unwrap().contains_key(name))
    }

    async fn drop(&self, name: &str) -> DbResult<bool> {
        Ok(self.tables.lock().unwrap().remove(name).is_some())
    }

    async fn create_collection(&self, id: &str, _attributes: &[Attribute], _indexes: &[Index]) -> DbResult<bool> {
        self.tables.lock().unwrap().entry(id.to_string()).or_default();
        Ok(true)
    }

    async fn drop_collection(&self, id: &str) -> DbResult<bool> {
        Ok(self.tables.lock().unwrap().remove(id).is_some())
    }

    async fn create_attribute(&self, _collection: &str, _attribute: &Attribute) -> DbResult<bool> {
        Ok(true)
    }

    async fn update_attribute(&self, _collection: &str, _attribute: &Attribute) -> DbResult<bool> {
        Ok(true)
    }

    async fn rename_attribute(&self, collection: &str, old_key: &str, new_key: &str) -> DbResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = tables.get_mut(collection) {
            for row in &mut table.rows {
                if let Some(value) = row.remove(old_key) {
                    row.set(new_key.to_string(), value);
                }
            }
        }
        Ok(true)
    }

    async fn delete_attribute(&self, collection: &str, key: &str) -> DbResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = tables.get_mut(collection) {
            for row in &mut table.rows {
                row.remove(key);
            }
        }
        Ok(true)
    }

    async fn create_index(&self, _collection: &str, _index: &Index) -> DbResult<bool> {
        Ok(true)
    }

    async fn rename_index(&self, _collection: &str, _old_key: &str, _new_key: &str) -> DbResult<bool> {
        Ok(true)
    }

    async fn delete_index(&self, _collection: &str, _key: &str) -> DbResult<bool> {
        Ok(true)
    }

    async fn create_relationship(&self, _collection: &str, _related_collection: &str, _attribute: &Attribute) -> DbResult<bool> {
        Ok(true)
    }

    async fn update_relationship(&self, _collection: &str, _attribute: &Attribute) -> DbResult<bool> {
        Ok(true)
    }

    async fn delete_relationship(&self, _collection: &str, _key: &str) -> DbResult<bool> {
        Ok(true)
    }

    async fn get_document(&self, collection: &str, id: &str) -> DbResult<Document> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(collection).and_then(|t| t.rows.iter().find(|d| d.id() == Some(id))).cloned().unwrap_or_default())
    }

    async fn create_document(&self, collection: &str, mut document: Document) -> DbResult<Document> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(collection.to_string()).or_default();
        let id = document.id().map(str::to_string).unwrap_or_else(generate_document_id);
        if table.rows.iter().any(|d| d.id() == Some(id.as_str())) {
            return Err(DbError::duplicate(format!("document `{id}`")));
        }
        document.set_id(id);
        document.set_internal_id(self.next_internal_id());
        table.rows.push(document.clone());
        Ok(document)
    }

    async fn create_documents(&self, collection: &str, documents: Vec<Document>) -> DbResult<Vec<Document>> {
        let mut created = Vec::with_capacity(documents.len());
        for doc in documents {
            created.push(self.create_document(collection, doc).await?);
        }
        Ok(created)
    }

    async fn update_document(&self, collection: &str, document: Document) -> DbResult<Document> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(collection.to_string()).or_default();
        let id = document.id().ok_or_else(|| DbError::database("update requires $id"))?.to_string();
        let slot = table.rows.iter_mut().find(|d| d.id() == Some(id.as_str())).ok_or_else(|| DbError::not_found(format!("document `{id}`")))?;
        *slot = document.clone();
        Ok(document)
    }

    async fn update_documents(&self, collection: &str, plan: &QueryPlan, changes: &Document) -> DbResult<u64> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(collection.to_string()).or_default();
        let matching: Vec<usize> = Self::filtered(&table.rows, plan).iter().map(|d| table.rows.iter().position(|r| r.id() == d.id()).unwrap()).collect();
        let count = matching.len() as u64;
        for idx in matching {
            for (key, value) in changes.attributes() {
                table.rows[idx].set(key.clone(), value.clone());
            }
        }
        Ok(count)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> DbResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = tables.get_mut(collection) {
            let before = table.rows.len();
            table.rows.retain(|d| d.id() != Some(id));
            return Ok(table.rows.len() != before);
        }
        Ok(false)
    }

    async fn delete_documents(&self, collection: &str, plan: &QueryPlan) -> DbResult<u64> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(collection.to_string()).or_default();
        let ids: Vec<String> = Self::filtered(&table.rows, plan).into_iter().filter_map(|d| d.id().map(str::to_string)).collect();
        let count = ids.len() as u64;
        table.rows.retain(|d| !d.id().is_some_and(|id| ids.iter().any(|x| x == id)));
        Ok(count)
    }

    async fn increase_document_attribute(&self, collection: &str, id: &str, attribute: &str, delta: f64, min: Option<f64>, max: Option<f64>) -> DbResult<f64> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(collection.to_string()).or_default();
        let doc = table.rows.iter_mut().find(|d| d.id() == Some(id)).ok_or_else(|| DbError::not_found(format!("document `{id}`")))?;
        let current = doc.get(attribute).and_then(Value::as_f64).unwrap_or(0.0);
        let next = current + delta;
        if min.is_some_and(|m| next < m) || max.is_some_and(|m| next > m) {
            return Err(DbError::limit(format!("attribute `{attribute}` out of bounds")));
        }
        doc.set(attribute.to_string(), serde_json::json!(next));
        Ok(next)
    }

    async fn find(&self, collection: &str, plan: &QueryPlan) -> DbResult<Vec<Document>> {
        let tables = self.tables.lock().unwrap();
        let Some(table) = tables.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<Document> = Self::filtered(&table.rows, plan).into_iter().cloned().collect();
        for (attribute, order) in plan.order.iter().rev() {
            matched.sort_by(|a, b| {
                let av = a.get(attribute).cloned().unwrap_or(Value::Null);
                let bv = b.get(attribute).cloned().unwrap_or(Value::Null);
                let ordering = av.to_string().cmp(&bv.to_string());
                if *order == crate::query::SortOrder::Desc { ordering.reverse() } else { ordering }
            });
        }
        if let Some(offset) = plan.offset {
            matched = matched.into_iter().skip(offset as usize).collect();
        }
        if let Some(limit) = plan.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn count(&self, collection: &str, plan: &QueryPlan) -> DbResult<u64> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(collection).map(|t| Self::filtered(&t.rows, plan).len() as u64).unwrap_or(0))
    }

    async fn sum(&self, collection: &str, plan: &QueryPlan, attribute: &str) -> DbResult<f64> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(collection).map(|t| Self::filtered(&t.rows, plan).iter().filter_map(|d| d.get(attribute).and_then(Value::as_f64)).sum()).unwrap_or(0.0))
    }

    async fn size_of_collection(&self, collection: &str) -> DbResult<u64> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(collection).map(|t| t.rows.len() as u64).unwrap_or(0))
    }

    async fn size_of_collection_on_disk(&self, collection: &str) -> DbResult<u64> {
        self.size_of_collection(collection).await
    }

    async fn start_transaction(&self) -> DbResult<()> {
        Ok(())
    }

    async fn commit(&self) -> DbResult<()> {
        Ok(())
    }

    async fn rollback(&self) -> DbResult<()> {
        Ok(())
    }

    fn max_index_length(&self) -> u32 {
        3072
    }

    fn limit_for_string(&self) -> u32 {
        16_383
    }

    fn limit_for_int(&self) -> u32 {
        8
    }

    fn limit_for_attributes(&self) -> u32 {
        1_017
    }

    fn limit_for_indexes(&self) -> u32 {
        64
    }

    fn document_size_limit(&self) -> u32 {
        65_535
    }

    fn attribute_width(&self, attribute: &Attribute) -> u32 {
        match attribute.attribute_type {
            crate::schema::AttributeType::String => attribute.size.min(self.limit_for_string()),
            crate::schema::AttributeType::Integer => 8,
            crate::schema::AttributeType::Float => 8,
            crate::schema::AttributeType::Boolean => 1,
            crate::schema::AttributeType::Datetime => 19,
            crate::schema::AttributeType::Relationship => 0,
        }
    }

    fn count_of_attributes(&self, collection_attribute_count: usize) -> usize {
        collection_attribute_count + self.count_of_default_attributes()
    }

    fn count_of_indexes(&self, collection_index_count: usize) -> usize {
        collection_index_count + self.count_of_default_indexes()
    }

    fn count_of_default_attributes(&self) -> usize {
        4
    }

    fn count_of_default_indexes(&self) -> usize {
        1
    }

    fn internal_indexes_keys(&self) -> Vec<&'static str> {
        vec!["_uid", "_createdAt", "_updatedAt"]
    }

    fn min_date_time(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap()
    }

    fn max_date_time(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap()
    }

    fn array_index_length(&self) -> u32 {
        255
    }

    fn support_for_index(&self) -> bool {
        true
    }

    fn support_for_unique_index(&self) -> bool {
        true
    }

    fn support_for_fulltext_index(&self) -> bool {
        true
    }

    fn support_for_casting(&self) -> bool {
        true
    }
}

/// A process-local `Cache` double: a plain map keyed by cache key, with
/// parent-key listing for purge/list semantics (§6 "Cache contract").
#[derive(Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, Value>>,
    listings: Mutex<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl Cache for MemoryCache {
    async fn load(&self, key: &str, _ttl_seconds: u64, _hash_key: Option<&str>) -> DbResult<Option<Value>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, key: &str, value: Value, parent_key: Option<&str>) -> DbResult<bool> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        if let Some(parent) = parent_key {
            let mut listings = self.listings.lock().unwrap();
            let entry = listings.entry(parent.to_string()).or_default();
            if !entry.iter().any(|k| k == key) {
                entry.push(key.to_string());
            }
        }
        Ok(true)
    }

    async fn list(&self, parent_key: &str) -> DbResult<Vec<String>> {
        Ok(self.listings.lock().unwrap().get(parent_key).cloned().unwrap_or_default())
    }

    async fn purge(&self, key: &str, parent_key: Option<&str>) -> DbResult<bool> {
        self.values.lock().unwrap().remove(key);
        if let Some(parent) = parent_key {
            if let Some(entry) = self.listings.lock().unwrap().get_mut(parent) {
                entry.retain(|k| k != key);
            }
        }
        Ok(true)
    }

    async fn flush(&self) -> DbResult<()> {
        self.values.lock().unwrap().clear();
        self.listings.lock().unwrap().clear();
        Ok(())
    }
}
