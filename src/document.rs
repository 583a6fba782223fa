//! The Document value: an opaque, ordered attribute bag plus the system
//! fields every stored row carries (`$id`, `$internalId`, `$collection`,
//! `$createdAt`, `$updatedAt`, `$permissions`, `$tenant`).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::permission::Permission;

/// An ordered mapping from attribute name to value, plus the system fields
/// every document carries. Values are scalars, nulls, arrays of scalars, or
/// (only during relationship materialization) nested `Document`s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    id: Option<String>,
    internal_id: Option<String>,
    collection: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    permissions: BTreeSet<String>,
    tenant: Option<i64>,
    attributes: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// A document is "empty" when it carries no id and no attributes — the
    /// sentinel returned by read/delete paths instead of a NotFound error.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.attributes.is_empty()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.id = Some(id.into());
        self
    }

    pub fn internal_id(&self) -> Option<&str> {
        self.internal_id.as_deref()
    }

    pub fn set_internal_id(&mut self, internal_id: impl Into<String>) -> &mut Self {
        self.internal_id = Some(internal_id.into());
        self
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn set_collection(&mut self, collection: impl Into<String>) -> &mut Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn set_created_at(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.created_at = Some(at);
        self
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn set_updated_at(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.updated_at = Some(at);
        self
    }

    pub fn tenant(&self) -> Option<i64> {
        self.tenant
    }

    pub fn set_tenant(&mut self, tenant: Option<i64>) -> &mut Self {
        self.tenant = tenant;
        self
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn set_permissions<I: IntoIterator<Item = String>>(&mut self, perms: I) -> &mut Self {
        self.permissions = perms.into_iter().collect();
        self
    }

    pub fn add_permission(&mut self, permission: Permission) -> &mut Self {
        self.permissions.insert(permission.to_string());
        self
    }

    /// Returns the permission actions granted to `role` as declared on this
    /// document, used by the authorization check when `documentSecurity` is
    /// enabled (§4.5).
    pub fn permissions_for_role(&self, role: &str) -> Vec<String> {
        self.permissions
            .iter()
            .filter_map(|raw| Permission::parse(raw).ok())
            .filter(|perm| perm.role == role)
            .map(|perm| perm.action.as_str().to_string())
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.attributes.get_mut(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.attributes
    }

    pub fn into_attributes(self) -> Map<String, Value> {
        self.attributes
    }

    /// Returns the related document id for a relationship-typed attribute
    /// value, regardless of whether it is stored as a bare id string or a
    /// materialized nested `Document` (serialized as a JSON object carrying
    /// `$id`).
    pub fn relation_id_at(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(id) => Some(id.clone()),
            Value::Object(obj) => obj.get("$id").and_then(Value::as_str).map(|s| s.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_has_no_id_and_no_attributes() {
        let doc = Document::new();
        assert!(doc.is_empty());
    }

    #[test]
    fn document_with_id_is_not_empty_even_without_attributes() {
        let mut doc = Document::new();
        doc.set_id("u1");
        assert!(!doc.is_empty());
    }

    #[test]
    fn relation_id_at_reads_bare_string_and_nested_object() {
        let mut doc = Document::new();
        doc.set("author", Value::String("u1".into()));
        assert_eq!(doc.relation_id_at("author").as_deref(), Some("u1"));

        let mut nested = Map::new();
        nested.insert("$id".to_string(), Value::String("u2".into()));
        doc.set("author", Value::Object(nested));
        assert_eq!(doc.relation_id_at("author").as_deref(), Some("u2"));
    }

    #[test]
    fn permissions_for_role_filters_by_role_and_strips_action() {
        let mut doc = Document::new();
        doc.set_permissions(["read(\"any\")".to_string(), "update(\"user:u1\")".to_string()]);
        assert_eq!(doc.permissions_for_role("any"), vec!["read".to_string()]);
        assert_eq!(doc.permissions_for_role("user:u1"), vec!["update".to_string()]);
        assert!(doc.permissions_for_role("user:u2").is_empty());
    }
}
