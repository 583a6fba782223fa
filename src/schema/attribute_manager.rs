//! createAttribute/updateAttribute/renameAttribute/deleteAttribute (§4.2).

use serde_json::Value;

use crate::adapter::Adapter;
use crate::errors::{DbError, DbResult};
use crate::metadata::Collection;
use crate::schema::attribute::{Attribute, AttributeType};

fn default_matches_type(attribute: &Attribute) -> bool {
    match &attribute.default {
        None => true,
        Some(value) => match attribute.attribute_type {
            AttributeType::String | AttributeType::Datetime => value.is_string(),
            AttributeType::Integer => value.is_i64() || value.is_u64(),
            AttributeType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            AttributeType::Boolean => value.is_boolean(),
            AttributeType::Relationship => false,
        },
    }
}

/// Enforces unique id (case-insensitive), required-filter inclusion,
/// row-width/count limits, and `required ⇒ default=null` (§4.2
/// "createAttribute").
pub async fn create_attribute(adapter: &dyn Adapter, collection: &mut Collection, mut attribute: Attribute) -> DbResult<Attribute> {
    if collection.find_attribute(&attribute.id).is_some() {
        return Err(DbError::duplicate(format!("attribute `{}`", attribute.id)));
    }
    if attribute.required && attribute.default.is_some() {
        return Err(DbError::structure_issue(&attribute.key, "structure.required", "required attributes may not declare a default"));
    }
    if attribute.requires_datetime_filter() && !attribute.has_filter("datetime") {
        attribute.filters.insert(0, "datetime".to_string());
    }
    if !default_matches_type(&attribute) {
        return Err(DbError::structure_issue(&attribute.key, "structure.default", "default value does not match attribute type"));
    }
    match attribute.attribute_type {
        AttributeType::String if attribute.size > adapter.limit_for_string() => {
            return Err(DbError::limit(format!("string attribute `{}` exceeds adapter limit", attribute.key)));
        }
        AttributeType::Integer if attribute.size > adapter.limit_for_int() => {
            return Err(DbError::limit(format!("integer attribute `{}` exceeds adapter limit", attribute.key)));
        }
        _ => {}
    }

    let attribute_count = collection.attributes.len();
    if adapter.count_of_attributes(attribute_count + 1) > adapter.limit_for_attributes() as usize {
        return Err(DbError::limit("attribute count exceeds adapter limit"));
    }

    let projected_width: u32 = collection.attributes.iter().map(|a| adapter.attribute_width(a)).sum::<u32>() + adapter.attribute_width(&attribute);
    if projected_width > adapter.document_size_limit() {
        return Err(DbError::limit("row width exceeds adapter limit"));
    }

    let swallow_duplicate = collection.document_security && adapter.shared_tables();
    match adapter.create_attribute(&collection.id, &attribute).await {
        Ok(_) => {}
        Err(DbError::Duplicate { .. }) if swallow_duplicate => {}
        Err(err) => return Err(err),
    }

    collection.attributes.push(attribute.clone());
    Ok(attribute)
}

/// Mutates an existing attribute. Changing `type`/`signed`/`array`/`new_key`
/// is "altering": every index referencing the attribute is re-validated
/// (rewriting its attribute list when the key changes) and adapter DDL is
/// issued. A pure `required`/`default`/`size`/`format` change only touches
/// the in-memory/metadata copy — no DDL (§4.2 "updateAttribute"). A `size`
/// shrink always re-checks referencing indexes' stored lengths, altering or
/// not.
#[allow(clippy::too_many_arguments)]
pub async fn update_attribute(
    adapter: &dyn Adapter,
    collection: &mut Collection,
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
    let existing = collection
        .find_attribute(key)
        .cloned()
        .ok_or_else(|| DbError::not_found(format!("attribute `{key}`")))?;

    let altering = attribute_type.is_some() || signed.is_some() || array.is_some() || new_key.is_some();

    if let Some(ref new_key) = new_key {
        if new_key != key && collection.find_attribute(new_key).is_some() {
            return Err(DbError::duplicate(format!("attribute `{new_key}`")));
        }
    }

    let mut updated = existing.clone();
    if let Some(ref new_key) = new_key {
        updated.id = new_key.clone();
        updated.key = new_key.clone();
    }
    if let Some(attribute_type) = attribute_type {
        updated.attribute_type = attribute_type;
    }
    if let Some(required) = required {
        updated.required = required;
    }
    if let Some(default) = default {
        updated.default = default;
    }
    if let Some(size) = size {
        updated.size = size;
    }
    if let Some(signed) = signed {
        updated.signed = signed;
    }
    if let Some(array) = array {
        updated.array = array;
    }
    if let Some(format) = format {
        updated.format = format;
    }
    if updated.required && updated.default.is_some() {
        return Err(DbError::structure_issue(key, "structure.required", "required attributes may not declare a default"));
    }
    if !default_matches_type(&updated) {
        return Err(DbError::structure_issue(key, "structure.default", "default value does not match attribute type"));
    }
    match updated.attribute_type {
        AttributeType::String if updated.size > adapter.limit_for_string() => {
            return Err(DbError::limit(format!("string attribute `{}` exceeds adapter limit", updated.key)));
        }
        AttributeType::Integer if updated.size > adapter.limit_for_int() => {
            return Err(DbError::limit(format!("integer attribute `{}` exceeds adapter limit", updated.key)));
        }
        _ => {}
    }

    if altering {
        if let Some(ref new_key) = new_key {
            for index in &mut collection.indexes {
                index.rename_attribute(key, new_key);
            }
        }
        adapter.update_attribute(&collection.id, &updated).await?;
        if let Some(ref new_key) = new_key {
            adapter.rename_attribute(&collection.id, key, new_key).await?;
        }
    }

    if let Some(size) = size {
        for index in &mut collection.indexes {
            if let Some(pos) = index.attributes.iter().position(|a| a == &updated.key) {
                if index.lengths[pos].is_some_and(|length| size < length) {
                    index.lengths[pos] = if size >= adapter.max_index_length() { None } else { Some(size) };
                }
            }
        }
    }

    let slot = collection.find_attribute_mut(key).expect("checked above");
    *slot = updated.clone();
    Ok(updated)
}

/// Renames an attribute's `key`; every index referencing it is rewritten to
/// follow (§4.2 "renameAttribute", Invariant 1).
pub async fn rename_attribute(adapter: &dyn Adapter, collection: &mut Collection, old_key: &str, new_key: &str) -> DbResult<()> {
    if collection.find_attribute(new_key).is_some() {
        return Err(DbError::duplicate(format!("attribute `{new_key}`")));
    }
    if collection.find_attribute(old_key).is_none() {
        return Err(DbError::not_found(format!("attribute `{old_key}`")));
    }
    adapter.rename_attribute(&collection.id, old_key, new_key).await?;
    if let Some(attr) = collection.find_attribute_mut(old_key) {
        attr.key = new_key.to_string();
    }
    for index in &mut collection.indexes {
        index.rename_attribute(old_key, new_key);
    }
    Ok(())
}

pub async fn delete_attribute(adapter: &dyn Adapter, collection: &mut Collection, key: &str) -> DbResult<()> {
    let existing = collection.find_attribute(key).ok_or_else(|| DbError::not_found(format!("attribute `{key}`")))?;
    if existing.is_relationship() {
        return Err(DbError::relationship(format!("attribute `{key}` is a relationship, use deleteRelationship")));
    }
    adapter.delete_attribute(&collection.id, key).await?;
    collection.attributes.retain(|a| a.key != key);
    for index in &mut collection.indexes {
        index.prune_attribute(key);
    }
    collection.indexes.retain(|idx| !idx.attributes.is_empty());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::index::Index;
    use crate::test_support::MemoryAdapter;

    fn collection() -> Collection {
        Collection::new("users", "users")
    }

    #[tokio::test]
    async fn create_attribute_rejects_duplicate_id() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        create_attribute(&adapter, &mut coll, Attribute::new("name", AttributeType::String, 255)).await.unwrap();
        let err = create_attribute(&adapter, &mut coll, Attribute::new("name", AttributeType::String, 255)).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn create_attribute_injects_datetime_filter() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        let attr = create_attribute(&adapter, &mut coll, Attribute::new("created_at", AttributeType::Datetime, 0)).await.unwrap();
        assert!(attr.has_filter("datetime"));
    }

    #[tokio::test]
    async fn rename_attribute_updates_referencing_indexes() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        create_attribute(&adapter, &mut coll, Attribute::new("email", AttributeType::String, 255)).await.unwrap();
        coll.indexes.push(Index::single_unique("email"));
        rename_attribute(&adapter, &mut coll, "email", "email_address").await.unwrap();
        assert!(coll.indexes[0].references("email_address"));
        assert!(!coll.indexes[0].references("email"));
    }

    #[tokio::test]
    async fn delete_attribute_drops_referencing_indexes() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        create_attribute(&adapter, &mut coll, Attribute::new("email", AttributeType::String, 255)).await.unwrap();
        coll.indexes.push(Index::single_unique("email"));
        delete_attribute(&adapter, &mut coll, "email").await.unwrap();
        assert!(coll.indexes.is_empty());
        assert!(coll.attributes.is_empty());
    }

    #[tokio::test]
    async fn delete_attribute_shrinks_composite_index_instead_of_dropping_it() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        create_attribute(&adapter, &mut coll, Attribute::new("first", AttributeType::String, 255)).await.unwrap();
        create_attribute(&adapter, &mut coll, Attribute::new("last", AttributeType::String, 255)).await.unwrap();
        coll.indexes.push(Index::new("idx_name", crate::schema::index::IndexType::Key, vec!["first".into(), "last".into()]));
        delete_attribute(&adapter, &mut coll, "first").await.unwrap();
        assert_eq!(coll.indexes.len(), 1);
        assert_eq!(coll.indexes[0].attributes, vec!["last".to_string()]);
    }

    #[tokio::test]
    async fn update_attribute_applies_non_altering_change() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        create_attribute(&adapter, &mut coll, Attribute::new("bio", AttributeType::String, 255)).await.unwrap();
        let updated = update_attribute(&adapter, &mut coll, "bio", None, None, Some(true), None, None, None, None, None).await.unwrap();
        assert!(updated.required);
        assert_eq!(updated.key, "bio");
    }

    #[tokio::test]
    async fn update_attribute_new_key_rewrites_referencing_indexes() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        create_attribute(&adapter, &mut coll, Attribute::new("email", AttributeType::String, 255)).await.unwrap();
        coll.indexes.push(Index::single_unique("email"));
        let updated = update_attribute(&adapter, &mut coll, "email", Some("email_address".into()), None, None, None, None, None, None, None).await.unwrap();
        assert_eq!(updated.key, "email_address");
        assert!(coll.indexes[0].references("email_address"));
        assert!(!coll.indexes[0].references("email"));
    }

    #[tokio::test]
    async fn update_attribute_size_shrink_clamps_index_length() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        create_attribute(&adapter, &mut coll, Attribute::new("bio", AttributeType::String, 255)).await.unwrap();
        let mut index = Index::single_key("bio");
        index.lengths[0] = Some(200);
        coll.indexes.push(index);
        update_attribute(&adapter, &mut coll, "bio", None, None, None, None, Some(50), None, None, None).await.unwrap();
        assert_eq!(coll.indexes[0].lengths[0], Some(50));
    }

    #[tokio::test]
    async fn delete_attribute_rejects_relationship_attribute() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection();
        let mut relation_attr = Attribute::new("posts", AttributeType::Relationship, 0);
        relation_attr.relation = Some(crate::schema::attribute::RelationOptions {
            related_collection: "posts".into(),
            relation_type: crate::schema::attribute::RelationType::OneToMany,
            two_way: true,
            two_way_key: "author".into(),
            on_delete: crate::schema::attribute::OnDelete::Cascade,
            side: crate::schema::attribute::RelationSide::Parent,
        });
        coll.attributes.push(relation_attr);
        let err = delete_attribute(&adapter, &mut coll, "posts").await.unwrap_err();
        assert!(matches!(err, DbError::Relationship { .. }));
    }
}
