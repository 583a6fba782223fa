//! createIndex/renameIndex/deleteIndex (§4.2 "Index create/delete/rename").

use crate::adapter::Adapter;
use crate::errors::{DbError, DbResult};
use crate::metadata::Collection;
use crate::schema::attribute::AttributeType;
use crate::schema::index::{Index, IndexType, INDEX_LENGTH_UNBOUNDED};

/// Validates adapter support flags, enforces count limits, rewrites
/// `lengths` for string attributes whose size equals the adapter's
/// index-length limit (replaced with the unbounded sentinel), and forces
/// array attributes onto the fixed array-index length with no explicit
/// order (§4.2).
pub async fn create_index(adapter: &dyn Adapter, collection: &mut Collection, mut index: Index) -> DbResult<Index> {
    if collection.find_index(&index.id).is_some() {
        return Err(DbError::duplicate(format!("index `{}`", index.id)));
    }
    match index.index_type {
        IndexType::Unique if !adapter.support_for_unique_index() => {
            return Err(DbError::database("adapter does not support unique indexes"));
        }
        IndexType::Fulltext if !adapter.support_for_fulltext_index() => {
            return Err(DbError::database("adapter does not support fulltext indexes"));
        }
        _ if !adapter.support_for_index() => {
            return Err(DbError::database("adapter does not support indexes"));
        }
        _ => {}
    }

    if adapter.count_of_indexes(collection.indexes.len() + 1) > adapter.limit_for_indexes() as usize {
        return Err(DbError::limit("index count exceeds adapter limit"));
    }

    for (slot, attribute_key) in index.attributes.iter().enumerate() {
        let attribute = collection
            .find_attribute(attribute_key)
            .ok_or_else(|| DbError::not_found(format!("attribute `{attribute_key}`")))?;

        if attribute.array {
            index.lengths[slot] = Some(adapter.array_index_length());
            index.orders[slot] = None;
            continue;
        }

        if attribute.attribute_type == AttributeType::String && attribute.size == adapter.max_index_length() {
            index.lengths[slot] = INDEX_LENGTH_UNBOUNDED;
        }
    }

    adapter.create_index(&collection.id, &index).await?;
    collection.indexes.push(index.clone());
    Ok(index)
}

pub async fn rename_index(adapter: &dyn Adapter, collection: &mut Collection, old_key: &str, new_key: &str) -> DbResult<()> {
    if collection.find_index(new_key).is_some() {
        return Err(DbError::duplicate(format!("index `{new_key}`")));
    }
    let position = collection.indexes.iter().position(|i| i.id == old_key).ok_or_else(|| DbError::not_found(format!("index `{old_key}`")))?;
    adapter.rename_index(&collection.id, old_key, new_key).await?;
    collection.indexes[position].id = new_key.to_string();
    collection.indexes[position].key = new_key.to_string();
    Ok(())
}

pub async fn delete_index(adapter: &dyn Adapter, collection: &mut Collection, id: &str) -> DbResult<()> {
    if collection.find_index(id).is_none() {
        return Err(DbError::not_found(format!("index `{id}`")));
    }
    adapter.delete_index(&collection.id, id).await?;
    collection.indexes.retain(|i| i.id != id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::attribute::Attribute;
    use crate::test_support::MemoryAdapter;

    fn collection_with_attribute() -> Collection {
        let mut coll = Collection::new("users", "users");
        coll.attributes.push(Attribute::new("email", AttributeType::String, 255));
        let mut tags = Attribute::new("tags", AttributeType::String, 64);
        tags.array = true;
        coll.attributes.push(tags);
        coll
    }

    #[tokio::test]
    async fn create_index_rejects_duplicate_id() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection_with_attribute();
        create_index(&adapter, &mut coll, Index::single_key("email")).await.unwrap();
        let err = create_index(&adapter, &mut coll, Index::single_key("email")).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn array_attribute_gets_fixed_length_and_no_order() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection_with_attribute();
        let index = create_index(&adapter, &mut coll, Index::single_key("tags")).await.unwrap();
        assert_eq!(index.lengths[0], Some(adapter.array_index_length()));
        assert_eq!(index.orders[0], None);
    }

    #[tokio::test]
    async fn rename_index_updates_id_and_key() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection_with_attribute();
        create_index(&adapter, &mut coll, Index::single_key("email")).await.unwrap();
        rename_index(&adapter, &mut coll, "idx_email", "idx_email_address").await.unwrap();
        assert!(coll.find_index("idx_email_address").is_some());
        assert!(coll.find_index("idx_email").is_none());
    }

    #[tokio::test]
    async fn delete_index_removes_it() {
        let adapter = MemoryAdapter::default();
        let mut coll = collection_with_attribute();
        create_index(&adapter, &mut coll, Index::single_key("email")).await.unwrap();
        delete_index(&adapter, &mut coll, "idx_email").await.unwrap();
        assert!(coll.indexes.is_empty());
    }
}
