//! createRelationship/updateRelationship/deleteRelationship (§4.2).

use crate::adapter::Adapter;
use crate::errors::{DbError, DbResult};
use crate::metadata::Collection;
use crate::schema::attribute::{Attribute, AttributeType, OnDelete, RelationOptions, RelationSide, RelationType};
use crate::schema::index::Index;

/// Junction collection id for a `manyToMany` relationship, per Invariant 4:
/// `_<parentInternalId>_<childInternalId>`.
pub fn junction_collection_id(parent: &Collection, child: &Collection) -> String {
    format!(
        "_{}_{}",
        parent.internal_id.as_deref().unwrap_or(&parent.id),
        child.internal_id.as_deref().unwrap_or(&child.id)
    )
}

fn parent_side_index(relation_type: RelationType, key: &str) -> Option<Index> {
    match relation_type {
        RelationType::OneToOne => Some(Index::single_unique(key)),
        RelationType::ManyToOne => Some(Index::single_key(key)),
        RelationType::OneToMany | RelationType::ManyToMany => None,
    }
}

fn child_side_index(relation_type: RelationType, two_way: bool, two_way_key: &str) -> Option<Index> {
    match relation_type {
        RelationType::OneToOne if two_way => Some(Index::single_unique(two_way_key)),
        RelationType::OneToMany => Some(Index::single_key(two_way_key)),
        _ => None,
    }
}

/// Creates both sides of a relationship plus (for `manyToMany`) a junction
/// collection. Returns the parent attribute, child mirror attribute, and an
/// optional junction `Collection` the caller must register in the metadata
/// catalog and issue `create_collection` for.
#[allow(clippy::too_many_arguments)]
pub async fn create_relationship(
    adapter: &dyn Adapter,
    parent: &mut Collection,
    child: &mut Collection,
    key: Option<String>,
    two_way: bool,
    two_way_key: Option<String>,
    relation_type: RelationType,
    on_delete: OnDelete,
) -> DbResult<(Attribute, Attribute, Option<Collection>)> {
    let reflexive = parent.id == child.id;
    let key = key.unwrap_or_else(|| child.id.clone());
    let two_way_key = two_way_key.unwrap_or_else(|| parent.id.clone());

    if parent.find_attribute(&key).is_some() {
        return Err(DbError::duplicate(format!("attribute `{key}`")));
    }
    if reflexive && two_way_key == key {
        return Err(DbError::duplicate(format!("attribute `{two_way_key}`")));
    }
    let two_way_collision = if reflexive { parent.find_attribute(&two_way_key) } else { child.find_attribute(&two_way_key) };
    if two_way_collision.is_some() {
        return Err(DbError::duplicate(format!("attribute `{two_way_key}`")));
    }
    if parent
        .relationship_attributes()
        .any(|a| a.relation.as_ref().is_some_and(|r| r.related_collection == child.id && r.two_way_key == two_way_key))
    {
        return Err(DbError::duplicate("relationship with the same (relatedCollection, twoWayKey)"));
    }

    let mut parent_attr = Attribute::new(&key, AttributeType::Relationship, 0);
    parent_attr.relation = Some(RelationOptions {
        related_collection: child.id.clone(),
        relation_type,
        two_way,
        two_way_key: two_way_key.clone(),
        on_delete,
        side: RelationSide::Parent,
    });

    let mut child_attr = Attribute::new(&two_way_key, AttributeType::Relationship, 0);
    child_attr.relation = Some(RelationOptions {
        related_collection: parent.id.clone(),
        relation_type,
        two_way,
        two_way_key: key.clone(),
        on_delete,
        side: RelationSide::Child,
    });

    let junction = if relation_type == RelationType::ManyToMany {
        let junction_id = junction_collection_id(parent, child);
        let mut junction = Collection::new(junction_id, "junction");
        junction.attributes.push(Attribute::new("key", AttributeType::String, 255).required(true));
        junction.attributes.push(Attribute::new("twoWayKey", AttributeType::String, 255).required(true));
        junction.indexes.push(Index::single_key("key"));
        junction.indexes.push(Index::single_key("twoWayKey"));
        adapter.create_collection(&junction.id, &junction.attributes, &junction.indexes).await?;
        Some(junction)
    } else {
        if let Some(index) = parent_side_index(relation_type, &key) {
            parent.indexes.push(index);
        }
        if let Some(index) = child_side_index(relation_type, two_way, &two_way_key) {
            if reflexive {
                parent.indexes.push(index);
            } else {
                child.indexes.push(index);
            }
        }
        None
    };

    adapter.create_relationship(&parent.id, &child.id, &parent_attr).await?;
    parent.attributes.push(parent_attr.clone());
    if reflexive {
        parent.attributes.push(child_attr.clone());
        *child = parent.clone();
    } else {
        child.attributes.push(child_attr.clone());
    }
    Ok((parent_attr, child_attr, junction))
}

/// Renames either side's key/twoWayKey and toggles `twoWay`/`onDelete`.
/// `manyToMany` relation type itself is immutable post-creation.
pub async fn update_relationship(
    adapter: &dyn Adapter,
    parent: &mut Collection,
    child: &mut Collection,
    current_key: &str,
    new_key: Option<String>,
    new_two_way_key: Option<String>,
    new_two_way: Option<bool>,
    new_on_delete: Option<OnDelete>,
) -> DbResult<()> {
    let reflexive = parent.id == child.id;
    let old_two_way_key = {
        let parent_attr = parent.find_attribute(current_key).ok_or_else(|| DbError::not_found(format!("relationship `{current_key}`")))?;
        parent_attr.relation.as_ref().ok_or_else(|| DbError::relationship("attribute is not a relationship"))?.two_way_key.clone()
    };

    if let Some(ref new_key) = new_key {
        adapter.rename_attribute(&parent.id, current_key, new_key).await?;
        for index in &mut parent.indexes {
            index.rename_attribute(current_key, new_key);
        }
    }
    {
        let child_side: &mut Collection = if reflexive { &mut *parent } else { &mut *child };
        if let Some(ref new_two_way_key) = new_two_way_key {
            adapter.rename_attribute(&child_side.id, &old_two_way_key, new_two_way_key).await?;
            for index in &mut child_side.indexes {
                index.rename_attribute(&old_two_way_key, new_two_way_key);
            }
        }
    }

    let key_after = new_key.clone().unwrap_or_else(|| current_key.to_string());
    let two_way_key_after = new_two_way_key.clone().unwrap_or(old_two_way_key.clone());

    let parent_attr = parent.find_attribute_mut(current_key).expect("checked above");
    parent_attr.key = key_after.clone();
    let relation = parent_attr.relation.as_mut().expect("checked above");
    if let Some(new_two_way_key) = new_two_way_key {
        relation.two_way_key = new_two_way_key;
    }
    if let Some(new_two_way) = new_two_way {
        relation.two_way = new_two_way;
    }
    if let Some(new_on_delete) = new_on_delete {
        relation.on_delete = new_on_delete;
    }

    {
        let child_side: &mut Collection = if reflexive { &mut *parent } else { &mut *child };
        if let Some(child_attr) = child_side.find_attribute_mut(&old_two_way_key) {
            child_attr.key = two_way_key_after;
            if let Some(relation) = child_attr.relation.as_mut() {
                relation.two_way_key = key_after;
                if let Some(new_two_way) = new_two_way {
                    relation.two_way = new_two_way;
                }
                if let Some(new_on_delete) = new_on_delete {
                    relation.on_delete = new_on_delete;
                }
            }
        }
    }

    if reflexive {
        *child = parent.clone();
    }

    Ok(())
}

/// Removes both sides' attributes and backing indexes. The caller is
/// responsible for dropping the junction collection (if any) via the
/// metadata catalog once this returns.
pub async fn delete_relationship(adapter: &dyn Adapter, parent: &mut Collection, child: &mut Collection, key: &str) -> DbResult<Option<String>> {
    let reflexive = parent.id == child.id;
    let parent_attr = parent.find_attribute(key).cloned().ok_or_else(|| DbError::not_found(format!("relationship `{key}`")))?;
    let relation = parent_attr.relation.clone().ok_or_else(|| DbError::relationship("attribute is not a relationship"))?;

    adapter.delete_relationship(&parent.id, key).await?;
    parent.attributes.retain(|a| a.key != key);
    parent.indexes.retain(|i| !i.references(key));
    {
        let child_side: &mut Collection = if reflexive { &mut *parent } else { &mut *child };
        if child_side.find_attribute(&relation.two_way_key).is_some() {
            child_side.attributes.retain(|a| a.key != relation.two_way_key);
            child_side.indexes.retain(|i| !i.references(&relation.two_way_key));
        }
    }

    if reflexive {
        *child = parent.clone();
    }

    if relation.relation_type == RelationType::ManyToMany {
        Ok(Some(junction_collection_id(parent, child)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryAdapter;

    #[tokio::test]
    async fn creates_mirrored_attributes_one_to_many() {
        let adapter = MemoryAdapter::default();
        let mut parent = Collection::new("users", "users");
        let mut child = Collection::new("posts", "posts");
        let (parent_attr, child_attr, junction) =
            create_relationship(&adapter, &mut parent, &mut child, Some("posts".into()), true, Some("author".into()), RelationType::OneToMany, OnDelete::Cascade)
                .await
                .unwrap();
        assert!(junction.is_none());
        assert_eq!(parent_attr.key, "posts");
        assert_eq!(child_attr.key, "author");
        assert!(child.indexes.iter().any(|i| i.references("author")));
    }

    #[tokio::test]
    async fn many_to_many_creates_junction_collection() {
        let adapter = MemoryAdapter::default();
        let mut parent = Collection::new("posts", "posts");
        let mut child = Collection::new("tags", "tags");
        let (_, _, junction) = create_relationship(&adapter, &mut parent, &mut child, None, true, None, RelationType::ManyToMany, OnDelete::SetNull)
            .await
            .unwrap();
        let junction = junction.unwrap();
        assert_eq!(junction.attributes.len(), 2);
        assert_eq!(junction.indexes.len(), 2);
    }

    #[tokio::test]
    async fn delete_relationship_removes_both_sides() {
        let adapter = MemoryAdapter::default();
        let mut parent = Collection::new("users", "users");
        let mut child = Collection::new("posts", "posts");
        create_relationship(&adapter, &mut parent, &mut child, Some("posts".into()), true, Some("author".into()), RelationType::OneToMany, OnDelete::Restrict)
            .await
            .unwrap();
        delete_relationship(&adapter, &mut parent, &mut child, "posts").await.unwrap();
        assert!(parent.find_attribute("posts").is_none());
        assert!(child.find_attribute("author").is_none());
    }

    #[tokio::test]
    async fn reflexive_create_relationship_mirrors_both_attributes_onto_one_collection() {
        let adapter = MemoryAdapter::default();
        let mut parent = Collection::new("users", "users");
        let mut child = parent.clone();
        let (parent_attr, child_attr, junction) =
            create_relationship(&adapter, &mut parent, &mut child, Some("friends".into()), true, Some("friendOf".into()), RelationType::OneToMany, OnDelete::SetNull)
                .await
                .unwrap();
        assert!(junction.is_none());
        assert!(parent.find_attribute(&parent_attr.key).is_some());
        assert!(parent.find_attribute(&child_attr.key).is_some());
        assert_eq!(parent.attributes.len(), child.attributes.len());
        assert!(child.find_attribute(&parent_attr.key).is_some());
        assert!(child.find_attribute(&child_attr.key).is_some());
        assert!(parent.indexes.iter().any(|i| i.references("friendOf")));
    }

    #[tokio::test]
    async fn reflexive_create_relationship_rejects_matching_key_and_two_way_key() {
        let adapter = MemoryAdapter::default();
        let mut parent = Collection::new("users", "users");
        let mut child = parent.clone();
        let err = create_relationship(&adapter, &mut parent, &mut child, Some("peer".into()), true, Some("peer".into()), RelationType::OneToOne, OnDelete::SetNull)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn reflexive_delete_relationship_removes_both_attributes() {
        let adapter = MemoryAdapter::default();
        let mut parent = Collection::new("users", "users");
        let mut child = parent.clone();
        create_relationship(&adapter, &mut parent, &mut child, Some("friends".into()), true, Some("friendOf".into()), RelationType::OneToMany, OnDelete::SetNull)
            .await
            .unwrap();
        delete_relationship(&adapter, &mut parent, &mut child, "friends").await.unwrap();
        assert!(parent.find_attribute("friends").is_none());
        assert!(parent.find_attribute("friendOf").is_none());
        assert!(child.find_attribute("friends").is_none());
        assert!(child.find_attribute("friendOf").is_none());
    }
}
