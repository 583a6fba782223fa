//! Populate (read), create/update relations (write), and delete relations
//! by `onDelete` policy (§4.3). Recursion is bounded by three stacks that
//! guard against cyclic schemas.

use async_trait::async_trait;
use serde_json::Value;

use crate::document::Document;
use crate::errors::{DbError, DbResult};
use crate::metadata::Collection;
use crate::query::{Query, QueryPlan};
use crate::relationship::manager::junction_collection_id;
use crate::relationship::RELATION_MAX_DEPTH;
use crate::schema::attribute::{Attribute, OnDelete, RelationOptions, RelationSide, RelationType};

/// Everything the resolver needs from the engine to recurse into related
/// collections, without the resolver depending on the engine's full public
/// surface (or vice versa).
#[async_trait]
pub trait RelationshipHost: Send + Sync {
    fn collection(&self, id: &str) -> Option<Collection>;
    async fn get_document(&self, collection: &str, id: &str) -> DbResult<Document>;
    async fn find(&self, collection: &str, plan: &QueryPlan) -> DbResult<Vec<Document>>;
    async fn create_document(&self, collection: &str, doc: Document) -> DbResult<Document>;
    async fn update_document(&self, collection: &str, doc: Document) -> DbResult<Document>;
    async fn delete_document(&self, collection: &str, id: &str) -> DbResult<()>;

    /// Records a reverse edge: `host_collection`/`host_id` embedded
    /// `related_collection`/`related_id` during population, so a later
    /// write to the related doc also purges the host's cache entry
    /// (§4.4 "related docs map").
    async fn link_related_cache(&self, host_collection: &str, host_id: &str, related_collection: &str, related_id: &str);
}

/// One in-progress relationship traversal frame, used by the fetch stack's
/// reflexive/symmetric/transitive skip tests.
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    collection: String,
    key: String,
    related_collection: String,
    two_way_key: String,
    side: RelationSide,
}

#[derive(Debug, Default)]
pub struct RelationStacks {
    write: Vec<String>,
    fetch: Vec<Frame>,
    delete: Vec<String>,
}

impl RelationStacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// "The attribute is stripped from the payload" once the write stack is
    /// this deep and the collection at the top isn't the relationship's own
    /// related collection (no infinite writes).
    fn write_exhausted(&self, related_collection: &str) -> bool {
        self.write.len() + 1 >= RELATION_MAX_DEPTH && self.write.last().is_some_and(|top| top != related_collection)
    }

    fn should_skip_fetch(&self, candidate: &Frame) -> bool {
        if self.fetch.len() >= RELATION_MAX_DEPTH {
            return true;
        }
        self.fetch.iter().any(|frame| {
            // reflexive: identical descriptor already in progress.
            frame == candidate
            // symmetric: the mirror of an in-progress descriptor.
            || (frame.collection == candidate.related_collection && frame.related_collection == candidate.collection && frame.key == candidate.two_way_key && frame.two_way_key == candidate.key)
            // transitive: shares key and opposite side with an in-progress descriptor.
            || (frame.key == candidate.key && frame.side != candidate.side)
        })
    }
}

fn frame_for(collection: &str, attribute: &Attribute, relation: &RelationOptions) -> Frame {
    Frame {
        collection: collection.to_string(),
        key: attribute.key.clone(),
        related_collection: relation.related_collection.clone(),
        two_way_key: relation.two_way_key.clone(),
        side: relation.side,
    }
}

/// Materializes every relationship attribute on `doc` per §4.3 "Populate".
pub async fn populate(host: &dyn RelationshipHost, collection: &Collection, doc: &mut Document, stacks: &mut RelationStacks) -> DbResult<()> {
    let attributes: Vec<Attribute> = collection.relationship_attributes().cloned().collect();
    for attribute in attributes {
        let Some(relation) = attribute.relation.clone() else { continue };
        let frame = frame_for(&collection.id, &attribute, &relation);
        if stacks.should_skip_fetch(&frame) {
            doc.remove(&attribute.key);
            continue;
        }
        stacks.fetch.push(frame);
        let result = populate_one(host, &collection.id, doc, &attribute, &relation, stacks).await;
        stacks.fetch.pop();
        result?;
    }
    Ok(())
}

/// Resolves the deterministic junction collection id for a `manyToMany`
/// relation, given the collection id owning `relation` (either side).
async fn resolve_junction_id(host: &dyn RelationshipHost, owner_collection_id: &str, relation: &RelationOptions) -> DbResult<String> {
    let owner = host.collection(owner_collection_id).ok_or_else(|| DbError::not_found(format!("collection `{owner_collection_id}`")))?;
    let related = host
        .collection(&relation.related_collection)
        .ok_or_else(|| DbError::not_found(format!("collection `{}`", relation.related_collection)))?;
    Ok(match relation.side {
        RelationSide::Parent => junction_collection_id(&owner, &related),
        RelationSide::Child => junction_collection_id(&related, &owner),
    })
}

async fn populate_one(host: &dyn RelationshipHost, owner_collection_id: &str, doc: &mut Document, attribute: &Attribute, relation: &RelationOptions, stacks: &mut RelationStacks) -> DbResult<()> {
    let self_id = doc.id().unwrap_or_default().to_string();

    match (relation.relation_type, relation.side) {
        (RelationType::OneToOne, _) => {
            if let Some(related_id) = doc.relation_id_at(&attribute.key) {
                let mut related = host.get_document(&relation.related_collection, &related_id).await?;
                if let Some(related_collection) = host.collection(&relation.related_collection) {
                    Box::pin(populate(host, &related_collection, &mut related, stacks)).await?;
                }
                host.link_related_cache(owner_collection_id, &self_id, &relation.related_collection, &related_id).await;
                doc.set(attribute.key.clone(), document_to_value(&related));
            }
        }
        (RelationType::OneToMany, RelationSide::Parent) => {
            let plan = QueryPlan::build(&[Query::equal(relation.two_way_key.clone(), Value::String(self_id.clone()))]);
            let mut related = host.find(&relation.related_collection, &plan).await?;
            if let Some(related_collection) = host.collection(&relation.related_collection) {
                for r in &mut related {
                    if let Some(related_id) = r.id().map(str::to_string) {
                        host.link_related_cache(owner_collection_id, &self_id, &relation.related_collection, &related_id).await;
                    }
                    r.remove(&relation.two_way_key);
                    Box::pin(populate(host, &related_collection, r, stacks)).await?;
                }
            }
            doc.set(attribute.key.clone(), Value::Array(related.iter().map(document_to_value).collect()));
        }
        (RelationType::OneToMany, RelationSide::Child) => {
            if relation.two_way {
                if let Some(parent_id) = doc.relation_id_at(&attribute.key) {
                    let mut parent = host.get_document(&relation.related_collection, &parent_id).await?;
                    if let Some(parent_collection) = host.collection(&relation.related_collection) {
                        Box::pin(populate(host, &parent_collection, &mut parent, stacks)).await?;
                    }
                    host.link_related_cache(owner_collection_id, &self_id, &relation.related_collection, &parent_id).await;
                    doc.set(attribute.key.clone(), document_to_value(&parent));
                }
            } else {
                doc.remove(&attribute.key);
            }
        }
        (RelationType::ManyToOne, RelationSide::Parent) => {
            if let Some(related_id) = doc.relation_id_at(&attribute.key) {
                let mut related = host.get_document(&relation.related_collection, &related_id).await?;
                if let Some(related_collection) = host.collection(&relation.related_collection) {
                    Box::pin(populate(host, &related_collection, &mut related, stacks)).await?;
                }
                host.link_related_cache(owner_collection_id, &self_id, &relation.related_collection, &related_id).await;
                doc.set(attribute.key.clone(), document_to_value(&related));
            }
        }
        (RelationType::ManyToOne, RelationSide::Child) => {
            if relation.two_way {
                let plan = QueryPlan::build(&[Query::equal(relation.two_way_key.clone(), Value::String(self_id.clone()))]);
                let related = host.find(&relation.related_collection, &plan).await?;
                for r in &related {
                    if let Some(related_id) = r.id() {
                        host.link_related_cache(owner_collection_id, &self_id, &relation.related_collection, related_id).await;
                    }
                }
                doc.set(attribute.key.clone(), Value::Array(related.iter().map(document_to_value).collect()));
            } else {
                doc.remove(&attribute.key);
            }
        }
        (RelationType::ManyToMany, _) => {
            let plan = QueryPlan::build(&[Query::equal(relation.two_way_key.clone(), Value::String(self_id.clone()))]);
            let junction_id = resolve_junction_id(host, owner_collection_id, relation).await?;
            let junction_rows = host.find(&junction_id, &plan).await?;
            if relation.side == RelationSide::Child && !relation.two_way {
                doc.remove(&attribute.key);
                return Ok(());
            }
            let mut related_docs = Vec::with_capacity(junction_rows.len());
            for row in &junction_rows {
                if let Some(related_id) = row.get("key").and_then(Value::as_str) {
                    related_docs.push(host.get_document(&relation.related_collection, related_id).await?);
                    host.link_related_cache(owner_collection_id, &self_id, &relation.related_collection, related_id).await;
                }
            }
            doc.set(attribute.key.clone(), Value::Array(related_docs.iter().map(document_to_value).collect()));
        }
    }
    Ok(())
}

fn document_to_value(doc: &Document) -> Value {
    let mut obj = doc.attributes().clone();
    if let Some(id) = doc.id() {
        obj.insert("$id".to_string(), Value::String(id.to_string()));
    }
    Value::Object(obj)
}

/// Creates or patches the related side of a relationship attribute found in
/// an incoming write payload (§4.3 "Create relations").
pub async fn create_relations(host: &dyn RelationshipHost, collection: &Collection, doc: &mut Document, stacks: &mut RelationStacks) -> DbResult<()> {
    let attributes: Vec<Attribute> = collection.relationship_attributes().cloned().collect();
    stacks.write.push(collection.id.clone());
    let result = create_relations_inner(host, &collection.id, &attributes, doc, stacks).await;
    stacks.write.pop();
    result
}

async fn create_relations_inner(host: &dyn RelationshipHost, owner_collection_id: &str, attributes: &[Attribute], doc: &mut Document, stacks: &mut RelationStacks) -> DbResult<()> {
    let self_id = doc.id().unwrap_or_default().to_string();
    for attribute in attributes {
        let Some(relation) = &attribute.relation else { continue };
        if stacks.write_exhausted(&relation.related_collection) {
            doc.remove(&attribute.key);
            continue;
        }
        let Some(raw) = doc.get(&attribute.key).cloned() else { continue };
        if raw.is_null() {
            continue;
        }
        let many_on_this_side = matches!(
            (relation.relation_type, relation.side),
            (RelationType::OneToMany, RelationSide::Parent) | (RelationType::ManyToOne, RelationSide::Child) | (RelationType::ManyToMany, _)
        );
        match (&raw, many_on_this_side) {
            (Value::Array(items), true) => {
                for item in items {
                    write_one_relation(host, owner_collection_id, &self_id, attribute, relation, item).await?;
                }
            }
            (Value::Array(_), false) => return Err(DbError::relationship(format!("attribute `{}` does not accept an array", attribute.key))),
            (_, false) => write_one_relation(host, owner_collection_id, &self_id, attribute, relation, &raw).await?,
            (_, true) => return Err(DbError::relationship(format!("attribute `{}` requires an array", attribute.key))),
        }
    }
    Ok(())
}

async fn write_one_relation(host: &dyn RelationshipHost, owner_collection_id: &str, self_id: &str, attribute: &Attribute, relation: &RelationOptions, value: &Value) -> DbResult<()> {
    let writes_two_way_key = matches!(
        (relation.relation_type, relation.side),
        (RelationType::OneToOne, _) | (RelationType::OneToMany, RelationSide::Parent) | (RelationType::ManyToOne, RelationSide::Child)
    );

    match value {
        Value::Object(obj) => {
            let mut related = Document::new();
            for (k, v) in obj {
                if k != "$id" {
                    related.set(k.clone(), v.clone());
                }
            }
            if let Some(id) = obj.get("$id").and_then(Value::as_str) {
                related.set_id(id.to_string());
            }
            if writes_two_way_key {
                related.set(relation.two_way_key.clone(), Value::String(self_id.to_string()));
            }
            if relation.relation_type == RelationType::ManyToMany {
                let related = host.create_document(&relation.related_collection, related).await?;
                let junction_id = resolve_junction_id(host, owner_collection_id, relation).await?;
                let mut junction = Document::new();
                junction.set("key", Value::String(related.id().unwrap_or_default().to_string()));
                junction.set("twoWayKey", Value::String(self_id.to_string()));
                host.create_document(&junction_id, junction).await?;
            } else {
                host.create_document(&relation.related_collection, related).await?;
            }
        }
        Value::String(related_id) => {
            if writes_two_way_key {
                let mut patch = Document::new();
                patch.set_id(related_id.clone());
                patch.set(relation.two_way_key.clone(), Value::String(self_id.to_string()));
                host.update_document(&relation.related_collection, patch).await?;
            }
            if relation.relation_type == RelationType::ManyToMany {
                let junction_id = resolve_junction_id(host, owner_collection_id, relation).await?;
                let mut junction = Document::new();
                junction.set("key", Value::String(related_id.clone()));
                junction.set("twoWayKey", Value::String(self_id.to_string()));
                host.create_document(&junction_id, junction).await?;
            }
        }
        _ => return Err(DbError::relationship(format!("attribute `{}` carries an unsupported relationship value", attribute.key))),
    }
    Ok(())
}

/// Cascades deletion behavior per `onDelete` policy (§4.3 "Delete relations").
pub async fn delete_relations(host: &dyn RelationshipHost, collection: &Collection, doc: &Document, stacks: &mut RelationStacks) -> DbResult<()> {
    if stacks.delete.iter().any(|c| c == &collection.id) {
        return Ok(());
    }
    stacks.delete.push(collection.id.clone());
    let result = delete_relations_inner(host, collection, doc, stacks).await;
    stacks.delete.pop();
    result
}

async fn delete_relations_inner(host: &dyn RelationshipHost, collection: &Collection, doc: &Document, stacks: &mut RelationStacks) -> DbResult<()> {
    let self_id = doc.id().unwrap_or_default().to_string();
    let attributes: Vec<Attribute> = collection.relationship_attributes().cloned().collect();
    for attribute in attributes {
        let Some(relation) = attribute.relation else { continue };
        let related_ids = related_ids_for_delete(host, &collection.id, doc, &self_id, &attribute, &relation).await?;
        match relation.on_delete {
            OnDelete::Restrict => {
                if !related_ids.is_empty() {
                    return Err(DbError::restricted(format!("relationship `{}` has related rows", attribute.key)));
                }
            }
            OnDelete::SetNull => {
                if relation.relation_type == RelationType::ManyToMany {
                    let junction_id = resolve_junction_id(host, &collection.id, &relation).await?;
                    for related_id in related_ids {
                        host.delete_document(&junction_id, &related_id).await?;
                    }
                } else {
                    for related_id in related_ids {
                        let mut patch = Document::new();
                        patch.set_id(related_id);
                        patch.set(relation.two_way_key.clone(), Value::Null);
                        host.update_document(&relation.related_collection, patch).await?;
                    }
                }
            }
            OnDelete::Cascade => {
                if relation.relation_type == RelationType::ManyToMany {
                    let junction_id = resolve_junction_id(host, &collection.id, &relation).await?;
                    for related_id in related_ids {
                        host.delete_document(&junction_id, &related_id).await?;
                    }
                    continue;
                }
                for related_id in related_ids {
                    if let Ok(related_doc) = host.get_document(&relation.related_collection, &related_id).await {
                        if let Some(related_collection) = host.collection(&relation.related_collection) {
                            Box::pin(delete_relations(host, &related_collection, &related_doc, stacks)).await?;
                        }
                        host.delete_document(&relation.related_collection, &related_id).await?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Parent-side `oneToOne`/`manyToOne` store the related id directly on the
/// document; every other side/variant must probe the related collection
/// (or junction) by `twoWayKey` (§4.3 "Delete relations").
async fn related_ids_for_delete(host: &dyn RelationshipHost, owner_collection_id: &str, doc: &Document, self_id: &str, attribute: &Attribute, relation: &RelationOptions) -> DbResult<Vec<String>> {
    let stores_id_directly = matches!((relation.relation_type, relation.side), (RelationType::OneToOne, RelationSide::Parent) | (RelationType::ManyToOne, RelationSide::Parent));
    if stores_id_directly {
        return Ok(doc.relation_id_at(&attribute.key).into_iter().collect());
    }
    let plan = QueryPlan::build(&[Query::equal(relation.two_way_key.clone(), Value::String(self_id.to_string()))]);
    let scope = if relation.relation_type == RelationType::ManyToMany {
        resolve_junction_id(host, owner_collection_id, relation).await?
    } else {
        relation.related_collection.clone()
    };
    let rows = host.find(&scope, &plan).await?;
    Ok(rows.iter().filter_map(|d| d.id().map(str::to_string)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_stack_exhausts_after_max_depth_for_unrelated_collection() {
        let mut stacks = RelationStacks::new();
        stacks.write.push("a".into());
        stacks.write.push("b".into());
        assert!(stacks.write_exhausted("c"));
        assert!(!stacks.write_exhausted("b"));
    }

    #[test]
    fn fetch_stack_skips_reflexive_descriptor() {
        let mut stacks = RelationStacks::new();
        let frame = Frame { collection: "users".into(), key: "posts".into(), related_collection: "posts".into(), two_way_key: "author".into(), side: RelationSide::Parent };
        stacks.fetch.push(frame.clone());
        assert!(stacks.should_skip_fetch(&frame));
    }

    #[test]
    fn fetch_stack_skips_symmetric_mirror() {
        let mut stacks = RelationStacks::new();
        stacks.fetch.push(Frame { collection: "users".into(), key: "posts".into(), related_collection: "posts".into(), two_way_key: "author".into(), side: RelationSide::Parent });
        let mirror = Frame { collection: "posts".into(), key: "author".into(), related_collection: "users".into(), two_way_key: "posts".into(), side: RelationSide::Child };
        assert!(stacks.should_skip_fetch(&mirror));
    }
}
