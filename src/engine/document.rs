//! Pure helpers backing `Database`'s document lifecycle methods: patch
//! merging, relationship-aware change detection, related-id extraction, and
//! nested-selection trimming (§4.1 "updateDocument", §4.3, §8 scenario 8).

use std::collections::BTreeSet;

use serde_json::Value;

use crate::document::Document;
use crate::metadata::Collection;
use crate::query::QueryPlan;

/// Merges `patch`'s attributes and permissions onto `base`. Callers are
/// responsible for re-protecting `$id`/`$collection`/`$createdAt`/`$tenant`
/// before persisting (§3 invariant 7) — this function only merges values.
pub fn merge_patch(base: &Document, patch: &Document) -> Document {
    let mut merged = base.clone();
    for (key, value) in patch.attributes() {
        merged.set(key.clone(), value.clone());
    }
    if !patch.permissions().is_empty() {
        merged.set_permissions(patch.permissions().iter().cloned());
    }
    merged
}

/// The related id(s) carried by a relationship attribute's value, whether
/// stored as a bare id string, a materialized sub-document (`$id`), or an
/// array of either (§4.3 "Update relations").
pub fn related_ids(value: &Value) -> Vec<String> {
    match value {
        Value::String(id) => vec![id.clone()],
        Value::Object(obj) => obj.get("$id").and_then(Value::as_str).map(|s| vec![s.to_string()]).unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(related_ids).collect(),
        _ => Vec::new(),
    }
}

fn relationship_changed(old: Option<&Value>, new: &Value) -> bool {
    let old_ids: BTreeSet<String> = old.map(related_ids).unwrap_or_default().into_iter().collect();
    let new_ids: BTreeSet<String> = related_ids(new).into_iter().collect();
    old_ids != new_ids
}

/// Whether applying `patch` to `old` would actually change anything:
/// relationship attributes diff by related-id set membership, everything
/// else by value equality (§4.1 "updateDocument" `shouldUpdate`).
pub fn should_update(collection: &Collection, old: &Document, patch: &Document) -> bool {
    patch.attributes().iter().any(|(key, new_value)| {
        let is_relationship = collection.find_attribute(key).is_some_and(|a| a.is_relationship());
        let old_value = old.get(key);
        if is_relationship { relationship_changed(old_value, new_value) } else { old_value != Some(new_value) }
    })
}

fn trim_value(value: &mut Value, wants: &impl Fn(&str) -> bool) {
    match value {
        Value::Object(obj) => obj.retain(|k, _| k == "$id" || wants(k)),
        Value::Array(items) => items.iter_mut().for_each(|item| trim_value(item, wants)),
        _ => {}
    }
}

/// Restricts populated relationship sub-documents to the nested selections
/// requested via a dotted-path `select` entry (§4.1/§8 scenario 8, "select
/// with dotted path"). A no-op when the query specified no selections at
/// all (the default, full-population behavior).
pub fn apply_nested_selections(collection: &Collection, plan: &QueryPlan, doc: &mut Document) {
    if plan.selections.is_empty() {
        return;
    }
    for attribute in collection.relationship_attributes() {
        let nested = plan.nested_selections_for(&attribute.key);
        if nested.is_empty() {
            continue;
        }
        let wants = |name: &str| nested.iter().any(|s| s.is_wildcard() || s.0 == name);
        if let Some(value) = doc.get_mut(&attribute.key) {
            trim_value(value, &wants);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::schema::attribute::{Attribute, AttributeType, OnDelete, RelationOptions, RelationSide, RelationType};

    fn relationship_collection() -> Collection {
        let mut collection = Collection::new("posts", "posts");
        let mut attr = Attribute::new("tags", AttributeType::Relationship, 0);
        attr.relation = Some(RelationOptions {
            related_collection: "tags".into(),
            relation_type: RelationType::ManyToMany,
            two_way: true,
            two_way_key: "posts".into(),
            on_delete: OnDelete::SetNull,
            side: RelationSide::Parent,
        });
        collection.attributes.push(attr);
        collection
    }

    #[test]
    fn merge_patch_overlays_values_and_keeps_id() {
        let mut base = Document::new();
        base.set_id("u1");
        base.set("name", Value::String("Ada".into()));
        let mut patch = Document::new();
        patch.set("name", Value::String("Grace".into()));
        let merged = merge_patch(&base, &patch);
        assert_eq!(merged.id(), Some("u1"));
        assert_eq!(merged.get("name"), Some(&Value::String("Grace".into())));
    }

    #[test]
    fn related_ids_reads_string_object_and_array() {
        let mut obj = serde_json::Map::new();
        obj.insert("$id".to_string(), Value::String("b".into()));
        assert_eq!(related_ids(&Value::String("a".into())), vec!["a".to_string()]);
        assert_eq!(related_ids(&Value::Object(obj)), vec!["b".to_string()]);
        assert_eq!(
            related_ids(&Value::Array(vec![Value::String("a".into()), Value::String("b".into())])),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn should_update_detects_relationship_set_change_not_reorder() {
        let collection = relationship_collection();
        let mut old = Document::new();
        old.set("tags", Value::Array(vec![Value::String("t1".into()), Value::String("t2".into())]));

        let mut unchanged = Document::new();
        unchanged.set("tags", Value::Array(vec![Value::String("t2".into()), Value::String("t1".into())]));
        assert!(!should_update(&collection, &old, &unchanged));

        let mut changed = Document::new();
        changed.set("tags", Value::Array(vec![Value::String("t3".into())]));
        assert!(should_update(&collection, &old, &changed));
    }

    #[test]
    fn apply_nested_selections_trims_materialized_subdocument() {
        let collection = relationship_collection();
        let plan = QueryPlan::build(&[Query::select(["title", "tags.name"])]);
        let mut doc = Document::new();
        let mut tag = serde_json::Map::new();
        tag.insert("$id".to_string(), Value::String("t1".into()));
        tag.insert("name".to_string(), Value::String("rust".into()));
        tag.insert("slug".to_string(), Value::String("rust-lang".into()));
        doc.set("tags", Value::Array(vec![Value::Object(tag)]));

        apply_nested_selections(&collection, &plan, &mut doc);
        let Value::Array(items) = doc.get("tags").unwrap() else { unreachable!() };
        let obj = items[0].as_object().unwrap();
        assert!(obj.contains_key("$id"));
        assert!(obj.contains_key("name"));
        assert!(!obj.contains_key("slug"));
    }

    #[test]
    fn apply_nested_selections_is_noop_without_selections() {
        let collection = relationship_collection();
        let plan = QueryPlan::default();
        let mut doc = Document::new();
        let mut tag = serde_json::Map::new();
        tag.insert("name".to_string(), Value::String("rust".into()));
        doc.set("tags", Value::Array(vec![Value::Object(tag)]));
        apply_nested_selections(&collection, &plan, &mut doc);
        let Value::Array(items) = doc.get("tags").unwrap() else { unreachable!() };
        assert!(items[0].as_object().unwrap().contains_key("name"));
    }
}
