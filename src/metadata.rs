//! The metadata catalog: the self-describing collection `_metadata` whose
//! documents describe every user collection (§3 Collection, §4.2).

use serde_json::{json, Value};

use crate::errors::DbError;
use crate::document::Document;
use crate::query::SortOrder as QuerySortOrder;
use crate::schema::attribute::{Attribute, AttributeType, OnDelete, RelationOptions, RelationSide, RelationType};
use crate::schema::index::{Index, IndexType};

/// Well-known id of the catalog collection.
pub const METADATA_COLLECTION_ID: &str = "_metadata";

/// `{name, attributes[Attribute], indexes[Index], documentSecurity: bool,
/// $permissions, $tenant?}` (§3 Collection).
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub internal_id: Option<String>,
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub indexes: Vec<Index>,
    pub document_security: bool,
    pub permissions: Vec<String>,
    pub tenant: Option<i64>,
}

impl Collection {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: id.clone(),
            internal_id: None,
            name: name.into(),
            attributes: Vec::new(),
            indexes: Vec::new(),
            document_security: false,
            permissions: Vec::new(),
            tenant: None,
        }
    }

    pub fn find_attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.key.eq_ignore_ascii_case(key))
    }

    pub fn find_attribute_mut(&mut self, key: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.key.eq_ignore_ascii_case(key))
    }

    pub fn find_index(&self, id: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.id == id)
    }

    pub fn relationship_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.is_relationship())
    }

    /// Bootstraps the well-known, self-describing descriptor for
    /// `_metadata` itself (§3 "`_metadata` itself is bootstrapped and has a
    /// well-known static descriptor").
    pub fn bootstrap_metadata_descriptor() -> Collection {
        let mut collection = Collection::new(METADATA_COLLECTION_ID, METADATA_COLLECTION_ID);
        collection.attributes = vec![
            Attribute::new("name", AttributeType::String, 256).required(true),
            Attribute::new("attributes", AttributeType::String, 1_000_000).filter("json"),
            Attribute::new("indexes", AttributeType::String, 1_000_000).filter("json"),
            Attribute::new("documentSecurity", AttributeType::Boolean, 0).required(true),
        ];
        collection.indexes = vec![Index::single_unique("name")];
        collection
    }
}

fn attribute_to_json(attribute: &Attribute) -> Value {
    let relation = attribute.relation.as_ref().map(|r| {
        json!({
            "relatedCollection": r.related_collection,
            "relationType": relation_type_str(r.relation_type),
            "twoWay": r.two_way,
            "twoWayKey": r.two_way_key,
            "onDelete": on_delete_str(r.on_delete),
            "side": side_str(r.side),
        })
    });
    json!({
        "$id": attribute.id,
        "key": attribute.key,
        "type": attribute_type_str(attribute.attribute_type),
        "size": attribute.size,
        "required": attribute.required,
        "default": attribute.default,
        "signed": attribute.signed,
        "array": attribute.array,
        "format": attribute.format,
        "formatOptions": attribute.format_options,
        "filters": attribute.filters,
        "options": relation,
    })
}

fn attribute_type_str(t: AttributeType) -> &'static str {
    match t {
        AttributeType::String => "string",
        AttributeType::Integer => "integer",
        AttributeType::Float => "float",
        AttributeType::Boolean => "boolean",
        AttributeType::Datetime => "datetime",
        AttributeType::Relationship => "relationship",
    }
}

fn parse_attribute_type(raw: &str) -> Result<AttributeType, DbError> {
    match raw {
        "string" => Ok(AttributeType::String),
        "integer" => Ok(AttributeType::Integer),
        "float" => Ok(AttributeType::Float),
        "boolean" => Ok(AttributeType::Boolean),
        "datetime" => Ok(AttributeType::Datetime),
        "relationship" => Ok(AttributeType::Relationship),
        other => Err(DbError::database(format!("unknown attribute type `{other}`"))),
    }
}

fn relation_type_str(t: RelationType) -> &'static str {
    match t {
        RelationType::OneToOne => "oneToOne",
        RelationType::OneToMany => "oneToMany",
        RelationType::ManyToOne => "manyToOne",
        RelationType::ManyToMany => "manyToMany",
    }
}

pub fn parse_relation_type(raw: &str) -> Result<RelationType, DbError> {
    match raw {
        "oneToOne" => Ok(RelationType::OneToOne),
        "oneToMany" => Ok(RelationType::OneToMany),
        "manyToOne" => Ok(RelationType::ManyToOne),
        "manyToMany" => Ok(RelationType::ManyToMany),
        other => Err(DbError::database(format!("unknown relation type `{other}`"))),
    }
}

fn on_delete_str(o: OnDelete) -> &'static str {
    match o {
        OnDelete::Restrict => "restrict",
        OnDelete::SetNull => "setNull",
        OnDelete::Cascade => "cascade",
    }
}

pub fn parse_on_delete(raw: &str) -> Result<OnDelete, DbError> {
    match raw {
        "restrict" => Ok(OnDelete::Restrict),
        "setNull" => Ok(OnDelete::SetNull),
        "cascade" => Ok(OnDelete::Cascade),
        other => Err(DbError::database(format!("unknown onDelete policy `{other}`"))),
    }
}

fn side_str(s: RelationSide) -> &'static str {
    match s {
        RelationSide::Parent => "parent",
        RelationSide::Child => "child",
    }
}

pub fn parse_side(raw: &str) -> Result<RelationSide, DbError> {
    match raw {
        "parent" => Ok(RelationSide::Parent),
        "child" => Ok(RelationSide::Child),
        other => Err(DbError::database(format!("unknown relation side `{other}`"))),
    }
}

fn json_to_attribute(value: &Value) -> Result<Attribute, DbError> {
    let obj = value.as_object().ok_or_else(|| DbError::database("attribute entry is not an object"))?;
    let key = obj.get("key").and_then(Value::as_str).ok_or_else(|| DbError::database("attribute missing key"))?;
    let attribute_type = parse_attribute_type(obj.get("type").and_then(Value::as_str).unwrap_or("string"))?;
    let mut attribute = Attribute::new(key, attribute_type, obj.get("size").and_then(Value::as_u64).unwrap_or(0) as u32);
    attribute.id = obj.get("$id").and_then(Value::as_str).unwrap_or(key).to_string();
    attribute.required = obj.get("required").and_then(Value::as_bool).unwrap_or(false);
    attribute.default = obj.get("default").cloned().filter(|v| !v.is_null());
    attribute.signed = obj.get("signed").and_then(Value::as_bool).unwrap_or(true);
    attribute.array = obj.get("array").and_then(Value::as_bool).unwrap_or(false);
    attribute.format = obj.get("format").and_then(Value::as_str).map(str::to_string);
    attribute.format_options = obj.get("formatOptions").cloned().filter(|v| !v.is_null());
    attribute.filters = obj
        .get("filters")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    if let Some(options) = obj.get("options").filter(|v| !v.is_null()) {
        attribute.relation = Some(RelationOptions {
            related_collection: options.get("relatedCollection").and_then(Value::as_str).unwrap_or_default().to_string(),
            relation_type: parse_relation_type(options.get("relationType").and_then(Value::as_str).unwrap_or("oneToOne"))?,
            two_way: options.get("twoWay").and_then(Value::as_bool).unwrap_or(false),
            two_way_key: options.get("twoWayKey").and_then(Value::as_str).unwrap_or_default().to_string(),
            on_delete: parse_on_delete(options.get("onDelete").and_then(Value::as_str).unwrap_or("restrict"))?,
            side: parse_side(options.get("side").and_then(Value::as_str).unwrap_or("parent"))?,
        });
    }
    Ok(attribute)
}

fn index_to_json(index: &Index) -> Value {
    let order_str = |o: &Option<QuerySortOrder>| o.map(|order| order.as_str());
    json!({
        "$id": index.id,
        "key": index.key,
        "type": index_type_str(index.index_type),
        "attributes": index.attributes,
        "lengths": index.lengths,
        "orders": index.orders.iter().map(order_str).collect::<Vec<_>>(),
    })
}

fn index_type_str(t: IndexType) -> &'static str {
    match t {
        IndexType::Key => "key",
        IndexType::Unique => "unique",
        IndexType::Fulltext => "fulltext",
    }
}

fn json_to_index(value: &Value) -> Result<Index, DbError> {
    let obj = value.as_object().ok_or_else(|| DbError::database("index entry is not an object"))?;
    let key = obj.get("key").and_then(Value::as_str).ok_or_else(|| DbError::database("index missing key"))?;
    let index_type = match obj.get("type").and_then(Value::as_str).unwrap_or("key") {
        "unique" => IndexType::Unique,
        "fulltext" => IndexType::Fulltext,
        _ => IndexType::Key,
    };
    let attributes = obj
        .get("attributes")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let mut index = Index::new(key, index_type, attributes);
    index.id = obj.get("$id").and_then(Value::as_str).unwrap_or(key).to_string();
    if let Some(lengths) = obj.get("lengths").and_then(Value::as_array) {
        index.lengths = lengths.iter().map(|v| v.as_u64().map(|n| n as u32)).collect();
    }
    if let Some(orders) = obj.get("orders").and_then(Value::as_array) {
        index.orders = orders
            .iter()
            .map(|v| match v.as_str() {
                Some("DESC") => Some(QuerySortOrder::Desc),
                Some("ASC") => Some(QuerySortOrder::Asc),
                _ => None,
            })
            .collect();
    }
    Ok(index)
}

/// Encodes a `Collection` as the `Document` stored under `_metadata`.
pub fn collection_to_document(collection: &Collection) -> Document {
    let mut doc = Document::new();
    doc.set_id(collection.id.clone());
    doc.set_collection(METADATA_COLLECTION_ID);
    if let Some(internal_id) = &collection.internal_id {
        doc.set_internal_id(internal_id.clone());
    }
    doc.set("name", Value::String(collection.name.clone()));
    doc.set("attributes", Value::Array(collection.attributes.iter().map(attribute_to_json).collect()));
    doc.set("indexes", Value::Array(collection.indexes.iter().map(index_to_json).collect()));
    doc.set("documentSecurity", Value::Bool(collection.document_security));
    doc.set_permissions(collection.permissions.clone());
    doc.set_tenant(collection.tenant);
    doc
}

/// Decodes a `_metadata` row back into a `Collection`.
pub fn document_to_collection(doc: &Document) -> Result<Collection, DbError> {
    let id = doc.id().ok_or_else(|| DbError::database("metadata row missing $id"))?.to_string();
    let name = doc.get("name").and_then(Value::as_str).unwrap_or(&id).to_string();
    let attributes = doc
        .get("attributes")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(json_to_attribute).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();
    let indexes = doc
        .get("indexes")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(json_to_index).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();
    Ok(Collection {
        id,
        internal_id: doc.internal_id().map(str::to_string),
        name,
        attributes,
        indexes,
        document_security: doc.get("documentSecurity").and_then(Value::as_bool).unwrap_or(false),
        permissions: doc.permissions().iter().cloned().collect(),
        tenant: doc.tenant(),
    })
}
