//! The Attribute type and the relationship-options payload a relationship
//! attribute carries (§3 Attribute, §3 Relationship options).

use serde_json::Value;

/// The declared type of an attribute. `Relationship` attributes carry
/// `options` (see `RelationOptions`) and are never passed through the
/// filter pipeline (§4.1 "Decoding").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
    Relationship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationSide {
    Parent,
    Child,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Restrict,
    SetNull,
    Cascade,
}

/// Relationship-specific payload, populated only when `attribute.type ==
/// Relationship` (§3 "Relationship options").
#[derive(Debug, Clone)]
pub struct RelationOptions {
    pub related_collection: String,
    pub relation_type: RelationType,
    pub two_way: bool,
    pub two_way_key: String,
    pub on_delete: OnDelete,
    pub side: RelationSide,
}

/// `{$id, key, type, size, required, default, signed, array, format,
/// formatOptions, filters[], options{}}` (§3 Attribute).
#[derive(Debug, Clone)]
pub struct Attribute {
    pub id: String,
    pub key: String,
    pub attribute_type: AttributeType,
    pub size: u32,
    pub required: bool,
    pub default: Option<Value>,
    pub signed: bool,
    pub array: bool,
    pub format: Option<String>,
    pub format_options: Option<Value>,
    pub filters: Vec<String>,
    pub relation: Option<RelationOptions>,
}

impl Attribute {
    pub fn new(key: impl Into<String>, attribute_type: AttributeType, size: u32) -> Self {
        let key = key.into();
        Self {
            id: key.clone(),
            key,
            attribute_type,
            size,
            required: false,
            default: None,
            signed: true,
            array: false,
            format: None,
            format_options: None,
            filters: Vec::new(),
            relation: None,
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn default_value(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn array(mut self, array: bool) -> Self {
        self.array = array;
        self
    }

    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filters.push(name.into());
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn is_relationship(&self) -> bool {
        self.attribute_type == AttributeType::Relationship
    }

    /// `datetime` attributes must carry the `datetime` filter (§3 invariant).
    pub fn requires_datetime_filter(&self) -> bool {
        self.attribute_type == AttributeType::Datetime
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.iter().any(|f| f == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_id_to_key() {
        let attr = Attribute::new("name", AttributeType::String, 255);
        assert_eq!(attr.id, "name");
        assert!(!attr.required);
        assert!(!attr.array);
    }

    #[test]
    fn datetime_requires_filter() {
        let attr = Attribute::new("created_at", AttributeType::Datetime, 0);
        assert!(attr.requires_datetime_filter());
        assert!(!attr.has_filter("datetime"));
        let attr = attr.filter("datetime");
        assert!(attr.has_filter("datetime"));
    }
}
