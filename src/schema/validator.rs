//! Structure validation: checks a document's attribute values against a
//! collection's declared `Attribute` list, plus the format registry used by
//! `format`/`formatOptions` (§3 Attribute, §4.2).

use std::collections::HashMap;
use std::sync::OnceLock;

use email_address::EmailAddress;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::document::Document;
use crate::errors::{ValidationError, ValidationIssue, ValidationResult};
use crate::schema::attribute::{Attribute, AttributeType};

pub fn is_valid_email(value: &str) -> bool {
    EmailAddress::is_valid(value)
}

pub fn is_valid_url(value: &str) -> bool {
    Url::parse(value).is_ok()
}

pub fn is_valid_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

type FormatCheck = fn(&str) -> bool;

static FORMAT_REGISTRY: OnceLock<HashMap<&'static str, FormatCheck>> = OnceLock::new();

fn format_registry() -> &'static HashMap<&'static str, FormatCheck> {
    FORMAT_REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, FormatCheck> = HashMap::new();
        map.insert("email", is_valid_email);
        map.insert("url", is_valid_url);
        map.insert("uuid", is_valid_uuid);
        map
    })
}

fn check_format(format: &str, value: &str) -> bool {
    format_registry().get(format).map(|check| check(value)).unwrap_or(true)
}

fn type_matches(attribute_type: AttributeType, value: &Value) -> bool {
    match attribute_type {
        AttributeType::String | AttributeType::Datetime => value.is_string(),
        AttributeType::Integer => value.is_i64() || value.is_u64(),
        AttributeType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
        AttributeType::Boolean => value.is_boolean(),
        AttributeType::Relationship => true,
    }
}

fn validate_scalar(attribute: &Attribute, value: &Value, issues: &mut Vec<ValidationIssue>) {
    if value.is_null() {
        return;
    }
    if !type_matches(attribute.attribute_type, value) {
        issues.push(ValidationIssue::new(
            attribute.key.clone(),
            "structure.type",
            format!("expected type matching {:?}", attribute.attribute_type),
        ));
        return;
    }
    match attribute.attribute_type {
        AttributeType::String => {
            if let Some(s) = value.as_str() {
                if s.chars().count() as u32 > attribute.size {
                    issues.push(ValidationIssue::new(
                        attribute.key.clone(),
                        "structure.size",
                        format!("string exceeds declared size {}", attribute.size),
                    ));
                }
                if let Some(format) = &attribute.format
                    && !check_format(format, s)
                {
                    issues.push(ValidationIssue::new(
                        attribute.key.clone(),
                        "structure.format",
                        format!("value does not match format `{format}`"),
                    ));
                }
            }
        }
        AttributeType::Integer => {
            let Some(n) = value.as_i64() else {
                return;
            };
            if !attribute.signed && n < 0 {
                issues.push(ValidationIssue::new(attribute.key.clone(), "structure.signed", "value must be non-negative"));
            }
        }
        _ => {}
    }
}

fn validate_attribute_value(attribute: &Attribute, value: &Value, issues: &mut Vec<ValidationIssue>) {
    if attribute.array {
        match value.as_array() {
            Some(items) => {
                for item in items {
                    validate_scalar(attribute, item, issues);
                }
            }
            None if value.is_null() => {}
            None => issues.push(ValidationIssue::new(attribute.key.clone(), "structure.type", "expected an array")),
        }
    } else {
        validate_scalar(attribute, value, issues);
    }
}

/// Validates every declared attribute against the document's values.
/// Relationship attributes are skipped — their shape is validated by the
/// relationship resolver (§4.3), not structure validation.
pub fn validate_document(attributes: &[Attribute], doc: &Document) -> ValidationResult<()> {
    let mut issues = Vec::new();
    for attribute in attributes {
        if attribute.is_relationship() {
            continue;
        }
        match doc.get(&attribute.key) {
            Some(value) => validate_attribute_value(attribute, value, &mut issues),
            None => {
                if attribute.required && attribute.default.is_none() {
                    issues.push(ValidationIssue::new(attribute.key.clone(), "structure.required", "attribute is required"));
                }
            }
        }
    }
    ValidationError::new(issues).into_result()
}

/// Same as `validate_document` but only checks attributes actually present
/// in `doc` — used by `updateDocuments`' "partial structure validation"
/// (§4.1).
pub fn validate_partial_document(attributes: &[Attribute], doc: &Document) -> ValidationResult<()> {
    let mut issues = Vec::new();
    for attribute in attributes {
        if attribute.is_relationship() {
            continue;
        }
        if let Some(value) = doc.get(&attribute.key) {
            validate_attribute_value(attribute, value, &mut issues);
        }
    }
    ValidationError::new(issues).into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> Vec<Attribute> {
        vec![
            Attribute::new("name", AttributeType::String, 255).required(true),
            Attribute::new("age", AttributeType::Integer, 11),
            Attribute::new("active", AttributeType::Boolean, 0),
        ]
    }

    #[test]
    fn missing_required_attribute_fails() {
        let mut doc = Document::new();
        doc.set("age", Value::from(5));
        let err = validate_document(&users_schema(), &doc).unwrap_err();
        assert!(err.issues.iter().any(|i| i.field == "name"));
    }

    #[test]
    fn well_formed_document_passes() {
        let mut doc = Document::new();
        doc.set("name", Value::String("Ada".into()));
        doc.set("age", Value::from(37));
        doc.set("active", Value::Bool(true));
        validate_document(&users_schema(), &doc).unwrap();
    }

    #[test]
    fn string_over_declared_size_fails() {
        let attrs = vec![Attribute::new("bio", AttributeType::String, 4)];
        let mut doc = Document::new();
        doc.set("bio", Value::String("too long for four".into()));
        let err = validate_document(&attrs, &doc).unwrap_err();
        assert_eq!(err.issues[0].code, "structure.size");
    }

    #[test]
    fn email_format_is_checked() {
        let attrs = vec![Attribute::new("email", AttributeType::String, 255).format("email")];
        let mut doc = Document::new();
        doc.set("email", Value::String("not-an-email".into()));
        let err = validate_document(&attrs, &doc).unwrap_err();
        assert_eq!(err.issues[0].code, "structure.format");
    }

    #[test]
    fn partial_validation_ignores_absent_attributes() {
        let mut doc = Document::new();
        doc.set("age", Value::from(5));
        validate_partial_document(&users_schema(), &doc).unwrap();
    }
}
