//! Encoding/decoding/casting between the API's typed attribute values and
//! the adapter's stored row shape (§4.1 "Encoding"/"Decoding"/"Casting").

use serde_json::Value;

use crate::adapter::Adapter;
use crate::document::Document;
use crate::errors::{DbError, DbResult};
use crate::filters::FilterRegistry;
use crate::query::QueryPlan;
use crate::schema::attribute::{Attribute, AttributeType};

/// Skips null values with no default, substitutes the default for null
/// values that have one, wraps scalars into a singleton array for
/// iteration, runs each attribute's filters in declared order, then
/// unwraps non-array attributes back to a scalar.
pub fn encode_document(attributes: &[Attribute], filters: &FilterRegistry, doc: &Document) -> DbResult<Document> {
    let mut out = doc.clone();
    for attribute in attributes.iter().filter(|a| !a.is_relationship()) {
        let present = out.get(&attribute.key).cloned();
        let value = match present {
            None | Some(Value::Null) => match &attribute.default {
                Some(default) => default.clone(),
                None => continue,
            },
            Some(value) => value,
        };

        let items: Vec<Value> = if attribute.array {
            value.as_array().cloned().unwrap_or_else(|| vec![value.clone()])
        } else {
            vec![value]
        };

        let mut encoded = Vec::with_capacity(items.len());
        for item in items {
            let mut v = item;
            for filter_name in &attribute.filters {
                let filter = filters.get(filter_name).ok_or_else(|| DbError::database(format!("unknown filter `{filter_name}`")))?;
                v = (filter.encode)(&v, &out)?;
            }
            encoded.push(v);
        }

        let final_value = if attribute.array { Value::Array(encoded) } else { encoded.into_iter().next().unwrap_or(Value::Null) };
        out.set(attribute.key.clone(), final_value);
    }
    Ok(out)
}

/// Inverse of `encode_document`: parses stringified JSON back into an array
/// for array attributes, runs filters in reverse order, unwraps, and drops
/// any attribute not wanted by `plan`'s selections. Relationship attributes
/// are untouched — their values are replaced by the resolver, not filtered.
pub fn decode_document(attributes: &[Attribute], filters: &FilterRegistry, mut doc: Document, plan: &QueryPlan) -> DbResult<Document> {
    for attribute in attributes.iter().filter(|a| !a.is_relationship()) {
        if !plan.wants_attribute(&attribute.key) {
            doc.remove(&attribute.key);
            continue;
        }
        let Some(value) = doc.get(&attribute.key).cloned() else { continue };
        if value.is_null() {
            continue;
        }

        let items: Vec<Value> = if attribute.array {
            match &value {
                Value::Array(items) => items.clone(),
                Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| vec![value.clone()]),
                _ => vec![value.clone()],
            }
        } else {
            vec![value]
        };

        let mut decoded = Vec::with_capacity(items.len());
        for item in items {
            let mut v = item;
            for filter_name in attribute.filters.iter().rev() {
                let filter = filters.get(filter_name).ok_or_else(|| DbError::database(format!("unknown filter `{filter_name}`")))?;
                v = (filter.decode)(&v, &doc)?;
            }
            decoded.push(v);
        }

        let final_value = if attribute.array { Value::Array(decoded) } else { decoded.into_iter().next().unwrap_or(Value::Null) };
        doc.set(attribute.key.clone(), final_value);
    }
    Ok(doc)
}

fn cast_scalar(attribute_type: AttributeType, value: Value) -> Value {
    match (attribute_type, value) {
        (AttributeType::Boolean, Value::String(s)) => Value::Bool(s == "1" || s.eq_ignore_ascii_case("true")),
        (AttributeType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().is_some_and(|n| n != 0)),
        (AttributeType::Integer, Value::String(s)) => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        (AttributeType::Float, Value::String(s)) => s.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number).unwrap_or(Value::Null),
        (_, other) => other,
    }
}

/// Converts stored string/numeric forms to their declared type when the
/// adapter reports no native type casting (§4.1 "Casting").
pub fn cast_document(attributes: &[Attribute], adapter: &dyn Adapter, mut doc: Document) -> Document {
    if adapter.support_for_casting() {
        return doc;
    }
    for attribute in attributes.iter().filter(|a| !a.is_relationship()) {
        let Some(value) = doc.get(&attribute.key).cloned() else { continue };
        let cast = |v: Value| cast_scalar(attribute.attribute_type, v);
        let new_value = if attribute.array {
            match value {
                Value::String(raw) => Value::Array(serde_json::from_str::<Vec<Value>>(&raw).unwrap_or_default().into_iter().map(cast).collect()),
                Value::Array(items) => Value::Array(items.into_iter().map(cast).collect()),
                other => other,
            }
        } else {
            cast(value)
        };
        doc.set(attribute.key.clone(), new_value);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::attribute::AttributeType;
    use crate::test_support::MemoryAdapter;

    fn schema() -> Vec<Attribute> {
        vec![
            Attribute::new("name", AttributeType::String, 255).required(true),
            Attribute::new("age", AttributeType::Integer, 11).default_value(Value::from(0)),
            Attribute::new("tags", AttributeType::String, 64).array(true),
        ]
    }

    #[test]
    fn encode_substitutes_default_for_null() {
        let filters = FilterRegistry::new();
        let mut doc = Document::new();
        doc.set("name", Value::String("Ada".into()));
        let encoded = encode_document(&schema(), &filters, &doc).unwrap();
        assert_eq!(encoded.get("age"), Some(&Value::from(0)));
    }

    #[test]
    fn encode_wraps_and_decode_unwraps_array_attribute() {
        let filters = FilterRegistry::new();
        let mut doc = Document::new();
        doc.set("tags", Value::Array(vec![Value::String("a".into())]));
        let encoded = encode_document(&schema(), &filters, &doc).unwrap();
        assert_eq!(encoded.get("tags"), Some(&Value::Array(vec![Value::String("a".into())])));
        let decoded = decode_document(&schema(), &filters, encoded, &QueryPlan::default()).unwrap();
        assert_eq!(decoded.get("tags"), Some(&Value::Array(vec![Value::String("a".into())])));
    }

    #[test]
    fn decode_drops_unselected_attributes() {
        let filters = FilterRegistry::new();
        let mut doc = Document::new();
        doc.set("name", Value::String("Ada".into()));
        doc.set("age", Value::from(37));
        let plan = QueryPlan::build(&[crate::query::Query::select(["name"])]);
        let decoded = decode_document(&schema(), &filters, doc, &plan).unwrap();
        assert!(decoded.contains("name"));
        assert!(!decoded.contains("age"));
    }

    #[test]
    fn cast_document_is_noop_when_adapter_supports_casting() {
        let adapter = MemoryAdapter::default();
        let mut doc = Document::new();
        doc.set("age", Value::String("37".into()));
        let cast = cast_document(&schema(), &adapter, doc.clone());
        assert_eq!(cast, doc);
    }
}
