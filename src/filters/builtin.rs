//! Built-in codec pairs available to every `Database` instance.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::document::Document;
use crate::errors::DbError;
use crate::filters::Filter;

/// In-database datetime representation: `YYYY-MM-DD HH:mm:ss.SSS` UTC.
const DB_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Encodes ISO 8601 (with timezone) to the DB's fixed UTC format and decodes
/// the reverse, per §6 "Datetime formats". Required on every `datetime`
/// attribute (§3 Attribute).
pub fn datetime_filter() -> Filter {
    Filter::new(
        |value: &Value, _doc: &Document| -> Result<Value, DbError> {
            match value {
                Value::Null => Ok(Value::Null),
                Value::String(iso) => {
                    let parsed = DateTime::parse_from_rfc3339(iso)
                        .map_err(|err| DbError::query(format!("invalid datetime `{iso}`: {err}")))?;
                    let utc = parsed.with_timezone(&Utc);
                    Ok(Value::String(utc.format(DB_DATETIME_FORMAT).to_string()))
                }
                other => Err(DbError::query(format!("datetime filter expects a string, got {other}"))),
            }
        },
        |value: &Value, _doc: &Document| -> Result<Value, DbError> {
            match value {
                Value::Null => Ok(Value::Null),
                Value::String(db_repr) => {
                    let naive = NaiveDateTime::parse_from_str(db_repr, DB_DATETIME_FORMAT)
                        .map_err(|err| DbError::database(format!("corrupt stored datetime `{db_repr}`: {err}")))?;
                    let utc = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
                    Ok(Value::String(utc.to_rfc3339()))
                }
                other => Err(DbError::database(format!("datetime filter expects a string, got {other}"))),
            }
        },
    )
}

/// Serializes a nested object/array to a JSON string for storage in a
/// scalar adapter column, and parses it back on read.
pub fn json_filter() -> Filter {
    Filter::new(
        |value: &Value, _doc: &Document| -> Result<Value, DbError> {
            match value {
                Value::Null => Ok(Value::Null),
                other => Ok(Value::String(
                    serde_json::to_string(other).map_err(|err| DbError::database(format!("json encode failed: {err}")))?,
                )),
            }
        },
        |value: &Value, _doc: &Document| -> Result<Value, DbError> {
            match value {
                Value::Null => Ok(Value::Null),
                Value::String(raw) => serde_json::from_str(raw)
                    .map_err(|err| DbError::database(format!("corrupt stored json `{raw}`: {err}"))),
                other => Ok(other.clone()),
            }
        },
    )
}
