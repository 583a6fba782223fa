//! The filter registry: a process-wide mapping `name -> {encode, decode}`
//! plus a per-`Database` overlay that wins over the global entry (§9).
//!
//! Filters are pure over `(value, document)` — they may themselves need to
//! call back into the engine (e.g. to resolve a reference), so closures are
//! `Fn`, not `FnMut`, and are safe to invoke re-entrantly.

pub mod builtin;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;

use crate::document::Document;
use crate::errors::DbError;

/// A filter's encode or decode half: given the raw attribute value and the
/// document it belongs to, produce the transformed value.
pub type FilterFn = dyn Fn(&Value, &Document) -> Result<Value, DbError> + Send + Sync;

#[derive(Clone)]
pub struct Filter {
    pub encode: Arc<FilterFn>,
    pub decode: Arc<FilterFn>,
}

impl Filter {
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&Value, &Document) -> Result<Value, DbError> + Send + Sync + 'static,
        D: Fn(&Value, &Document) -> Result<Value, DbError> + Send + Sync + 'static,
    {
        Self { encode: Arc::new(encode), decode: Arc::new(decode) }
    }
}

static GLOBAL_FILTERS: OnceLock<RwLock<HashMap<String, Filter>>> = OnceLock::new();

fn global_registry() -> &'static RwLock<HashMap<String, Filter>> {
    GLOBAL_FILTERS.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert("datetime".to_string(), builtin::datetime_filter());
        map.insert("json".to_string(), builtin::json_filter());
        RwLock::new(map)
    })
}

/// Registers (or replaces) a process-wide filter, available to every
/// `Database` instance unless shadowed by a per-instance overlay.
pub fn register_global_filter(name: impl Into<String>, filter: Filter) {
    global_registry().write().unwrap().insert(name.into(), filter);
}

/// Per-`Database` filter overlay. Looking up a name checks the instance
/// overlay first, falling back to the global registry.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    instance: HashMap<String, Filter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, filter: Filter) {
        self.instance.insert(name.into(), filter);
    }

    pub fn get(&self, name: &str) -> Option<Filter> {
        self.instance.get(name).cloned().or_else(|| global_registry().read().unwrap().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_overlay_wins_over_global() {
        let mut registry = FilterRegistry::new();
        registry.register(
            "datetime",
            Filter::new(
                |value, _doc| Ok(value.clone()),
                |value, _doc| Ok(value.clone()),
            ),
        );
        let doc = Document::new();
        let value = Value::String("unchanged".to_string());
        let filter = registry.get("datetime").unwrap();
        assert_eq!((filter.encode)(&value, &doc).unwrap(), value);
    }

    #[test]
    fn unregistered_name_falls_through_to_global() {
        let registry = FilterRegistry::new();
        assert!(registry.get("datetime").is_some());
        assert!(registry.get("no-such-filter").is_none());
    }
}
