//! The event bus: ordered listener registration, wildcard/name-scoped
//! dispatch, and the scoped "silent" suppression mechanism (§4.6 "Event
//! system").

use std::collections::HashSet;
use std::sync::Mutex;

use serde_json::Value;

/// Canonical event names emitted by `Database` (§4.6).
pub mod names {
    pub const DATABASE_CREATE: &str = "database.create";
    pub const DATABASE_DELETE: &str = "database.delete";

    pub const COLLECTION_CREATE: &str = "collection.create";
    pub const COLLECTION_READ: &str = "collection.read";
    pub const COLLECTION_UPDATE: &str = "collection.update";
    pub const COLLECTION_DELETE: &str = "collection.delete";
    pub const COLLECTION_LIST: &str = "collection.list";

    pub const ATTRIBUTE_CREATE: &str = "attribute.create";
    pub const ATTRIBUTE_UPDATE: &str = "attribute.update";
    pub const ATTRIBUTE_DELETE: &str = "attribute.delete";

    pub const INDEX_CREATE: &str = "index.create";
    pub const INDEX_DELETE: &str = "index.delete";
    pub const INDEX_RENAME: &str = "index.rename";

    pub const DOCUMENT_CREATE: &str = "document.create";
    pub const DOCUMENT_READ: &str = "document.read";
    pub const DOCUMENT_UPDATE: &str = "document.update";
    pub const DOCUMENT_DELETE: &str = "document.delete";
    pub const DOCUMENT_FIND: &str = "document.find";
    pub const DOCUMENT_COUNT: &str = "document.count";
    pub const DOCUMENT_SUM: &str = "document.sum";
    pub const DOCUMENT_INCREASE: &str = "document.increase";
    pub const DOCUMENT_DECREASE: &str = "document.decrease";
    pub const DOCUMENT_PURGE: &str = "document.purge";

    pub const DOCUMENTS_CREATE: &str = "documents.create";
    pub const DOCUMENTS_UPDATE: &str = "documents.update";
    pub const DOCUMENTS_DELETE: &str = "documents.delete";
}

/// Payload for the batch document events (`documents.create/update/delete`),
/// reporting how many rows were touched rather than each one individually.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEventPayload {
    pub modified: usize,
    pub collection_id: String,
}

/// One emitted event: a name plus an arbitrary JSON payload (a `Document`,
/// `Collection`, or `BatchEventPayload` serialized by the caller).
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Ordered listener registry plus a suppression set. Listeners run in
/// registration order; a listener registered with `on_any` (filter `None`)
/// fires for every event, one registered with `on(name, ...)` only for that
/// name.
///
/// `silent`: `None` suppresses every event, `Some(empty set)` suppresses
/// none, `Some(nonempty set)` suppresses exactly the named events — the
/// three states a caller can reach via `silent(None)` / `silent(Some([]))`
/// / `silent(Some(names))` respectively.
pub struct EventBus {
    listeners: Mutex<Vec<(Option<String>, Listener)>>,
    silent: Mutex<Option<HashSet<String>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self { listeners: Mutex::new(Vec::new()), silent: Mutex::new(Some(HashSet::new())) }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener that only runs for events named `name`.
    pub fn on(&self, name: impl Into<String>, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners.lock().expect("event listener lock poisoned").push((Some(name.into()), Box::new(listener)));
    }

    /// Registers a listener that runs for every emitted event.
    pub fn on_any(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners.lock().expect("event listener lock poisoned").push((None, Box::new(listener)));
    }

    /// Dispatches `name`/`payload` to every matching, non-suppressed
    /// listener in registration order. A no-op if `name` is currently
    /// silenced.
    pub fn emit(&self, name: impl Into<String>, payload: Value) {
        let name = name.into();
        let suppressed = match &*self.silent.lock().expect("silent set lock poisoned") {
            None => true,
            Some(names) => names.contains(&name),
        };
        if suppressed {
            return;
        }
        let event = Event { name: name.clone(), payload };
        for (filter, listener) in self.listeners.lock().expect("event listener lock poisoned").iter() {
            if filter.as_deref().map(|f| f == name).unwrap_or(true) {
                listener(&event);
            }
        }
    }

    /// Replaces the suppression set, returning the previous one so a
    /// `SilentGuard` can restore it.
    fn set_silent(&self, silent: Option<HashSet<String>>) -> Option<HashSet<String>> {
        std::mem::replace(&mut self.silent.lock().expect("silent set lock poisoned"), silent)
    }

    /// Scopes a suppression override to the returned guard's lifetime.
    /// `names = None` suppresses everything, `Some(&[])` suppresses
    /// nothing, `Some(names)` suppresses exactly those.
    pub fn silence(&self, names: Option<&[&str]>) -> SilentGuard<'_> {
        let silent = names.map(|names| names.iter().map(|n| n.to_string()).collect());
        let previous = self.set_silent(silent);
        SilentGuard { bus: self, previous: Some(previous) }
    }
}

/// Restores the prior suppression set when dropped.
pub struct SilentGuard<'a> {
    bus: &'a EventBus,
    previous: Option<Option<HashSet<String>>>,
}

impl Drop for SilentGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.bus.set_silent(previous);
        }
    }
}
