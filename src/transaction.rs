//! Transaction wrapping and the optimistic-concurrency fence (§5 "Concurrency
//! & resource model", §4.1 "updateDocument" conflict check).

use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::adapter::Adapter;
use crate::errors::{DbError, DbResult};

/// Runs `fut` inside an adapter-level transaction: starts it, commits on
/// `Ok`, rolls back on `Err`. `fut` is a future value (typically an inline
/// `async { ... }` block) rather than a closure factory, so the caller's
/// locals are borrowed for exactly the duration of the await with no move
/// semantics to fight.
pub async fn with_transaction<T>(adapter: &dyn Adapter, fut: impl Future<Output = DbResult<T>>) -> DbResult<T> {
    adapter.start_transaction().await?;
    match fut.await {
        Ok(value) => {
            adapter.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = adapter.rollback().await;
            Err(err)
        }
    }
}

/// Rejects an update/delete whose caller-supplied `fence` timestamp is older
/// than the row's persisted `$updatedAt` — someone else wrote the document
/// first (§3 invariant 8, GLOSSARY "Optimistic concurrency").
pub fn check_conflict(fence: Option<DateTime<Utc>>, persisted_updated_at: Option<DateTime<Utc>>) -> DbResult<()> {
    match (fence, persisted_updated_at) {
        (Some(fence), Some(persisted)) if persisted > fence => Err(DbError::Conflict),
        _ => Ok(()),
    }
}

/// Scoped override of the ambient request timestamp used as the conflict
/// fence for nested operations (e.g. relationship writes triggered by an
/// outer `updateDocument`); restores the previous value on drop.
pub struct RequestTimestampGuard<'a> {
    target: &'a Mutex<Option<DateTime<Utc>>>,
    previous: Option<DateTime<Utc>>,
}

impl<'a> RequestTimestampGuard<'a> {
    pub fn new(target: &'a Mutex<Option<DateTime<Utc>>>, value: Option<DateTime<Utc>>) -> Self {
        let previous = {
            let mut guard = target.lock().expect("request timestamp mutex poisoned");
            std::mem::replace(&mut *guard, value)
        };
        Self { target, previous }
    }
}

impl Drop for RequestTimestampGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.target.lock().expect("request timestamp mutex poisoned");
        *guard = self.previous;
    }
}
