//! The permission model: roles, actions, and the authorization check that
//! intersects a caller's roles against a collection's (and, when
//! `documentSecurity` is on, a document's) permission list.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::DbError;

/// One of the five actions a permission string can grant. `Write` is a
/// convenience alias that implies `update`, `delete`, and `create` when
/// checked (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Write,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Write => "write",
        }
    }

    fn parse(raw: &str) -> Result<Self, DbError> {
        match raw {
            "create" => Ok(Action::Create),
            "read" => Ok(Action::Read),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "write" => Ok(Action::Write),
            other => Err(DbError::query(format!("unknown permission action `{other}`"))),
        }
    }
}

/// A permission is an `(action, role)` tuple, serialized as `action("role")`.
/// Roles are opaque strings: `any`, `guest`, `users`, `user:<id>`,
/// `team:<id>`, `member:<id>`, `label:<str>`, …
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    pub action: Action,
    pub role: String,
}

pub const ROLE_ANY: &str = "any";

impl Permission {
    pub fn new(action: Action, role: impl Into<String>) -> Self {
        Self { action, role: role.into() }
    }

    pub fn read(role: impl Into<String>) -> Self {
        Self::new(Action::Read, role)
    }

    pub fn create(role: impl Into<String>) -> Self {
        Self::new(Action::Create, role)
    }

    pub fn update(role: impl Into<String>) -> Self {
        Self::new(Action::Update, role)
    }

    pub fn delete(role: impl Into<String>) -> Self {
        Self::new(Action::Delete, role)
    }

    pub fn write(role: impl Into<String>) -> Self {
        Self::new(Action::Write, role)
    }

    /// Parses `action("role")` as produced by `Display`.
    pub fn parse(raw: &str) -> Result<Self, DbError> {
        let open = raw.find('(').ok_or_else(|| DbError::query(format!("malformed permission `{raw}`")))?;
        let action = Action::parse(&raw[..open])?;
        let rest = raw[open + 1..].trim_end_matches(')');
        let role = rest.trim_matches('"').to_string();
        Ok(Self { action, role })
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(\"{}\")", self.action.as_str(), self.role)
    }
}

/// Expands `write` into `{create, update, delete}` and returns the concrete
/// actions a permission string actually grants.
fn actions_granted(action: Action) -> &'static [Action] {
    match action {
        Action::Write => &[Action::Create, Action::Update, Action::Delete],
        other => match other {
            Action::Create => &[Action::Create],
            Action::Read => &[Action::Read],
            Action::Update => &[Action::Update],
            Action::Delete => &[Action::Delete],
            Action::Write => unreachable!(),
        },
    }
}

/// Returns true iff any of `caller_roles` is granted `action` by any
/// permission string in `permissions`. `any` always matches.
fn roles_grant(permissions: &[String], caller_roles: &[String], action: Action) -> bool {
    let caller: HashSet<&str> = caller_roles.iter().map(String::as_str).collect();
    permissions.iter().filter_map(|raw| Permission::parse(raw).ok()).any(|perm| {
        actions_granted(perm.action).contains(&action) && (perm.role == ROLE_ANY || caller.contains(perm.role.as_str()))
    })
}

/// Authorizes `action` for `caller_roles` against a collection's permission
/// list and, when `document_security` is true, the document's own list
/// (ANDed together per §4.5 / GLOSSARY "Document security").
pub fn authorize(
    collection_permissions: &[String],
    document_permissions: Option<&[String]>,
    document_security: bool,
    caller_roles: &[String],
    action: Action,
) -> Result<(), DbError> {
    let collection_ok = roles_grant(collection_permissions, caller_roles, action);
    let ok = if document_security {
        match document_permissions {
            Some(doc_perms) => collection_ok || roles_grant(doc_perms, caller_roles, action),
            None => collection_ok,
        }
    } else {
        collection_ok
    };

    if ok {
        Ok(())
    } else {
        Err(DbError::authorization(format!(
            "caller lacks `{}` permission",
            action.as_str()
        )))
    }
}

/// Authorizes `action` unless `skip` is currently set, in which case the
/// call passes unconditionally. Backs the scoped `skip(callback)` bypass
/// used by internal relationship traversal and cache warm-up (§4.5).
#[allow(clippy::too_many_arguments)]
pub fn authorize_unless_skipped(
    skip: &AtomicBool,
    collection_permissions: &[String],
    document_permissions: Option<&[String]>,
    document_security: bool,
    caller_roles: &[String],
    action: Action,
) -> Result<(), DbError> {
    if skip.load(Ordering::SeqCst) {
        return Ok(());
    }
    authorize(collection_permissions, document_permissions, document_security, caller_roles, action)
}

/// Scoped, re-entrant-safe toggle for `skip`: sets it true on construction
/// and restores the prior value on drop, so nested guards (e.g. a
/// relationship populate triggered from inside another skipped call) never
/// clear a flag an outer guard is still relying on.
pub struct SkipGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> SkipGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Self {
        let previous = flag.swap(true, Ordering::SeqCst);
        Self { flag, previous }
    }
}

impl Drop for SkipGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}
