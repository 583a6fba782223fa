use std::borrow::Cow;

use thiserror::Error;

/// Top-level error type returned by every engine operation.
///
/// Each variant corresponds to exactly one semantic error kind from the
/// engine's error taxonomy; callers are expected to match on these rather
/// than on message text.
#[derive(Debug, Error)]
pub enum DbError {
    /// Collection, attribute, index, or related document missing where required.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Attribute/index/collection/document `$id` collision, or a `oneToOne`
    /// relationship's uniqueness invariant was violated.
    #[error("duplicate: {what}")]
    Duplicate { what: String },

    /// Attribute count, index count, row width, string/int size, or
    /// document-size limit exceeded.
    #[error("limit exceeded: {what}")]
    Limit { what: String },

    /// Payload failed schema/format validation.
    #[error("structure validation failed")]
    Structure(#[from] ValidationError),

    /// Query object referenced an unknown attribute, bad types, or an
    /// out-of-range value.
    #[error("invalid query: {what}")]
    Query { what: String },

    /// Caller lacks the required action on the collection (and document,
    /// when `documentSecurity` is enabled).
    #[error("not authorized: {what}")]
    Authorization { what: String },

    /// `onDelete = restrict` and related rows still exist.
    #[error("restricted: {what}")]
    Restricted { what: String },

    /// Malformed relationship value: wrong side, wrong arity, wrong kind.
    #[error("relationship error: {what}")]
    Relationship { what: String },

    /// Optimistic concurrency fence violated: the persisted `$updatedAt` is
    /// newer than the caller-supplied request timestamp.
    #[error("conflict: document was modified concurrently")]
    Conflict,

    /// Adapter failure or internal invariant violation.
    #[error("database error: {message}")]
    Database { message: Cow<'static, str> },
}

impl DbError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn duplicate(what: impl Into<String>) -> Self {
        Self::Duplicate { what: what.into() }
    }

    pub fn limit(what: impl Into<String>) -> Self {
        Self::Limit { what: what.into() }
    }

    pub fn query(what: impl Into<String>) -> Self {
        Self::Query { what: what.into() }
    }

    pub fn authorization(what: impl Into<String>) -> Self {
        Self::Authorization { what: what.into() }
    }

    pub fn restricted(what: impl Into<String>) -> Self {
        Self::Restricted { what: what.into() }
    }

    pub fn relationship(what: impl Into<String>) -> Self {
        Self::Relationship { what: what.into() }
    }

    pub fn database(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Convenience constructor for a single-field `Structure` error, used by
    /// schema managers that reject a single bad field rather than running
    /// full document validation.
    pub fn structure_issue(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Structure(ValidationError::single(field, code, message))
    }
}

/// Collection of validation issues encountered while preparing a document
/// mutation. Carries every failed attribute at once rather than stopping at
/// the first.
#[derive(Debug, Error, Clone)]
#[error("validation errors: {issues:?}")]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new<I>(issues: I) -> Self
    where
        I: IntoIterator<Item = ValidationIssue>,
    {
        Self { issues: issues.into_iter().collect() }
    }

    /// Convenience helper for constructing a single-field validation error.
    pub fn single(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new([ValidationIssue::new(field, code, message)])
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Returns `Ok(())` if no issues were collected, else the error.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

/// Detailed validation failure for a single field or logical path.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), code: code.into(), message: message.into() }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;
pub type DbResult<T> = Result<T, DbError>;
