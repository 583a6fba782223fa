//! A schema-aware document database engine layered over a pluggable SQL
//! adapter (§1 "Purpose & scope").
//!
//! [`Database`] is the single entry point: it owns the metadata catalog,
//! dispatches to the schema managers (`schema::attribute_manager`,
//! `schema::index_manager`, `relationship::manager`) for DDL, and to the
//! relationship resolver (`relationship::resolver`) and encode/decode engine
//! (`engine`) for document reads and writes. Storage and caching are
//! abstract — see [`adapter::Adapter`] and [`cache::Cache`] — so this crate
//! never speaks SQL or Redis directly outside of the bundled
//! [`cache::redis::RedisCache`] adapter.

pub mod adapter;
pub mod cache;
pub mod database;
pub mod document;
pub mod engine;
pub mod errors;
pub mod events;
pub mod filters;
pub mod id;
pub mod metadata;
pub mod permission;
pub mod query;
pub mod relationship;
pub mod schema;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_support;

pub use adapter::Adapter;
pub use cache::{Cache, CacheKeys};
pub use database::Database;
pub use document::Document;
pub use errors::{DbError, DbResult, ValidationError, ValidationIssue, ValidationResult};
pub use events::{names as event_names, BatchEventPayload, Event, EventBus, SilentGuard};
pub use metadata::Collection;
pub use permission::{Action, Permission, ROLE_ANY};
pub use query::{FilterCondition, FilterOperator, Query, QueryPlan, Selection, SortOrder};
pub use schema::{Attribute, AttributeType, Index, IndexType, OnDelete, RelationOptions, RelationSide, RelationType};
