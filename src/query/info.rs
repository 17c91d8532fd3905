//! Query metadata produced by the query compiler
//!
//! The compiler rewrites the user query and describes what client-side work
//! remains. Field names follow the compiler's JSON output.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{QueryError, QueryResult};

/// Placeholder the compiler leaves in ORDER BY rewrites for the resume filter
pub const FILTER_PLACEHOLDER: &str = "{documentdb-formattableorderbyquery-filter}";

/// Sort direction of one ORDER BY expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }

    /// Orients an ascending comparison result to this direction.
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

/// DISTINCT flavour chosen by the compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistinctType {
    #[default]
    None,
    /// Duplicates arrive adjacent (DISTINCT on the ORDER BY expression)
    Ordered,
    Unordered,
}

/// Aggregate functions evaluated client-side over partition partials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateOperator {
    Average,
    Count,
    Max,
    Min,
    Sum,
}

impl AggregateOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOperator::Average => "AVG",
            AggregateOperator::Count => "COUNT",
            AggregateOperator::Max => "MAX",
            AggregateOperator::Min => "MIN",
            AggregateOperator::Sum => "SUM",
        }
    }
}

/// Client-side execution plan for one query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryInfo {
    pub order_by: Vec<SortOrder>,
    pub order_by_expressions: Vec<String>,
    pub top: Option<u64>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub aggregates: Vec<AggregateOperator>,
    pub distinct_type: DistinctType,
    pub group_by_expressions: Vec<String>,
    /// Output alias to the aggregate that produces it (`None` for plain keys)
    pub group_by_alias_to_aggregate_type: BTreeMap<String, Option<AggregateOperator>>,
    pub has_select_value: bool,
    pub rewritten_query: String,
}

impl QueryInfo {
    pub fn has_order_by(&self) -> bool {
        !self.order_by.is_empty()
    }

    pub fn has_top(&self) -> bool {
        self.top.is_some()
    }

    pub fn has_offset(&self) -> bool {
        self.offset.is_some()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn has_aggregates(&self) -> bool {
        !self.aggregates.is_empty()
    }

    pub fn has_distinct(&self) -> bool {
        self.distinct_type != DistinctType::None
    }

    pub fn has_group_by(&self) -> bool {
        !self.group_by_expressions.is_empty()
    }

    /// Checks internal consistency of the compiler output.
    pub fn validate(&self) -> QueryResult<()> {
        if self.order_by.len() != self.order_by_expressions.len() {
            return Err(QueryError::unsupported(format!(
                "{} sort orders for {} order-by expressions",
                self.order_by.len(),
                self.order_by_expressions.len()
            )));
        }

        if self.has_order_by() && !self.rewritten_query.contains(FILTER_PLACEHOLDER) {
            return Err(QueryError::unsupported(
                "order-by rewrite lacks the resume filter placeholder",
            ));
        }

        Ok(())
    }
}

/// Substitutes the resume filter into the rewritten query text.
pub fn format_query(rewritten: &str, filter: Option<&str>) -> String {
    rewritten.replace(FILTER_PLACEHOLDER, filter.unwrap_or("true"))
}
