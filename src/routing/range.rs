//! Partition key ranges
//!
//! Keys compare as ordinal strings. Ranges are half-open: `[min, max)`.

use serde::{Deserialize, Serialize};

/// A half-open key interval as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub min: String,
    pub max: String,
}

impl Range {
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    pub fn contains(&self, key: &str) -> bool {
        self.min.as_str() <= key && key < self.max.as_str()
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.min < other.max && other.min < self.max
    }
}

/// A backend partition: an id plus the key range it owns
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    /// Ids of the ranges this one was split from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    pub fn to_range(&self) -> Range {
        Range::new(self.min_inclusive.clone(), self.max_exclusive.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.min_inclusive.as_str() <= key && key < self.max_exclusive.as_str()
    }

    pub fn overlaps(&self, range: &Range) -> bool {
        self.min_inclusive < range.max && range.min < self.max_exclusive
    }
}
