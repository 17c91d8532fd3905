//! Fixture files for `crossquery run`
//!
//! ```json
//! {
//!   "ranges": [{"id": "0", "minInclusive": "A", "maxExclusive": "B"}],
//!   "documents": [{"partitionKey": "A1", "body": {"name": "x"}}],
//!   "queryInfo": {"rewrittenQuery": "SELECT * FROM c"},
//!   "splits": [{"rangeId": "0", "at": "AM", "afterRequests": 1}]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::QueryInfo;
use crate::routing::PartitionKeyRange;
use crate::transport::memory::InMemoryBackend;

use super::errors::{CliError, CliResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureDocument {
    pub partition_key: String,
    pub body: Value,
}

/// A range split scheduled after some number of served pages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureSplit {
    pub range_id: String,
    pub at: String,
    #[serde(default)]
    pub after_requests: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    pub ranges: Vec<PartitionKeyRange>,
    #[serde(default)]
    pub documents: Vec<FixtureDocument>,
    pub query_info: QueryInfo,
    #[serde(default)]
    pub splits: Vec<FixtureSplit>,
}

impl Fixture {
    /// Load a fixture from a JSON file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::fixture_error(format!("Failed to read fixture: {}", e)))?;

        let fixture: Fixture = serde_json::from_str(&content)
            .map_err(|e| CliError::fixture_error(format!("Invalid fixture JSON: {}", e)))?;

        if fixture.ranges.is_empty() {
            return Err(CliError::fixture_error("fixture lists no ranges"));
        }

        Ok(fixture)
    }

    /// Backend holding the fixture's documents, sorting like the query does
    pub fn build_backend(&self) -> CliResult<InMemoryBackend> {
        let backend = InMemoryBackend::new(self.ranges.clone()).with_order_by(
            self.query_info.order_by_expressions.clone(),
            self.query_info.order_by.clone(),
        );

        for document in &self.documents {
            backend
                .insert(&document.partition_key, document.body.clone())
                .map_err(|e| CliError::fixture_error(e.to_string()))?;
        }
        for split in &self.splits {
            backend.split_after(&split.range_id, &split.at, split.after_requests);
        }

        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_load_and_build() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fixture.json");
        let fixture = json!({
            "ranges": [
                {"id": "0", "minInclusive": "A", "maxExclusive": "B"},
                {"id": "1", "minInclusive": "B", "maxExclusive": "C"}
            ],
            "documents": [{"partitionKey": "B7", "body": {"n": 1}}],
            "queryInfo": {"rewrittenQuery": "SELECT * FROM c"}
        });
        fs::write(&path, fixture.to_string()).unwrap();

        let fixture = Fixture::load(&path).unwrap();
        let backend = fixture.build_backend().unwrap();
        assert_eq!(backend.target_ranges().len(), 2);
    }

    #[test]
    fn test_document_outside_ranges_rejected() {
        let fixture = Fixture {
            ranges: vec![PartitionKeyRange::new("0", "A", "B")],
            documents: vec![FixtureDocument {
                partition_key: "Z".to_string(),
                body: json!({}),
            }],
            query_info: QueryInfo::default(),
            splits: Vec::new(),
        };
        assert!(fixture.build_backend().is_err());
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Fixture::load(&temp_dir.path().join("absent.json")).is_err());
    }
}
