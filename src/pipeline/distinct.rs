//! DISTINCT
//!
//! Ordered distinct keeps only the hash of the last emitted value, so its
//! token is small. Unordered distinct carries every value it has seen.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::distinct::{DistinctHash, DistinctMap, OrderedDistinctMap, UnorderedDistinctMap, UnorderedDistinctState};
use crate::errors::{QueryError, QueryResult};
use crate::execution::ForestDiagnostics;

use super::{wrap_stage_token, QueryStage};

pub struct DistinctStage {
    source: Box<dyn QueryStage>,
    map: DistinctMap,
}

impl DistinctStage {
    pub fn create(source: Box<dyn QueryStage>, ordered: bool, state: Option<&Value>) -> QueryResult<Self> {
        let map = if ordered {
            let last_hash = match state {
                None | Some(Value::Null) => None,
                Some(Value::String(encoded)) => Some(
                    DistinctHash::from_base64(encoded)
                        .ok_or_else(|| QueryError::malformed_continuation("invalid 'lastHash'"))?,
                ),
                Some(_) => return Err(QueryError::malformed_continuation("'lastHash' must be a string")),
            };
            DistinctMap::Ordered(OrderedDistinctMap::new(last_hash))
        } else {
            let map = match state {
                None => UnorderedDistinctMap::new(),
                Some(value) => {
                    let state: UnorderedDistinctState = serde_json::from_value(value.clone())
                        .map_err(|e| QueryError::malformed_continuation(format!("invalid 'distinctMap': {}", e)))?;
                    UnorderedDistinctMap::from_state(state)
                }
            };
            DistinctMap::Unordered(map)
        };

        Ok(Self { source, map })
    }

    async fn drain_distinct(&mut self, max_items: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        let items = self.source.drain(max_items, cancel).await?;
        Ok(items
            .into_iter()
            .filter(|item| self.map.add(Some(item)))
            .collect())
    }
}

impl QueryStage for DistinctStage {
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>> {
        Box::pin(self.drain_distinct(max_items, cancel))
    }

    fn is_done(&self) -> bool {
        self.source.is_done()
    }

    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        let Some(source) = self.source.continuation_token()? else {
            return Ok(None);
        };

        let token = match &self.map {
            DistinctMap::Ordered(map) => {
                let last_hash = map
                    .last_hash()
                    .map_or(Value::Null, |hash| Value::String(hash.to_base64()));
                wrap_stage_token("lastHash", last_hash, source)
            }
            DistinctMap::Unordered(map) => {
                wrap_stage_token("distinctMap", serde_json::to_value(map.to_state())?, source)
            }
        };
        Ok(Some(token))
    }

    fn take_diagnostics(&mut self) -> ForestDiagnostics {
        self.source.take_diagnostics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::take::tests::ScriptedSource;
    use serde_json::json;

    #[tokio::test]
    async fn test_ordered_dedup_across_resume() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![vec![json!(1), json!(1), json!(2)], vec![json!(3)]]);
        let mut stage = DistinctStage::create(source, true, None).unwrap();

        assert_eq!(stage.drain(10, &cancel).await.unwrap(), vec![json!(1), json!(2)]);
        let token = stage.continuation_token().unwrap().unwrap();
        let last_hash = token.get("lastHash").cloned();
        assert_eq!(last_hash, Some(json!(DistinctHash::of(Some(&json!(2))).to_base64())));

        // The next page starts with a repeat of the last emitted value.
        let source = ScriptedSource::new(vec![vec![json!(2), json!(3)]]);
        let mut resumed = DistinctStage::create(source, true, last_hash.as_ref()).unwrap();
        assert_eq!(resumed.drain(10, &cancel).await.unwrap(), vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_unordered_state_survives_resume() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![
            vec![json!("a"), json!({"x": 1}), json!("a")],
            vec![json!("b")],
        ]);
        let mut stage = DistinctStage::create(source, false, None).unwrap();
        assert_eq!(stage.drain(10, &cancel).await.unwrap(), vec![json!("a"), json!({"x": 1})]);

        let token = stage.continuation_token().unwrap().unwrap();
        let state = token.get("distinctMap").cloned();

        let source = ScriptedSource::new(vec![vec![json!({"x": 1}), json!("c"), json!("a")]]);
        let mut resumed = DistinctStage::create(source, false, state.as_ref()).unwrap();
        assert_eq!(resumed.drain(10, &cancel).await.unwrap(), vec![json!("c")]);
    }

    #[test]
    fn test_bad_state_rejected() {
        let source = ScriptedSource::new(vec![]);
        assert!(DistinctStage::create(source, true, Some(&json!("not base64!"))).is_err());

        let source = ScriptedSource::new(vec![]);
        assert!(DistinctStage::create(source, false, Some(&json!({"numbers": "x"}))).is_err());
    }
}
