//! GROUP BY
//!
//! Source documents look like
//! `{"groupByItems": [...], "payload": {"alias": {"item": partial}, "key": v}}`:
//! aggregate aliases carry a partial, plain aliases carry the grouping value
//! itself. Groups are keyed by the structural hash of `groupByItems` and
//! emitted in first-seen order once the source is drained.

use std::collections::{HashMap, VecDeque};

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::distinct::DistinctHash;
use crate::errors::{QueryError, QueryResult};
use crate::execution::ForestDiagnostics;
use crate::query::{AggregateOperator, QueryInfo};

use super::{Aggregator, QueryStage};

enum Column {
    Aggregate(Aggregator),
    Plain(Option<Value>),
}

struct Group {
    columns: Vec<(String, Column)>,
}

pub struct GroupByStage {
    source: Box<dyn QueryStage>,
    aliases: Vec<(String, Option<AggregateOperator>)>,
    select_value: bool,
    index: HashMap<DistinctHash, usize>,
    groups: Vec<Group>,
    results: VecDeque<Value>,
    finished: bool,
}

impl GroupByStage {
    pub fn new(source: Box<dyn QueryStage>, info: &QueryInfo) -> Self {
        Self {
            source,
            aliases: info
                .group_by_alias_to_aggregate_type
                .iter()
                .map(|(alias, op)| (alias.clone(), *op))
                .collect(),
            select_value: info.has_select_value,
            index: HashMap::new(),
            groups: Vec::new(),
            results: VecDeque::new(),
            finished: false,
        }
    }

    fn new_group(&self) -> Group {
        Group {
            columns: self
                .aliases
                .iter()
                .map(|(alias, op)| {
                    let column = match op {
                        Some(op) => Column::Aggregate(Aggregator::new(*op)),
                        None => Column::Plain(None),
                    };
                    (alias.clone(), column)
                })
                .collect(),
        }
    }

    fn fold(&mut self, item: &Value) -> QueryResult<()> {
        let keys = item
            .get("groupByItems")
            .ok_or_else(|| QueryError::unexpected_response("group-by item without groupByItems"))?;
        let payload = item
            .get("payload")
            .and_then(Value::as_object)
            .ok_or_else(|| QueryError::unexpected_response("group-by item without payload"))?;

        let hash = DistinctHash::of(Some(keys));
        let slot = match self.index.get(&hash) {
            Some(&slot) => slot,
            None => {
                let group = self.new_group();
                self.groups.push(group);
                self.index.insert(hash, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };

        for (alias, column) in &mut self.groups[slot].columns {
            match column {
                Column::Aggregate(aggregator) => {
                    let partial = payload.get(alias.as_str()).and_then(|v| v.get("item"));
                    aggregator.add(partial)?;
                }
                Column::Plain(value) => {
                    if value.is_none() {
                        *value = payload.get(alias.as_str()).cloned();
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        for group in self.groups.drain(..) {
            let mut row = Map::new();
            for (alias, column) in group.columns {
                let value = match column {
                    Column::Aggregate(aggregator) => aggregator.result(),
                    Column::Plain(value) => value,
                };
                if let Some(value) = value {
                    row.insert(alias, value);
                }
            }

            if self.select_value && self.aliases.len() == 1 {
                if let Some((_, value)) = row.into_iter().next() {
                    self.results.push_back(value);
                }
            } else {
                self.results.push_back(Value::Object(row));
            }
        }
        self.index.clear();
    }

    async fn drain_groups(&mut self, max_items: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        while !self.finished {
            if self.source.is_done() {
                self.finish();
                break;
            }
            let items = self.source.drain(max_items, cancel).await?;
            for item in &items {
                self.fold(item)?;
            }
        }

        let take = max_items.min(self.results.len());
        Ok(self.results.drain(..take).collect())
    }
}

impl QueryStage for GroupByStage {
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>> {
        Box::pin(self.drain_groups(max_items, cancel))
    }

    fn is_done(&self) -> bool {
        self.finished && self.results.is_empty()
    }

    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        Ok(None)
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
    use std::collections::BTreeMap;

    fn info(aliases: &[(&str, Option<AggregateOperator>)], select_value: bool) -> QueryInfo {
        QueryInfo {
            group_by_expressions: vec!["c.team".to_string()],
            group_by_alias_to_aggregate_type: aliases
                .iter()
                .map(|(a, op)| (a.to_string(), *op))
                .collect::<BTreeMap<_, _>>(),
            has_select_value: select_value,
            ..QueryInfo::default()
        }
    }

    fn row(team: &str, count: i64) -> Value {
        json!({
            "groupByItems": [{"item": team}],
            "payload": {"team": team, "n": {"item": count}}
        })
    }

    #[tokio::test]
    async fn test_groups_merge_across_partitions() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![
            vec![row("red", 2), row("blue", 1)],
            vec![row("red", 3)],
        ]);
        let info = info(&[("team", None), ("n", Some(AggregateOperator::Count))], false);
        let mut stage = GroupByStage::new(source, &info);

        let items = stage.drain(10, &cancel).await.unwrap();
        assert_eq!(
            items,
            vec![json!({"team": "red", "n": 5}), json!({"team": "blue", "n": 1})]
        );
        assert!(stage.is_done());
    }

    #[tokio::test]
    async fn test_select_value_unwraps_single_alias() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![vec![
            json!({"groupByItems": [1], "payload": {"$1": {"item": 4}}}),
            json!({"groupByItems": [2], "payload": {"$1": {"item": 6}}}),
            json!({"groupByItems": [1], "payload": {"$1": {"item": 1}}}),
        ]]);
        let info = info(&[("$1", Some(AggregateOperator::Sum))], true);
        let mut stage = GroupByStage::new(source, &info);

        assert_eq!(stage.drain(1, &cancel).await.unwrap(), vec![json!(5)]);
        assert!(!stage.is_done());
        assert_eq!(stage.drain(1, &cancel).await.unwrap(), vec![json!(6)]);
        assert!(stage.is_done());
    }

    #[tokio::test]
    async fn test_malformed_item_rejected() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![vec![json!({"payload": {}})]]);
        let info = info(&[("n", Some(AggregateOperator::Count))], false);
        let mut stage = GroupByStage::new(source, &info);
        assert!(stage.drain(10, &cancel).await.is_err());
    }
}
