//! Aggregates over partition partials
//!
//! Each partition computes a partial result per aggregate and the client
//! combines them. A source document is an array with one `{"item": partial}`
//! entry per aggregate; a missing `item` means the partial is undefined.
//!
//! | aggregate | partial                           |
//! |-----------|-----------------------------------|
//! | COUNT     | number                            |
//! | SUM       | number                            |
//! | AVG       | `{"sum": n, "count": n}`          |
//! | MIN / MAX | `{"min": v, "count": n}` or value |

use std::cmp::Ordering;
use std::collections::VecDeque;

use futures_util::future::BoxFuture;
use serde_json::{Number, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::{QueryError, QueryResult};
use crate::execution::ForestDiagnostics;
use crate::query::{AggregateOperator, ItemComparer};

use super::QueryStage;

/// Running sum that stays integral until a fractional or overflowing term
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Total {
    Int(i64),
    Float(f64),
}

impl Total {
    fn add(self, n: &Number) -> Self {
        match (self, n.as_i64()) {
            (Total::Int(acc), Some(i)) => match acc.checked_add(i) {
                Some(sum) => Total::Int(sum),
                None => Total::Float(acc as f64 + i as f64),
            },
            (Total::Int(acc), None) => Total::Float(acc as f64 + n.as_f64().unwrap_or(0.0)),
            (Total::Float(acc), _) => Total::Float(acc + n.as_f64().unwrap_or(0.0)),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Total::Int(i) => i as f64,
            Total::Float(f) => f,
        }
    }

    fn to_value(self) -> Value {
        match self {
            Total::Int(i) => Value::from(i),
            Total::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        }
    }
}

/// Combines the partials of one aggregate
#[derive(Debug, Clone)]
pub enum Aggregator {
    Count(Total),
    Sum(Option<Total>),
    Average { sum: Option<Total>, count: u64 },
    Extreme { operator: AggregateOperator, best: Option<Value>, invalid: bool },
}

impl Aggregator {
    pub fn new(operator: AggregateOperator) -> Self {
        match operator {
            AggregateOperator::Count => Aggregator::Count(Total::Int(0)),
            AggregateOperator::Sum => Aggregator::Sum(Some(Total::Int(0))),
            AggregateOperator::Average => Aggregator::Average {
                sum: Some(Total::Int(0)),
                count: 0,
            },
            AggregateOperator::Min | AggregateOperator::Max => Aggregator::Extreme {
                operator,
                best: None,
                invalid: false,
            },
        }
    }

    /// Folds one partial in; `None` is an undefined partial.
    pub fn add(&mut self, partial: Option<&Value>) -> QueryResult<()> {
        match self {
            Aggregator::Count(total) => {
                let Some(Value::Number(n)) = partial else {
                    return Err(QueryError::unexpected_response("COUNT partial is not a number"));
                };
                *total = total.add(n);
            }
            Aggregator::Sum(total) => match partial {
                Some(Value::Number(n)) => *total = total.map(|t| t.add(n)),
                _ => *total = None,
            },
            Aggregator::Average { sum, count } => {
                let Some(partial) = partial else { return Ok(()) };
                let partial_count = partial
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| QueryError::unexpected_response("AVG partial without count"))?;
                if partial_count == 0 {
                    return Ok(());
                }
                match partial.get("sum") {
                    Some(Value::Number(n)) => *sum = sum.map(|t| t.add(n)),
                    _ => *sum = None,
                }
                *count += partial_count;
            }
            Aggregator::Extreme {
                operator,
                best,
                invalid,
            } => {
                let key = if *operator == AggregateOperator::Min { "min" } else { "max" };
                let value = match partial {
                    None => return Ok(()),
                    Some(Value::Object(object)) if object.contains_key("count") => {
                        let count = object.get("count").and_then(Value::as_u64).unwrap_or(0);
                        if count == 0 {
                            return Ok(());
                        }
                        match object.get(key) {
                            Some(value) => value,
                            None => return Ok(()),
                        }
                    }
                    Some(value) => value,
                };

                if value.is_array() || value.is_object() {
                    *invalid = true;
                    return Ok(());
                }

                let wanted = if *operator == AggregateOperator::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let replace = match best.as_ref() {
                    None => true,
                    Some(current) => ItemComparer::compare(Some(value), Some(current)) == wanted,
                };
                if replace {
                    *best = Some(value.clone());
                }
            }
        }
        Ok(())
    }

    /// Combined result; `None` when undefined.
    pub fn result(&self) -> Option<Value> {
        match self {
            Aggregator::Count(total) => Some(total.to_value()),
            Aggregator::Sum(total) => total.map(Total::to_value),
            Aggregator::Average { sum, count } => {
                let sum = (*sum)?;
                if *count == 0 {
                    return None;
                }
                Number::from_f64(sum.as_f64() / *count as f64).map(Value::Number)
            }
            Aggregator::Extreme { best, invalid, .. } => {
                if *invalid {
                    None
                } else {
                    best.clone()
                }
            }
        }
    }
}

/// Aggregates without GROUP BY: one result once the source is drained
pub struct AggregateStage {
    source: Box<dyn QueryStage>,
    aggregators: Vec<Aggregator>,
    results: VecDeque<Value>,
    finished: bool,
}

impl AggregateStage {
    pub fn new(source: Box<dyn QueryStage>, operators: &[AggregateOperator]) -> Self {
        Self {
            source,
            aggregators: operators.iter().copied().map(Aggregator::new).collect(),
            results: VecDeque::new(),
            finished: false,
        }
    }

    fn fold(&mut self, item: &Value) -> QueryResult<()> {
        let partials = item
            .as_array()
            .ok_or_else(|| QueryError::unexpected_response("aggregate partial is not an array"))?;
        if partials.len() != self.aggregators.len() {
            return Err(QueryError::unexpected_response(format!(
                "expected {} aggregate partials, got {}",
                self.aggregators.len(),
                partials.len()
            )));
        }

        for (aggregator, partial) in self.aggregators.iter_mut().zip(partials) {
            aggregator.add(partial.get("item"))?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        let mut values: Vec<Option<Value>> = self.aggregators.iter().map(Aggregator::result).collect();
        if values.len() == 1 {
            if let Some(value) = values.pop().flatten() {
                self.results.push_back(value);
            }
        } else {
            let row = values.into_iter().map(|v| v.unwrap_or(Value::Null)).collect();
            self.results.push_back(Value::Array(row));
        }
    }

    async fn drain_aggregate(&mut self, max_items: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
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

impl QueryStage for AggregateStage {
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>> {
        Box::pin(self.drain_aggregate(max_items, cancel))
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

    fn fold(operator: AggregateOperator, partials: &[Option<Value>]) -> Option<Value> {
        let mut aggregator = Aggregator::new(operator);
        for partial in partials {
            aggregator.add(partial.as_ref()).unwrap();
        }
        aggregator.result()
    }

    #[test]
    fn test_count_and_sum_stay_integral() {
        assert_eq!(
            fold(AggregateOperator::Count, &[Some(json!(2)), Some(json!(5))]),
            Some(json!(7))
        );
        assert_eq!(
            fold(AggregateOperator::Sum, &[Some(json!(2)), Some(json!(0.5))]),
            Some(json!(2.5))
        );
    }

    #[test]
    fn test_sum_with_undefined_partial_is_undefined() {
        assert_eq!(fold(AggregateOperator::Sum, &[Some(json!(2)), None]), None);
    }

    #[test]
    fn test_average_weights_by_count() {
        let partials = [
            Some(json!({"sum": 10, "count": 2})),
            Some(json!({"sum": 2, "count": 2})),
            Some(json!({"count": 0})),
        ];
        assert_eq!(fold(AggregateOperator::Average, &partials), Some(json!(3.0)));
        assert_eq!(fold(AggregateOperator::Average, &[Some(json!({"count": 0}))]), None);
    }

    #[test]
    fn test_min_max_partials() {
        let partials = [
            Some(json!({"min": 4, "count": 2})),
            Some(json!({"count": 0})),
            Some(json!(1)),
            None,
        ];
        assert_eq!(fold(AggregateOperator::Min, &partials), Some(json!(1)));

        let partials = [Some(json!({"max": "b", "count": 1})), Some(json!(7))];
        // strings sort after numbers
        assert_eq!(fold(AggregateOperator::Max, &partials), Some(json!("b")));

        assert_eq!(fold(AggregateOperator::Max, &[Some(json!([1]))]), None);
    }

    #[tokio::test]
    async fn test_stage_emits_once_after_full_drain() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![
            vec![json!([{"item": 3}])],
            vec![json!([{"item": 4}]), json!([{"item": 0}])],
        ]);
        let mut stage = AggregateStage::new(source, &[AggregateOperator::Count]);

        assert_eq!(stage.drain(10, &cancel).await.unwrap(), vec![json!(7)]);
        assert!(stage.is_done());
        assert_eq!(stage.continuation_token().unwrap(), None);
    }

    #[tokio::test]
    async fn test_undefined_result_emits_nothing() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![vec![json!([{}])]]);
        let mut stage = AggregateStage::new(source, &[AggregateOperator::Max]);
        assert!(stage.drain(10, &cancel).await.unwrap().is_empty());
        assert!(stage.is_done());
    }

    #[tokio::test]
    async fn test_partial_arity_checked() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(vec![vec![json!([{"item": 1}, {"item": 2}])]]);
        let mut stage = AggregateStage::new(source, &[AggregateOperator::Sum]);
        assert!(stage.drain(10, &cancel).await.is_err());
    }
}
