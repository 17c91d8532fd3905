//! Post-processing pipeline
//!
//! Stages wrap the cross-partition source, innermost to outermost:
//!
//! ```text
//! source -> aggregate | group by -> distinct -> offset -> limit / top
//! ```
//!
//! Every stage has the same contract: drain up to `max_items` documents,
//! report whether it is done, and describe its position as a continuation
//! that nests the token of the stage beneath it under `sourceToken`.
//!
//! # Rules
//!
//! 1. Stages pass `max_items` through to their source unchanged
//! 2. Only a take stage truncates a drain, and it is done afterwards
//! 3. A stage with no source token has no token of its own

mod aggregate;
mod distinct;
mod feed;
mod group_by;
mod skip;
mod take;

pub use aggregate::{AggregateStage, Aggregator};
pub use distinct::DistinctStage;
pub use feed::{FeedPage, QueryExecution};
pub use group_by::GroupByStage;
pub use skip::SkipStage;
pub use take::{TakeKind, TakeStage};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{QueryError, QueryResult};
use crate::execution::{create_source, CrossPartitionParams, ForestDiagnostics};
use crate::observability::Event;
use crate::query::DistinctType;

/// One stage of a query pipeline
pub trait QueryStage: Send {
    /// Returns the next documents, at most `max_items` unless noted by the
    /// stage. An empty result does not imply the stage is done.
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>>;

    fn is_done(&self) -> bool;

    /// Position after the last drained document; `None` when nothing
    /// remains or the stage cannot resume.
    fn continuation_token(&self) -> QueryResult<Option<Value>>;

    /// Backend telemetry gathered since the previous call
    fn take_diagnostics(&mut self) -> ForestDiagnostics;
}

/// A pipeline stage chosen from the query plan, with the state recovered
/// from its continuation
#[derive(Debug, Clone, PartialEq)]
enum StagePlan {
    Take { kind: TakeKind, count: u64 },
    Skip { count: u64 },
    Distinct { ordered: bool },
    Aggregate,
    GroupBy,
}

impl StagePlan {
    fn name(&self) -> &'static str {
        match self {
            StagePlan::Take { kind, .. } => kind.as_str(),
            StagePlan::Skip { .. } => "offset",
            StagePlan::Distinct { ordered: true } => "ordered distinct",
            StagePlan::Distinct { ordered: false } => "unordered distinct",
            StagePlan::Aggregate => "aggregate",
            StagePlan::GroupBy => "group by",
        }
    }
}

/// Stages the query needs, outermost first
fn plan_stages(params: &CrossPartitionParams) -> QueryResult<Vec<StagePlan>> {
    let info = &params.query_info;
    let features = &params.config.features;

    info.validate()?;

    if (info.has_offset() || info.has_limit()) && !features.offset_limit {
        return Err(QueryError::FeatureDisabled(
            "OFFSET/LIMIT across partitions".to_string(),
        ));
    }
    if info.has_group_by() && !features.group_by {
        return Err(QueryError::FeatureDisabled(
            "GROUP BY across partitions".to_string(),
        ));
    }
    if info.has_aggregates() && !info.has_group_by() && !info.has_select_value {
        return Err(QueryError::unsupported(
            "cross-partition aggregates require SELECT VALUE",
        ));
    }

    let mut stages = Vec::new();
    if let Some(top) = info.top {
        stages.push(StagePlan::Take {
            kind: TakeKind::Top,
            count: top,
        });
    }
    if let Some(limit) = info.limit {
        stages.push(StagePlan::Take {
            kind: TakeKind::Limit,
            count: limit,
        });
    }
    if let Some(offset) = info.offset {
        stages.push(StagePlan::Skip { count: offset });
    }
    if info.has_distinct() {
        stages.push(StagePlan::Distinct {
            ordered: info.distinct_type == DistinctType::Ordered && info.has_order_by(),
        });
    }
    if info.has_group_by() {
        stages.push(StagePlan::GroupBy);
    } else if info.has_aggregates() {
        stages.push(StagePlan::Aggregate);
    }

    Ok(stages)
}

/// Splits a stage token into its own state field and the source token.
pub(crate) fn unwrap_stage_token<'t>(token: &'t Value, key: &str) -> QueryResult<(&'t Value, &'t Value)> {
    let object = token.as_object().ok_or_else(|| {
        QueryError::malformed_continuation(format!("expected an object with '{}'", key))
    })?;
    let state = object
        .get(key)
        .ok_or_else(|| QueryError::malformed_continuation(format!("missing '{}'", key)))?;
    let source = object
        .get("sourceToken")
        .filter(|v| !v.is_null())
        .ok_or_else(|| QueryError::malformed_continuation("missing 'sourceToken'"))?;
    Ok((state, source))
}

/// Wraps a source token with one stage field.
pub(crate) fn wrap_stage_token(key: &str, state: Value, source: Value) -> Value {
    let mut object = serde_json::Map::new();
    object.insert(key.to_string(), state);
    object.insert("sourceToken".to_string(), source);
    Value::Object(object)
}

/// Builds the full pipeline for `params`, resuming from `continuation`.
pub async fn build_pipeline(
    params: &CrossPartitionParams,
    continuation: Option<&Value>,
    cancel: &CancellationToken,
) -> QueryResult<Box<dyn QueryStage>> {
    let plans = plan_stages(params)?;

    // Peel stage state off the token from the outside in.
    let mut token = continuation;
    let mut resumed: Vec<Option<&Value>> = Vec::with_capacity(plans.len());
    for plan in &plans {
        let Some(current) = token else {
            resumed.push(None);
            continue;
        };
        let (state, source) = match plan {
            StagePlan::Take { kind, .. } => unwrap_stage_token(current, kind.token_key())?,
            StagePlan::Skip { .. } => unwrap_stage_token(current, "offset")?,
            StagePlan::Distinct { ordered: true } => unwrap_stage_token(current, "lastHash")?,
            StagePlan::Distinct { ordered: false } => unwrap_stage_token(current, "distinctMap")?,
            StagePlan::Aggregate | StagePlan::GroupBy => {
                return Err(QueryError::malformed_continuation(format!(
                    "{} queries cannot be resumed",
                    plan.name()
                )));
            }
        };
        resumed.push(Some(state));
        token = Some(source);
    }

    let mut stage = create_source(params, token, cancel).await?;

    for (plan, state) in plans.iter().zip(resumed).rev() {
        stage = match plan {
            StagePlan::Take { kind, count } => Box::new(TakeStage::create(stage, *kind, *count, state)?),
            StagePlan::Skip { count } => Box::new(SkipStage::create(stage, *count, state)?),
            StagePlan::Distinct { ordered } => Box::new(DistinctStage::create(stage, *ordered, state)?),
            StagePlan::Aggregate => Box::new(AggregateStage::new(
                stage,
                &params.query_info.aggregates,
            )),
            StagePlan::GroupBy => Box::new(GroupByStage::new(stage, &params.query_info)),
        };
    }

    debug!(
        event = %Event::PipelineBuilt,
        stages = ?plans.iter().map(StagePlan::name).collect::<Vec<_>>(),
        order_by = params.query_info.has_order_by(),
        resumed = continuation.is_some(),
        "pipeline built"
    );

    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_stage_token() {
        let token = json!({"top": 3, "sourceToken": [{"token": null}]});
        let (state, source) = unwrap_stage_token(&token, "top").unwrap();
        assert_eq!(state, &json!(3));
        assert_eq!(source, &json!([{"token": null}]));
    }

    #[test]
    fn test_unwrap_rejects_missing_fields() {
        assert!(unwrap_stage_token(&json!([1]), "top").is_err());
        assert!(unwrap_stage_token(&json!({"sourceToken": []}), "top").is_err());
        assert!(unwrap_stage_token(&json!({"top": 3}), "top").is_err());
        assert!(unwrap_stage_token(&json!({"top": 3, "sourceToken": null}), "top").is_err());
    }

    #[test]
    fn test_wrap_stage_token() {
        let wrapped = wrap_stage_token("offset", json!(2), json!("inner"));
        assert_eq!(wrapped, json!({"offset": 2, "sourceToken": "inner"}));
    }
}
