//! OFFSET

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::{QueryError, QueryResult};
use crate::execution::ForestDiagnostics;

use super::{wrap_stage_token, QueryStage};

/// Drops the first `count` documents
pub struct SkipStage {
    source: Box<dyn QueryStage>,
    remaining: u64,
}

impl SkipStage {
    pub fn create(source: Box<dyn QueryStage>, count: u64, state: Option<&Value>) -> QueryResult<Self> {
        let remaining = match state {
            None => count,
            Some(value) => {
                let remaining = value
                    .as_u64()
                    .ok_or_else(|| QueryError::malformed_continuation("'offset' must be a count"))?;
                if remaining > count {
                    return Err(QueryError::malformed_continuation(format!(
                        "'offset' of {} exceeds the query's {}",
                        remaining, count
                    )));
                }
                remaining
            }
        };

        Ok(Self { source, remaining })
    }

    async fn drain_skipping(&mut self, max_items: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        let mut items = self.source.drain(max_items, cancel).await?;
        if self.remaining > 0 {
            let skipped = items.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
            items.drain(..skipped);
            self.remaining -= skipped as u64;
        }
        Ok(items)
    }
}

impl QueryStage for SkipStage {
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>> {
        Box::pin(self.drain_skipping(max_items, cancel))
    }

    fn is_done(&self) -> bool {
        self.source.is_done()
    }

    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        Ok(self
            .source
            .continuation_token()?
            .map(|source| wrap_stage_token("offset", Value::from(self.remaining), source)))
    }

    fn take_diagnostics(&mut self) -> ForestDiagnostics {
        self.source.take_diagnostics()
    }
}
