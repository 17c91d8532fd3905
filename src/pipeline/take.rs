//! TOP / LIMIT

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::{QueryError, QueryResult};
use crate::execution::ForestDiagnostics;

use super::{wrap_stage_token, QueryStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeKind {
    Top,
    Limit,
}

impl TakeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakeKind::Top => "top",
            TakeKind::Limit => "limit",
        }
    }

    /// Field holding the remaining count in a continuation
    pub fn token_key(&self) -> &'static str {
        self.as_str()
    }
}

/// Passes through at most `count` documents in total
pub struct TakeStage {
    source: Box<dyn QueryStage>,
    kind: TakeKind,
    remaining: u64,
}

impl TakeStage {
    /// `state` is the remaining count recorded in a continuation; it may not
    /// exceed the count in the query.
    pub fn create(
        source: Box<dyn QueryStage>,
        kind: TakeKind,
        count: u64,
        state: Option<&Value>,
    ) -> QueryResult<Self> {
        let remaining = match state {
            None => count,
            Some(value) => {
                let remaining = value.as_u64().ok_or_else(|| {
                    QueryError::malformed_continuation(format!("'{}' must be a count", kind.as_str()))
                })?;
                if remaining > count {
                    return Err(QueryError::malformed_continuation(format!(
                        "'{}' of {} exceeds the query's {}",
                        kind.as_str(),
                        remaining,
                        count
                    )));
                }
                remaining
            }
        };

        Ok(Self {
            source,
            kind,
            remaining,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    async fn drain_limited(&mut self, max_items: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        if self.remaining == 0 {
            return Ok(Vec::new());
        }

        let mut items = self.source.drain(max_items, cancel).await?;
        let allowed = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        items.truncate(allowed);
        self.remaining -= items.len() as u64;
        Ok(items)
    }
}

impl QueryStage for TakeStage {
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>> {
        Box::pin(self.drain_limited(max_items, cancel))
    }

    fn is_done(&self) -> bool {
        self.remaining == 0 || self.source.is_done()
    }

    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        Ok(self
            .source
            .continuation_token()?
            .map(|source| wrap_stage_token(self.kind.token_key(), Value::from(self.remaining), source)))
    }

    fn take_diagnostics(&mut self) -> ForestDiagnostics {
        self.source.take_diagnostics()
    }
}
