//! Continuation token wire formats
//!
//! A continuation is a JSON array with one entry per partition that still
//! has results:
//!
//! ```text
//! parallel: [{"token": "...", "range": {"min": "A", "max": "B"}}]
//! order by: [{"compositeToken": {...}, "orderByItems": [{"item": 3}],
//!             "rid": "...", "skipCount": 0, "filter": "(c.a > 3)"}]
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{QueryError, QueryResult};
use crate::query::{OrderByItem, ResourceId, ResumeFilter};
use crate::routing::Range;

/// Backend continuation for one range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeContinuationToken {
    pub token: Option<String>,
    pub range: Range,
}

/// Resume position of one range of an ORDER BY query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByContinuationToken {
    pub composite_token: CompositeContinuationToken,
    pub order_by_items: Vec<OrderByItem>,
    pub rid: String,
    pub skip_count: u64,
    pub filter: String,
}

impl OrderByContinuationToken {
    /// Checks the token against the query's sort shape and returns the
    /// document id of its rid.
    pub fn validate(&self, sort_keys: usize) -> QueryResult<u64> {
        if self.order_by_items.len() != sort_keys {
            return Err(QueryError::malformed_continuation(format!(
                "expected {} order-by items, got {}",
                sort_keys,
                self.order_by_items.len()
            )));
        }

        ResumeFilter::parse(&self.filter)?;

        ResourceId::parse(&self.rid)
            .map(|rid| rid.document())
            .ok_or_else(|| QueryError::malformed_continuation(format!("invalid rid '{}'", self.rid)))
    }
}

/// Parses a non-empty token array.
pub fn parse_token_list<T: DeserializeOwned>(token: &Value) -> QueryResult<Vec<T>> {
    let tokens: Vec<T> = serde_json::from_value(token.clone())
        .map_err(|e| QueryError::malformed_continuation(e.to_string()))?;

    if tokens.is_empty() {
        return Err(QueryError::malformed_continuation("continuation lists no ranges"));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parallel_wire_form() {
        let token = CompositeContinuationToken {
            token: None,
            range: Range::new("B", "C"),
        };
        assert_eq!(
            serde_json::to_string(&token).unwrap(),
            r#"{"token":null,"range":{"min":"B","max":"C"}}"#
        );
    }

    #[test]
    fn test_order_by_wire_form() {
        let raw = json!([{
            "compositeToken": {"token": "t1", "range": {"min": "", "max": "FF"}},
            "orderByItems": [{"item": 3}, {}],
            "rid": ResourceId::new(1, 9).encode(),
            "skipCount": 2,
            "filter": "(c.a > 3)"
        }]);

        let tokens: Vec<OrderByContinuationToken> = parse_token_list(&raw).unwrap();
        assert_eq!(tokens[0].skip_count, 2);
        assert!(tokens[0].order_by_items[1].is_undefined());
        assert_eq!(tokens[0].validate(2).unwrap(), 9);
        assert_eq!(serde_json::to_value(&tokens).unwrap(), raw);
    }

    #[test]
    fn test_validation_failures() {
        let token = OrderByContinuationToken {
            composite_token: CompositeContinuationToken {
                token: None,
                range: Range::new("A", "B"),
            },
            order_by_items: vec![OrderByItem::new(json!(1))],
            rid: ResourceId::new(1, 1).encode(),
            skip_count: 0,
            filter: "true".to_string(),
        };
        assert!(token.validate(1).is_ok());
        assert!(matches!(token.validate(2), Err(QueryError::MalformedContinuation(_))));

        let bad_rid = OrderByContinuationToken {
            rid: "!!".to_string(),
            ..token.clone()
        };
        assert!(bad_rid.validate(1).is_err());

        let bad_filter = OrderByContinuationToken {
            filter: "c.a >".to_string(),
            ..token
        };
        assert!(bad_filter.validate(1).is_err());
    }

    #[test]
    fn test_empty_or_wrong_shape_rejected() {
        assert!(parse_token_list::<CompositeContinuationToken>(&json!([])).is_err());
        assert!(parse_token_list::<CompositeContinuationToken>(&json!({"token": null})).is_err());
        assert!(parse_token_list::<CompositeContinuationToken>(&json!([{"range": 1}])).is_err());
    }
}
