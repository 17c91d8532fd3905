//! ORDER BY result documents
//!
//! For ORDER BY queries each backend item wraps the user payload with the
//! values it was sorted on and its resource id:
//! `{"_rid": "...", "orderByItems": [{"item": v}, ...], "payload": {...}}`.
//! An `{}` entry in `orderByItems` means the sort value was undefined.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{QueryError, QueryResult};

/// One sort value; distinguishes undefined (`{}`) from JSON null
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderByItem {
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    item: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl OrderByItem {
    pub fn new(value: Value) -> Self {
        Self { item: Some(value) }
    }

    pub fn undefined() -> Self {
        Self { item: None }
    }

    pub fn value(&self) -> Option<&Value> {
        self.item.as_ref()
    }

    pub fn is_undefined(&self) -> bool {
        self.item.is_none()
    }
}

/// A parsed ORDER BY backend item
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByQueryResult {
    pub rid: String,
    pub order_by_items: Vec<OrderByItem>,
    pub payload: Value,
}

impl OrderByQueryResult {
    pub fn from_value(value: &Value) -> QueryResult<Self> {
        let rid = value
            .get("_rid")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::unexpected_response("order-by item without _rid"))?
            .to_string();

        let items = value
            .get("orderByItems")
            .and_then(Value::as_array)
            .ok_or_else(|| QueryError::unexpected_response("order-by item without orderByItems"))?;

        let order_by_items = items
            .iter()
            .map(|item| match item.get("item") {
                Some(v) => OrderByItem::new(v.clone()),
                None => OrderByItem::undefined(),
            })
            .collect();

        Ok(Self {
            rid,
            order_by_items,
            payload: value.get("payload").cloned().unwrap_or(Value::Null),
        })
    }

    /// Two results are the same emission when they carry the same rid and
    /// sort values (JOINs can repeat a document).
    pub fn same_identity(a: &Value, b: &Value) -> bool {
        match (a.get("_rid"), b.get("_rid")) {
            (Some(a_rid), Some(b_rid)) => {
                a_rid == b_rid && a.get("orderByItems") == b.get("orderByItems")
            }
            _ => false,
        }
    }
}
