//! Total ordering over JSON values for cross-partition ORDER BY
//!
//! Ordering rules:
//! - undefined < null < bool < number < string < array < object
//! - same types use natural ordering; arrays and objects compare equal

use std::cmp::Ordering;

use serde_json::Value;

use super::info::SortOrder;
use super::order_by::OrderByItem;

/// Compares ORDER BY values
pub struct ItemComparer;

impl ItemComparer {
    /// Compares two values, `None` standing for undefined.
    pub fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a_val), Some(b_val)) => {
                let a_type = Self::type_order(a_val);
                let b_type = Self::type_order(b_val);

                if a_type != b_type {
                    return a_type.cmp(&b_type);
                }

                match (a_val, b_val) {
                    (Value::Bool(a_b), Value::Bool(b_b)) => a_b.cmp(b_b),
                    (Value::Number(a_n), Value::Number(b_n)) => {
                        if let (Some(a_i), Some(b_i)) = (a_n.as_i64(), b_n.as_i64()) {
                            return a_i.cmp(&b_i);
                        }
                        if let (Some(a_u), Some(b_u)) = (a_n.as_u64(), b_n.as_u64()) {
                            return a_u.cmp(&b_u);
                        }
                        let a_f = a_n.as_f64().unwrap_or(0.0);
                        let b_f = b_n.as_f64().unwrap_or(0.0);
                        a_f.total_cmp(&b_f)
                    }
                    (Value::String(a_s), Value::String(b_s)) => a_s.cmp(b_s),
                    _ => Ordering::Equal,
                }
            }
        }
    }

    /// Compares two ORDER BY tuples position by position, each oriented by
    /// its sort direction.
    pub fn compare_items(a: &[OrderByItem], b: &[OrderByItem], orders: &[SortOrder]) -> Ordering {
        for ((a_item, b_item), order) in a.iter().zip(b.iter()).zip(orders.iter()) {
            let ordering = order.apply(Self::compare(a_item.value(), b_item.value()));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    fn type_order(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_order() {
        let null = json!(null);
        let flag = json!(true);
        let num = json!(1);
        let text = json!("a");

        assert_eq!(ItemComparer::compare(None, Some(&null)), Ordering::Less);
        assert_eq!(ItemComparer::compare(Some(&null), Some(&flag)), Ordering::Less);
        assert_eq!(ItemComparer::compare(Some(&flag), Some(&num)), Ordering::Less);
        assert_eq!(ItemComparer::compare(Some(&num), Some(&text)), Ordering::Less);
    }

    #[test]
    fn test_numbers_mixed_representation() {
        let int = json!(2);
        let float = json!(2.5);
        let big = json!(u64::MAX);
        assert_eq!(ItemComparer::compare(Some(&int), Some(&float)), Ordering::Less);
        assert_eq!(ItemComparer::compare(Some(&big), Some(&int)), Ordering::Greater);
        assert_eq!(ItemComparer::compare(Some(&json!(2.0)), Some(&int)), Ordering::Equal);
    }

    #[test]
    fn test_compare_items_mixed_directions() {
        let orders = [SortOrder::Ascending, SortOrder::Descending];
        let a = [OrderByItem::new(json!(1)), OrderByItem::new(json!("b"))];
        let b = [OrderByItem::new(json!(1)), OrderByItem::new(json!("a"))];

        // equal on the first key; "b" sorts first under DESC
        assert_eq!(ItemComparer::compare_items(&a, &b, &orders), Ordering::Less);
    }

    #[test]
    fn test_undefined_item_first_ascending() {
        let orders = [SortOrder::Ascending];
        let undefined = [OrderByItem::undefined()];
        let null = [OrderByItem::new(json!(null))];
        assert_eq!(
            ItemComparer::compare_items(&undefined, &null, &orders),
            Ordering::Less
        );
    }
}
