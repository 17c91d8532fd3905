//! ORDER BY resume filters
//!
//! When an ORDER BY query resumes, each partition is narrowed to documents
//! that sort at or after the resume point. The filter is a disjunction of
//! conjunctions over the sort expressions:
//!
//! ```text
//! (c.a > 1) OR (c.a = 1 AND c.b >= "x")
//! ```
//!
//! Only the last clause widens to `>=` / `<=`. Documents equal to the resume
//! point on every sort value pass the filter; the cursor drops those already
//! returned by comparing document ids.
//!
//! Comparisons follow the ORDER BY type ordering (see
//! [`ItemComparer`](super::ItemComparer)), so an undefined value sorts below
//! every defined one.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::errors::{QueryError, QueryResult};

use super::comparer::ItemComparer;
use super::info::SortOrder;
use super::order_by::OrderByItem;

/// Comparison against a literal bound
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// expr = value
    Eq(Value),
    /// expr > value
    Gt(Value),
    /// expr >= value
    Gte(Value),
    /// expr < value
    Lt(Value),
    /// expr <= value
    Lte(Value),
}

impl FilterOp {
    fn symbol(&self) -> &'static str {
        match self {
            FilterOp::Eq(_) => "=",
            FilterOp::Gt(_) => ">",
            FilterOp::Gte(_) => ">=",
            FilterOp::Lt(_) => "<",
            FilterOp::Lte(_) => "<=",
        }
    }

    fn bound(&self) -> &Value {
        match self {
            FilterOp::Eq(v) | FilterOp::Gt(v) | FilterOp::Gte(v) | FilterOp::Lt(v) | FilterOp::Lte(v) => v,
        }
    }

    fn from_symbol(symbol: &str, value: Value) -> Option<Self> {
        match symbol {
            "=" => Some(FilterOp::Eq(value)),
            ">" => Some(FilterOp::Gt(value)),
            ">=" => Some(FilterOp::Gte(value)),
            "<" => Some(FilterOp::Lt(value)),
            "<=" => Some(FilterOp::Lte(value)),
            _ => None,
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Eq(_) => ordering == Ordering::Equal,
            FilterOp::Gt(_) => ordering == Ordering::Greater,
            FilterOp::Gte(_) => ordering != Ordering::Less,
            FilterOp::Lt(_) => ordering == Ordering::Less,
            FilterOp::Lte(_) => ordering != Ordering::Greater,
        }
    }
}

/// One clause of a resume filter
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare { expr: String, op: FilterOp },
    /// `IS_DEFINED(expr)` or `NOT IS_DEFINED(expr)`
    Defined { expr: String, defined: bool },
    Constant(bool),
}

impl Predicate {
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Predicate::Compare { expr, op } => {
                let actual = resolve_path(document, expr);
                op.accepts(ItemComparer::compare(actual, Some(op.bound())))
            }
            Predicate::Defined { expr, defined } => resolve_path(document, expr).is_some() == *defined,
            Predicate::Constant(value) => *value,
        }
    }

    fn equals(expr: &str, item: &OrderByItem) -> Self {
        match item.value() {
            Some(v) => Predicate::Compare {
                expr: expr.to_string(),
                op: FilterOp::Eq(v.clone()),
            },
            None => Predicate::Defined {
                expr: expr.to_string(),
                defined: false,
            },
        }
    }

    /// Clause selecting values past `item` in `order`.
    fn beyond(expr: &str, order: SortOrder, item: &OrderByItem, inclusive: bool) -> Self {
        let expr = expr.to_string();
        match (order, item.value(), inclusive) {
            (SortOrder::Ascending, Some(v), false) => Predicate::Compare { expr, op: FilterOp::Gt(v.clone()) },
            (SortOrder::Ascending, Some(v), true) => Predicate::Compare { expr, op: FilterOp::Gte(v.clone()) },
            (SortOrder::Descending, Some(v), false) => Predicate::Compare { expr, op: FilterOp::Lt(v.clone()) },
            (SortOrder::Descending, Some(v), true) => Predicate::Compare { expr, op: FilterOp::Lte(v.clone()) },
            (SortOrder::Ascending, None, false) => Predicate::Defined { expr, defined: true },
            (SortOrder::Ascending, None, true) => Predicate::Constant(true),
            (SortOrder::Descending, None, false) => Predicate::Constant(false),
            (SortOrder::Descending, None, true) => Predicate::Defined { expr, defined: false },
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { expr, op } => write!(f, "{} {} {}", expr, op.symbol(), op.bound()),
            Predicate::Defined { expr, defined: true } => write!(f, "IS_DEFINED({})", expr),
            Predicate::Defined { expr, defined: false } => write!(f, "NOT IS_DEFINED({})", expr),
            Predicate::Constant(value) => write!(f, "{}", value),
        }
    }
}

/// A disjunction of conjunctions of [`Predicate`]s
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeFilter {
    disjuncts: Vec<Vec<Predicate>>,
}

impl ResumeFilter {
    pub fn match_all() -> Self {
        Self {
            disjuncts: vec![Vec::new()],
        }
    }

    /// Builds the filter selecting documents that sort at or after `values`.
    pub fn build(expressions: &[String], orders: &[SortOrder], values: &[OrderByItem]) -> QueryResult<Self> {
        if expressions.len() != orders.len() || values.len() != orders.len() {
            return Err(QueryError::malformed_continuation(format!(
                "expected {} order-by items, got {}",
                orders.len(),
                values.len()
            )));
        }

        let last = orders.len().saturating_sub(1);
        let mut disjuncts = Vec::with_capacity(orders.len());

        for i in 0..orders.len() {
            let mut conjunct: Vec<Predicate> = (0..i)
                .map(|j| Predicate::equals(&expressions[j], &values[j]))
                .collect();
            let inclusive = i == last;
            conjunct.push(Predicate::beyond(&expressions[i], orders[i], &values[i], inclusive));

            if conjunct.contains(&Predicate::Constant(false)) {
                continue;
            }
            conjunct.retain(|p| *p != Predicate::Constant(true));
            if conjunct.is_empty() {
                return Ok(Self::match_all());
            }
            disjuncts.push(conjunct);
        }

        Ok(Self { disjuncts })
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.disjuncts
            .iter()
            .any(|conjunct| conjunct.iter().all(|p| p.matches(document)))
    }

    pub fn is_match_all(&self) -> bool {
        self.disjuncts.iter().any(Vec::is_empty)
    }

    /// Parses the textual form produced by `Display`.
    pub fn parse(text: &str) -> QueryResult<Self> {
        let invalid = || QueryError::malformed_continuation(format!("invalid resume filter '{}'", text));

        match text.trim() {
            "true" => return Ok(Self::match_all()),
            "false" => return Ok(Self { disjuncts: Vec::new() }),
            _ => {}
        }

        let mut parser = FilterParser { rest: text.trim() };
        let mut disjuncts = Vec::new();
        loop {
            parser.expect("(").ok_or_else(invalid)?;
            let mut conjunct = vec![parser.predicate().ok_or_else(invalid)?];
            while parser.eat(" AND ") {
                conjunct.push(parser.predicate().ok_or_else(invalid)?);
            }
            parser.expect(")").ok_or_else(invalid)?;
            disjuncts.push(conjunct);

            if parser.rest.is_empty() {
                break;
            }
            parser.expect(" OR ").ok_or_else(invalid)?;
        }

        Ok(Self { disjuncts })
    }
}

impl fmt::Display for ResumeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.disjuncts.is_empty() {
            return f.write_str("false");
        }
        if self.is_match_all() {
            return f.write_str("true");
        }

        for (i, conjunct) in self.disjuncts.iter().enumerate() {
            if i > 0 {
                f.write_str(" OR ")?;
            }
            f.write_str("(")?;
            for (j, predicate) in conjunct.iter().enumerate() {
                if j > 0 {
                    f.write_str(" AND ")?;
                }
                write!(f, "{}", predicate)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

struct FilterParser<'a> {
    rest: &'a str,
}

impl<'a> FilterParser<'a> {
    fn eat(&mut self, token: &str) -> bool {
        match self.rest.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn expect(&mut self, token: &str) -> Option<()> {
        self.eat(token).then_some(())
    }

    fn take_until(&mut self, stop: char) -> Option<&'a str> {
        let end = self.rest.find(stop)?;
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        (!taken.is_empty()).then_some(taken)
    }

    fn predicate(&mut self) -> Option<Predicate> {
        if self.eat("NOT IS_DEFINED(") {
            let expr = self.take_until(')')?.to_string();
            self.expect(")")?;
            return Some(Predicate::Defined { expr, defined: false });
        }
        if self.eat("IS_DEFINED(") {
            let expr = self.take_until(')')?.to_string();
            self.expect(")")?;
            return Some(Predicate::Defined { expr, defined: true });
        }

        let expr = self.take_until(' ')?.to_string();
        match expr.as_str() {
            "true" | "false" => return None,
            _ => {}
        }
        self.expect(" ")?;
        let symbol = self.take_until(' ')?;
        self.expect(" ")?;
        let value = self.literal()?;
        let op = FilterOp::from_symbol(symbol, value)?;
        Some(Predicate::Compare { expr, op })
    }

    fn literal(&mut self) -> Option<Value> {
        match self.rest.as_bytes().first()? {
            b'"' | b'[' | b'{' => {
                let mut stream = serde_json::Deserializer::from_str(self.rest).into_iter::<Value>();
                let value = stream.next()?.ok()?;
                let consumed = stream.byte_offset();
                self.rest = &self.rest[consumed..];
                Some(value)
            }
            _ => {
                let end = self
                    .rest
                    .find(|c: char| c == ' ' || c == ')')
                    .unwrap_or(self.rest.len());
                let (scalar, rest) = self.rest.split_at(end);
                self.rest = rest;
                serde_json::from_str(scalar).ok()
            }
        }
    }
}

/// Resolves a dotted path such as `c.address.city` against a document; the
/// leading segment names the document itself.
pub fn resolve_path<'v>(document: &'v Value, expr: &str) -> Option<&'v Value> {
    let mut segments = expr.split('.');
    segments.next()?;
    segments.try_fold(document, |value, segment| value.get(segment))
}
