//! Distinct membership tracking
//!
//! # Variants
//!
//! - Ordered: duplicates arrive adjacent, so only the previous hash is kept
//! - Unordered: exact storage for flags, numbers and short strings; a
//!   structural hash for everything else

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::hash::{number_bits, DistinctHash};

/// Strings up to this many bytes are stored verbatim
const MAX_EXACT_STRING_LEN: usize = 16;

const SEEN_UNDEFINED: u8 = 1;
const SEEN_NULL: u8 = 1 << 1;
const SEEN_FALSE: u8 = 1 << 2;
const SEEN_TRUE: u8 = 1 << 3;

/// Tracker for values adjacent in the output order
#[derive(Debug, Clone, Default)]
pub struct OrderedDistinctMap {
    last_hash: Option<DistinctHash>,
}

impl OrderedDistinctMap {
    pub fn new(last_hash: Option<DistinctHash>) -> Self {
        Self { last_hash }
    }

    /// Returns true when `value` differs from the previous value.
    pub fn add(&mut self, value: Option<&Value>) -> bool {
        let hash = DistinctHash::of(value);
        if self.last_hash == Some(hash) {
            return false;
        }
        self.last_hash = Some(hash);
        true
    }

    pub fn last_hash(&self) -> Option<DistinctHash> {
        self.last_hash
    }
}

/// Tracker for values in arbitrary order
#[derive(Debug, Clone, Default)]
pub struct UnorderedDistinctMap {
    simple: u8,
    numbers: HashSet<u64>,
    strings: HashSet<String>,
    hashes: HashSet<DistinctHash>,
}

impl UnorderedDistinctMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time `value` is seen.
    pub fn add(&mut self, value: Option<&Value>) -> bool {
        match value {
            None => self.add_flag(SEEN_UNDEFINED),
            Some(Value::Null) => self.add_flag(SEEN_NULL),
            Some(Value::Bool(false)) => self.add_flag(SEEN_FALSE),
            Some(Value::Bool(true)) => self.add_flag(SEEN_TRUE),
            Some(Value::Number(n)) => self.numbers.insert(number_bits(n)),
            Some(Value::String(s)) if s.len() <= MAX_EXACT_STRING_LEN => self.strings.insert(s.clone()),
            Some(other) => self.hashes.insert(DistinctHash::of(Some(other))),
        }
    }

    pub fn len(&self) -> usize {
        self.simple.count_ones() as usize + self.numbers.len() + self.strings.len() + self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_flag(&mut self, flag: u8) -> bool {
        let fresh = self.simple & flag == 0;
        self.simple |= flag;
        fresh
    }

    /// Serializable snapshot with deterministic ordering
    pub fn to_state(&self) -> UnorderedDistinctState {
        let mut numbers: Vec<f64> = self.numbers.iter().map(|bits| f64::from_bits(*bits)).collect();
        numbers.sort_by(f64::total_cmp);

        let mut strings: Vec<String> = self.strings.iter().cloned().collect();
        strings.sort();

        let mut hashes: Vec<DistinctHash> = self.hashes.iter().copied().collect();
        hashes.sort();

        UnorderedDistinctState {
            simple: self.simple,
            numbers,
            strings,
            hashes,
        }
    }

    pub fn from_state(state: UnorderedDistinctState) -> Self {
        Self {
            simple: state.simple,
            numbers: state.numbers.into_iter().map(f64::to_bits).collect(),
            strings: state.strings.into_iter().collect(),
            hashes: state.hashes.into_iter().collect(),
        }
    }
}

/// Wire form of an [`UnorderedDistinctMap`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnorderedDistinctState {
    pub simple: u8,
    pub numbers: Vec<f64>,
    pub strings: Vec<String>,
    pub hashes: Vec<DistinctHash>,
}

/// Either distinct variant
#[derive(Debug, Clone)]
pub enum DistinctMap {
    Ordered(OrderedDistinctMap),
    Unordered(UnorderedDistinctMap),
}

impl DistinctMap {
    /// Returns true when `value` should be emitted.
    pub fn add(&mut self, value: Option<&Value>) -> bool {
        match self {
            DistinctMap::Ordered(map) => map.add(value),
            DistinctMap::Unordered(map) => map.add(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ordered_drops_adjacent_only() {
        let mut map = OrderedDistinctMap::default();
        let values = [json!(1), json!(1), json!(2), json!(1)];
        let emitted: Vec<bool> = values.iter().map(|v| map.add(Some(v))).collect();
        assert_eq!(emitted, vec![true, false, true, true]);
    }

    #[test]
    fn test_ordered_seeded_from_hash() {
        let hash = DistinctHash::of(Some(&json!("a")));
        let mut map = OrderedDistinctMap::new(Some(hash));
        assert!(!map.add(Some(&json!("a"))));
        assert!(map.add(Some(&json!("b"))));
    }

    #[test]
    fn test_unordered_all_kinds() {
        let mut map = UnorderedDistinctMap::new();
        let long = "a string longer than sixteen bytes";
        let values = [
            None,
            Some(json!(null)),
            Some(json!(true)),
            Some(json!(false)),
            Some(json!(3)),
            Some(json!("short")),
            Some(json!(long)),
            Some(json!({"k": [1, 2]})),
        ];

        for v in &values {
            assert!(map.add(v.as_ref()));
        }
        for v in &values {
            assert!(!map.add(v.as_ref()));
        }
        assert!(!map.add(Some(&json!(3.0))));
        assert!(!map.add(Some(&json!({"k": [1, 2]}))));
        assert_eq!(map.len(), values.len());
    }

    #[test]
    fn test_unordered_state_restores_membership() {
        let mut map = UnorderedDistinctMap::new();
        map.add(Some(&json!(1.5)));
        map.add(Some(&json!("x")));
        map.add(Some(&json!([1])));
        map.add(Some(&json!(null)));

        let encoded = serde_json::to_value(map.to_state()).unwrap();
        let state: UnorderedDistinctState = serde_json::from_value(encoded).unwrap();
        let mut restored = UnorderedDistinctMap::from_state(state);

        assert!(!restored.add(Some(&json!(1.5))));
        assert!(!restored.add(Some(&json!("x"))));
        assert!(!restored.add(Some(&json!([1]))));
        assert!(!restored.add(Some(&json!(null))));
        assert!(restored.add(Some(&json!(2))));
    }
}
