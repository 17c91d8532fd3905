//! Structural value hashing
//!
//! Values are fed into a salted SHA-256 as a self-delimiting encoding: a type
//! tag, then a length prefix for strings, arrays and objects. Object keys are
//! visited in sorted order, so key order never affects the hash. The digest
//! is truncated to 192 bits; collisions are accepted.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

const SALT: &[u8] = b"crossquery.distinct.v1";

const HASH_LEN: usize = 24;

const TAG_UNDEFINED: u8 = 0;
const TAG_NULL: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_TRUE: u8 = 3;
const TAG_NUMBER: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_OBJECT: u8 = 7;

/// 192-bit structural hash of a JSON value
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DistinctHash([u8; HASH_LEN]);

impl DistinctHash {
    /// Hashes a value; `None` stands for undefined.
    pub fn of(value: Option<&Value>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SALT);
        feed(&mut hasher, value);

        let digest = hasher.finalize();
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest[..HASH_LEN]);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        let bytes = STANDARD.decode(encoded).ok()?;
        let bytes: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

/// Canonical bits of a number: integers and floats with the same value hash
/// alike, and -0 equals 0.
pub(crate) fn number_bits(n: &serde_json::Number) -> u64 {
    let value = n.as_f64().unwrap_or(0.0);
    if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

fn feed(hasher: &mut Sha256, value: Option<&Value>) {
    match value {
        None => hasher.update([TAG_UNDEFINED]),
        Some(Value::Null) => hasher.update([TAG_NULL]),
        Some(Value::Bool(false)) => hasher.update([TAG_FALSE]),
        Some(Value::Bool(true)) => hasher.update([TAG_TRUE]),
        Some(Value::Number(n)) => {
            hasher.update([TAG_NUMBER]);
            hasher.update(number_bits(n).to_be_bytes());
        }
        Some(Value::String(s)) => {
            hasher.update([TAG_STRING]);
            feed_str(hasher, s);
        }
        Some(Value::Array(items)) => {
            hasher.update([TAG_ARRAY]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed(hasher, Some(item));
            }
        }
        Some(Value::Object(map)) => {
            hasher.update([TAG_OBJECT]);
            hasher.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                feed_str(hasher, key);
                feed(hasher, map.get(key));
            }
        }
    }
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

impl fmt::Debug for DistinctHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DistinctHash({})", self.to_base64())
    }
}

impl Serialize for DistinctHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for DistinctHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        DistinctHash::from_base64(&encoded)
            .ok_or_else(|| de::Error::custom(format!("invalid distinct hash '{}'", encoded)))
    }
}
