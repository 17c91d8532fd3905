//! Resource ids
//!
//! A rid is the base64 encoding (with `/` written as `-`) of a binary id
//! whose trailing eight bytes are the big-endian document id. Tie-breaks
//! between equal sort values compare document ids.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

const ENCODED_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    collection: u32,
    document: u64,
}

impl ResourceId {
    pub fn new(collection: u32, document: u64) -> Self {
        Self {
            collection,
            document,
        }
    }

    pub fn collection(&self) -> u32 {
        self.collection
    }

    pub fn document(&self) -> u64 {
        self.document
    }

    /// Parses a rid; `None` if it is not valid base64 or too short to hold a
    /// document id.
    pub fn parse(rid: &str) -> Option<Self> {
        let bytes = STANDARD.decode(rid.replace('-', "/")).ok()?;
        if bytes.len() < 8 {
            return None;
        }

        let (head, tail) = bytes.split_at(bytes.len() - 8);
        let document = u64::from_be_bytes(tail.try_into().ok()?);
        let collection = if head.len() >= 8 {
            u32::from_be_bytes(head[4..8].try_into().ok()?)
        } else {
            0
        };

        Some(Self {
            collection,
            document,
        })
    }

    pub fn encode(&self) -> String {
        let mut bytes = [0u8; ENCODED_LEN];
        bytes[4..8].copy_from_slice(&self.collection.to_be_bytes());
        bytes[8..].copy_from_slice(&self.document.to_be_bytes());
        STANDARD.encode(bytes).replace('/', "-")
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
