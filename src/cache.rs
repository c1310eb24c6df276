//! Content-addressed cache of schema entries
//!
//! Maps the cache key of a schema document to the arena slot holding its
//! entry, so structurally equal documents share one compiled validator.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::schema::EntryId;

/// Custom serialization used for cache keys
pub type SerializeFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// How cache keys are derived from documents
#[derive(Clone, Default)]
pub enum KeySerializer {
    /// Digest of the sorted-key serialization
    #[default]
    Canonical,
    /// Digest of a caller-provided serialization
    Custom(SerializeFn),
    /// Allocation identity of the document; no structural deduplication
    Disabled,
}

impl fmt::Debug for KeySerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical => f.write_str("Canonical"),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

impl KeySerializer {
    /// Compute the cache key of a document
    pub fn key(&self, document: &Arc<Value>) -> CacheKey {
        match self {
            Self::Canonical => CacheKey::Digest(Checksum::from_json(document)),
            Self::Custom(serialize) => CacheKey::Digest(Checksum::from_str(&serialize(document))),
            Self::Disabled => CacheKey::Identity(Arc::as_ptr(document) as usize),
        }
    }
}

/// Cache key of a schema document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Digest(Checksum),
    Identity(usize),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digest(checksum) => write!(f, "{}", checksum),
            Self::Identity(addr) => write!(f, "@{:x}", addr),
        }
    }
}

/// Identity/dedup cache; entries leave only by explicit deletion
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: HashMap<CacheKey, EntryId>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<EntryId> {
        self.entries.get(key).copied()
    }

    pub fn put(&mut self, key: CacheKey, entry: EntryId) {
        self.entries.insert(key, entry);
    }

    pub fn delete(&mut self, key: &CacheKey) -> Option<EntryId> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
