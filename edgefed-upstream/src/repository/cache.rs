//! Read-through cache of upstream representations.

use dashmap::DashMap;
use edgefed_types::RevisionTag;
use uuid::Uuid;

/// A cached representation and the revision it was fetched at.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub value: serde_json::Value,
    pub revision: Option<RevisionTag>,
}

/// Cache consulted by repositories before reading upstream.
pub trait ResourceCache: Send + Sync {
    fn get(&self, collection: &str, key: Uuid) -> Option<CachedEntry>;

    fn put(&self, collection: &str, key: Uuid, entry: CachedEntry);

    fn remove(&self, collection: &str, key: Uuid);
}

/// In-memory cache keyed by collection and key.
#[derive(Debug, Default)]
pub struct MemoryResourceCache {
    entries: DashMap<(String, Uuid), CachedEntry>,
}

impl MemoryResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, collection: &str, key: Uuid) -> bool {
        self.entries.contains_key(&(collection.to_string(), key))
    }
}

impl ResourceCache for MemoryResourceCache {
    fn get(&self, collection: &str, key: Uuid) -> Option<CachedEntry> {
        self.entries
            .get(&(collection.to_string(), key))
            .map(|e| e.value().clone())
    }

    fn put(&self, collection: &str, key: Uuid, entry: CachedEntry) {
        self.entries.insert((collection.to_string(), key), entry);
    }

    fn remove(&self, collection: &str, key: Uuid) {
        self.entries.remove(&(collection.to_string(), key));
    }
}
