use super::Repository;
use crate::error::ClientResult;
use crate::model::Resource;
use crate::query::Filter;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Repository held in process memory.
///
/// Stands in for the node's local store where a [`Repository`] is expected.
#[derive(Debug)]
pub struct MemoryRepository<T> {
    records: RwLock<BTreeMap<Uuid, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Resource> MemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository pre-filled with `items`; items without a key get one.
    pub fn with_records(items: impl IntoIterator<Item = T>) -> Self {
        let repo = Self::new();
        for item in items {
            repo.store(item);
        }
        repo
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of every record.
    pub fn all(&self) -> Vec<T> {
        self.records.read().values().cloned().collect()
    }

    fn store(&self, mut item: T) -> T {
        let key = item.key().unwrap_or_else(|| {
            let key = Uuid::now_v7();
            item.set_key(key);
            key
        });
        self.records.write().insert(key, item.clone());
        item
    }
}

#[async_trait]
impl<T: Resource> Repository<T> for MemoryRepository<T> {
    async fn get(&self, key: Uuid) -> ClientResult<Option<T>> {
        Ok(self.records.read().get(&key).cloned())
    }

    async fn insert(&self, item: T) -> ClientResult<T> {
        Ok(self.store(item))
    }

    async fn save(&self, item: T) -> ClientResult<T> {
        Ok(self.store(item))
    }

    async fn delete(&self, key: Uuid) -> ClientResult<Option<T>> {
        Ok(self.records.write().remove(&key))
    }

    async fn find(&self, filter: Filter) -> ClientResult<Vec<T>> {
        let records = self.records.read();
        let mut matches = Vec::new();
        for record in records.values() {
            if filter.matches(&serde_json::to_value(record)?) {
                matches.push(record.clone());
            }
        }
        Ok(matches)
    }
}
