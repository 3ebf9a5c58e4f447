use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::record::{Record, RecordId};

const DEFAULT_CAPACITY: usize = 1000;

/// LRU of records recently loaded as ancestors, so deep threads do not hit
/// the store once per hop on every merge.
pub struct RecordCache {
    inner: LruCache<RecordId, Arc<Record>>,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, id: &str) -> Option<Arc<Record>> {
        self.inner.get(id).cloned()
    }

    pub fn put(&mut self, record: Arc<Record>) {
        self.inner.put(record.id.clone(), record);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> Arc<Record> {
        Arc::new(Record {
            id: id.into(),
            author: "alice".into(),
            kind: 1,
            created_at: 0,
            tags: Vec::new(),
            content: String::new(),
        })
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = RecordCache::new(2);
        cache.put(record("a"));
        cache.put(record("b"));
        assert!(cache.get("a").is_some());
        cache.put(record("c"));

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_falls_back_to_default() {
        let mut cache = RecordCache::new(0);
        cache.put(record("a"));
        assert!(cache.get("a").is_some());
    }
}
