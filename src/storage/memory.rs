//! In-process store with the same query semantics as [`Database`].
//!
//! Used by engine tests and by embedders that keep records elsewhere.
//!
//! [`Database`]: super::Database
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::traits::{ListStateStore, RecordStore};
use super::types::{AuthorQuery, ListState, TimeWindow};
use crate::record::{kind, AuthorId, Record};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, Record>,
    states: HashMap<String, ListState>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_by_authors(&self, query: &AuthorQuery) -> Result<Vec<Record>> {
        let inner = self.lock();
        let mut found: Vec<Record> = inner
            .records
            .values()
            .filter(|r| query.authors.contains(&r.author) && query.kinds.contains(&r.kind))
            .filter(|r| match query.window {
                TimeWindow::Latest => true,
                TimeWindow::Since(since) => r.created_at >= since,
                TimeWindow::Until(until) => r.created_at <= until,
            })
            .filter(|r| !query.hide_replies || r.parent_id().is_none())
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        found.truncate(query.limit);
        Ok(found)
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.lock().records.get(id).cloned())
    }

    async fn fetch_by_relation_target(&self, target_id: &str) -> Result<Vec<Record>> {
        let inner = self.lock();
        let mut found: Vec<Record> = inner
            .records
            .values()
            .filter(|r| r.references().any(|t| t == target_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn insert_records(&self, records: &[Record]) -> Result<usize> {
        let mut inner = self.lock();
        let mut inserted = 0;
        for record in records {
            if !inner.records.contains_key(&*record.id) {
                inner.records.insert(record.id.to_string(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn known_profiles(&self, authors: &[AuthorId]) -> Result<HashSet<AuthorId>> {
        let inner = self.lock();
        Ok(inner
            .records
            .values()
            .filter(|r| r.kind == kind::PROFILE && authors.contains(&r.author))
            .map(|r| r.author.clone())
            .collect())
    }
}

#[async_trait]
impl ListStateStore for MemoryStore {
    async fn save_state(&self, state: &ListState) -> Result<()> {
        self.lock()
            .states
            .insert(state.feed_id.clone(), state.clone());
        Ok(())
    }

    async fn load_state(&self, feed_id: &str) -> Result<Option<ListState>> {
        Ok(self.lock().states.get(feed_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn post(id: &str, author: &str, created_at: i64, parent: Option<&str>) -> Record {
        Record {
            id: id.into(),
            author: author.into(),
            kind: kind::POST,
            created_at,
            tags: parent
                .map(|p| vec![vec!["e".to_string(), p.to_string()]])
                .unwrap_or_default(),
            content: String::new(),
        }
    }

    #[tokio::test]
    async fn test_queries_match_database_semantics() {
        let store = MemoryStore::new();
        let inserted = store
            .insert_records(&[
                post("a", "alice", 10, None),
                post("b", "alice", 20, Some("a")),
                post("c", "bob", 30, None),
                post("a", "alice", 10, None),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        let query = AuthorQuery {
            authors: vec![Arc::from("alice")],
            kinds: kind::FEED_KINDS.to_vec(),
            window: TimeWindow::Since(5),
            limit: 10,
            hide_replies: false,
        };
        let ids: Vec<String> = store
            .fetch_by_authors(&query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        let replies = store.fetch_by_relation_target("a").await.unwrap();
        assert_eq!(replies.len(), 1);

        let hidden = AuthorQuery {
            hide_replies: true,
            ..query
        };
        assert_eq!(store.fetch_by_authors(&hidden).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_state_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_state("home").await.unwrap().is_none());
        let state = ListState {
            feed_id: "home".into(),
            last_appeared_id: Some(Arc::from("x")),
            ..Default::default()
        };
        store.save_state(&state).await.unwrap();
        assert_eq!(store.load_state("home").await.unwrap(), Some(state));
    }
}
