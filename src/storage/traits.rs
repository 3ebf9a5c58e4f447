//! Ports the feed engine talks to. `Database` implements both; tests and
//! embedders can substitute their own.
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{AuthorQuery, ListState};
use crate::record::{AuthorId, Record};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fails when the store cannot serve requests at all.
    async fn ping(&self) -> Result<()>;

    async fn fetch_by_authors(&self, query: &AuthorQuery) -> Result<Vec<Record>>;

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Record>>;

    /// Records whose tags reference `target_id` (replies, reposts, mentions).
    async fn fetch_by_relation_target(&self, target_id: &str) -> Result<Vec<Record>>;

    /// Insert records, ignoring ones already stored. Returns how many were new.
    async fn insert_records(&self, records: &[Record]) -> Result<usize>;

    /// Subset of `authors` for which a profile record is stored.
    async fn known_profiles(&self, authors: &[AuthorId]) -> Result<HashSet<AuthorId>>;
}

#[async_trait]
pub trait ListStateStore: Send + Sync {
    async fn save_state(&self, state: &ListState) -> Result<()>;

    async fn load_state(&self, feed_id: &str) -> Result<Option<ListState>>;
}

#[async_trait]
impl RecordStore for Database {
    async fn ping(&self) -> Result<()> {
        Database::ping(self).await?;
        Ok(())
    }

    async fn fetch_by_authors(&self, query: &AuthorQuery) -> Result<Vec<Record>> {
        self.records_by_authors(query).await
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Record>> {
        self.get_record(id).await
    }

    async fn fetch_by_relation_target(&self, target_id: &str) -> Result<Vec<Record>> {
        self.records_referencing(target_id).await
    }

    async fn insert_records(&self, records: &[Record]) -> Result<usize> {
        self.store_records(records).await
    }

    async fn known_profiles(&self, authors: &[AuthorId]) -> Result<HashSet<AuthorId>> {
        self.authors_with_profiles(authors).await
    }
}

#[async_trait]
impl ListStateStore for Database {
    async fn save_state(&self, state: &ListState) -> Result<()> {
        self.save_list_state(state).await
    }

    async fn load_state(&self, feed_id: &str) -> Result<Option<ListState>> {
        self.load_list_state(feed_id).await
    }
}
