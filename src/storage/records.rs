use anyhow::Result;
use sqlx::QueryBuilder;
use std::collections::HashSet;
use std::sync::Arc;

use super::schema::Database;
use super::types::{AuthorQuery, RecordDbRow, TimeWindow};
use crate::record::{kind, AuthorId, Record};

/// Upper bound on rows returned by a single author query.
const MAX_RECORDS: usize = 500;

/// 10 bound columns per row; 50 rows stays well under SQLite's parameter limit.
const INSERT_BATCH_SIZE: usize = 50;

const RECORD_COLUMNS: &str = "id, author, kind, created_at, tags, content";

impl Database {
    // ========================================================================
    // Record Operations
    // ========================================================================

    /// Insert records, skipping ids already stored. Returns the number of new rows.
    ///
    /// Also fills the `record_refs` reverse index for every `e` reference.
    pub async fn store_records(&self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut total_inserted = 0usize;

        for chunk in records.chunks(INSERT_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO records \
                 (id, author, kind, created_at, tags, content, parent_id, root_id, repost_of, received_at) ",
            );
            builder.push_values(chunk, |mut b, record| {
                let tags = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());
                b.push_bind(record.id.to_string())
                    .push_bind(record.author.to_string())
                    .push_bind(i64::from(record.kind))
                    .push_bind(record.created_at)
                    .push_bind(tags)
                    .push_bind(record.content.clone())
                    .push_bind(record.parent_id().map(str::to_string))
                    .push_bind(record.root_id().map(str::to_string))
                    .push_bind(record.repost_target().map(str::to_string))
                    .push_bind(now);
            });
            builder.build().execute(&mut *tx).await?;

            let changes: (i64,) = sqlx::query_as("SELECT changes()")
                .fetch_one(&mut *tx)
                .await?;
            total_inserted += changes.0 as usize;

            let refs: Vec<(&str, &str)> = chunk
                .iter()
                .flat_map(|r| {
                    let mut seen = HashSet::new();
                    r.references()
                        .filter(move |target| seen.insert(*target))
                        .map(move |target| (&*r.id, target))
                })
                .collect();

            for ref_chunk in refs.chunks(INSERT_BATCH_SIZE * 4) {
                let mut ref_builder: QueryBuilder<sqlx::Sqlite> =
                    QueryBuilder::new("INSERT OR IGNORE INTO record_refs (record_id, target_id) ");
                ref_builder.push_values(ref_chunk, |mut b, (record_id, target_id)| {
                    b.push_bind(record_id.to_string())
                        .push_bind(target_id.to_string());
                });
                ref_builder.build().execute(&mut *tx).await?;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            received = records.len(),
            inserted = total_inserted,
            "Stored records"
        );
        Ok(total_inserted)
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<Record>> {
        let row: Option<RecordDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM records WHERE id = ?",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RecordDbRow::into_record))
    }

    /// Newest-first records by any of `query.authors`, bounded by the query window.
    pub async fn records_by_authors(&self, query: &AuthorQuery) -> Result<Vec<Record>> {
        if query.authors.is_empty() || query.kinds.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM records WHERE author IN (",
            RECORD_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for author in &query.authors {
            separated.push_bind(author.to_string());
        }
        separated.push_unseparated(") AND kind IN (");
        let mut separated = builder.separated(", ");
        for k in &query.kinds {
            separated.push_bind(i64::from(*k));
        }
        separated.push_unseparated(")");

        match query.window {
            TimeWindow::Latest => {}
            TimeWindow::Since(since) => {
                builder.push(" AND created_at >= ").push_bind(since);
            }
            TimeWindow::Until(until) => {
                builder.push(" AND created_at <= ").push_bind(until);
            }
        }
        if query.hide_replies {
            builder.push(" AND parent_id IS NULL");
        }
        builder
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(query.limit.min(MAX_RECORDS) as i64);

        let rows: Vec<RecordDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(RecordDbRow::into_record).collect())
    }

    pub async fn records_referencing(&self, target_id: &str) -> Result<Vec<Record>> {
        let rows: Vec<RecordDbRow> = sqlx::query_as(
            "SELECT r.id, r.author, r.kind, r.created_at, r.tags, r.content \
             FROM records r JOIN record_refs f ON f.record_id = r.id \
             WHERE f.target_id = ? ORDER BY r.created_at DESC, r.id ASC",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RecordDbRow::into_record).collect())
    }

    pub async fn authors_with_profiles(&self, authors: &[AuthorId]) -> Result<HashSet<AuthorId>> {
        if authors.is_empty() {
            return Ok(HashSet::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT DISTINCT author FROM records WHERE kind = ");
        builder.push_bind(i64::from(kind::PROFILE));
        builder.push(" AND author IN (");
        let mut separated = builder.separated(", ");
        for author in authors {
            separated.push_bind(author.to_string());
        }
        separated.push_unseparated(")");

        let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(a,)| Arc::from(a)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn post(id: &str, author: &str, created_at: i64, tags: Vec<Vec<&str>>) -> Record {
        Record {
            id: id.into(),
            author: author.into(),
            kind: kind::POST,
            created_at,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: format!("content of {}", id),
        }
    }

    fn query(authors: &[&str], window: TimeWindow, limit: usize) -> AuthorQuery {
        AuthorQuery {
            authors: authors.iter().map(|a| Arc::from(*a)).collect(),
            kinds: kind::FEED_KINDS.to_vec(),
            window,
            limit,
            hide_replies: false,
        }
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| &*r.id).collect()
    }

    #[tokio::test]
    async fn test_store_records_counts_only_new_rows() {
        let db = test_db().await;
        let records = vec![post("a", "alice", 10, vec![]), post("b", "alice", 20, vec![])];

        assert_eq!(db.store_records(&records).await.unwrap(), 2);
        assert_eq!(db.store_records(&records).await.unwrap(), 0);

        let more = vec![post("b", "alice", 20, vec![]), post("c", "bob", 30, vec![])];
        assert_eq!(db.store_records(&more).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_record_round_trips_tags() {
        let db = test_db().await;
        let reply = post("r", "bob", 10, vec![vec!["e", "p", "", "reply"]]);
        db.store_records(std::slice::from_ref(&reply)).await.unwrap();

        let loaded = db.get_record("r").await.unwrap().unwrap();
        assert_eq!(loaded, reply);
        assert_eq!(loaded.parent_id(), Some("p"));
        assert!(db.get_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_by_authors_windows() {
        let db = test_db().await;
        let records: Vec<Record> = (1..=6)
            .map(|i| post(&format!("n{}", i), "alice", i * 100, vec![]))
            .collect();
        db.store_records(&records).await.unwrap();
        db.store_records(&[post("x", "mallory", 700, vec![])])
            .await
            .unwrap();

        let latest = db
            .records_by_authors(&query(&["alice"], TimeWindow::Latest, 3))
            .await
            .unwrap();
        assert_eq!(ids(&latest), vec!["n6", "n5", "n4"]);

        let since = db
            .records_by_authors(&query(&["alice"], TimeWindow::Since(400), 10))
            .await
            .unwrap();
        assert_eq!(ids(&since), vec!["n6", "n5", "n4"]);

        let until = db
            .records_by_authors(&query(&["alice"], TimeWindow::Until(300), 2))
            .await
            .unwrap();
        assert_eq!(ids(&until), vec!["n3", "n2"]);
    }

    #[tokio::test]
    async fn test_records_by_authors_hides_replies() {
        let db = test_db().await;
        db.store_records(&[
            post("root", "alice", 10, vec![]),
            post("reply", "alice", 20, vec![vec!["e", "root", "", "reply"]]),
        ])
        .await
        .unwrap();

        let mut q = query(&["alice"], TimeWindow::Latest, 10);
        q.hide_replies = true;
        let visible = db.records_by_authors(&q).await.unwrap();
        assert_eq!(ids(&visible), vec!["root"]);
    }

    #[tokio::test]
    async fn test_records_by_authors_empty_inputs() {
        let db = test_db().await;
        let none = db
            .records_by_authors(&query(&[], TimeWindow::Latest, 10))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_records_referencing() {
        let db = test_db().await;
        db.store_records(&[
            post("p", "alice", 10, vec![]),
            post("r1", "bob", 20, vec![vec!["e", "p", "", "reply"]]),
            post("r2", "carol", 30, vec![vec!["e", "p"], vec!["e", "p"]]),
            post("other", "dave", 40, vec![vec!["e", "q"]]),
        ])
        .await
        .unwrap();

        let refs = db.records_referencing("p").await.unwrap();
        assert_eq!(ids(&refs), vec!["r2", "r1"]);
    }

    #[tokio::test]
    async fn test_authors_with_profiles() {
        let db = test_db().await;
        let mut profile = post("prof", "alice", 5, vec![]);
        profile.kind = kind::PROFILE;
        db.store_records(&[profile, post("n", "bob", 6, vec![])])
            .await
            .unwrap();

        let known = db
            .authors_with_profiles(&[Arc::from("alice"), Arc::from("bob")])
            .await
            .unwrap();
        assert_eq!(known.len(), 1);
        assert!(known.contains("alice"));
    }
}
