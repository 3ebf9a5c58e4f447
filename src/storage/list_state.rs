use anyhow::Result;

use super::schema::Database;
use super::types::{ListState, ListStateDbRow};

/// Persisted leaf lists are capped; only the head matters for restoring position.
const MAX_SAVED_LEAFS: usize = 100;

impl Database {
    // ========================================================================
    // List State Operations
    // ========================================================================

    pub async fn save_list_state(&self, state: &ListState) -> Result<()> {
        let leafs: Vec<&str> = state
            .leafs
            .iter()
            .take(MAX_SAVED_LEAFS)
            .map(|id| &**id)
            .collect();
        let leafs = serde_json::to_string(&leafs)?;

        sqlx::query(
            r#"
            INSERT INTO list_state (feed_id, last_appeared_id, last_read_id, leafs, hide_replies, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id) DO UPDATE SET
                last_appeared_id = excluded.last_appeared_id,
                last_read_id = excluded.last_read_id,
                leafs = excluded.leafs,
                hide_replies = excluded.hide_replies,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(&state.feed_id)
        .bind(state.last_appeared_id.as_deref())
        .bind(state.last_read_id.as_deref())
        .bind(leafs)
        .bind(state.hide_replies)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        tracing::debug!(feed_id = %state.feed_id, leafs = state.leafs.len(), "Saved list state");
        Ok(())
    }

    pub async fn load_list_state(&self, feed_id: &str) -> Result<Option<ListState>> {
        let row: Option<ListStateDbRow> = sqlx::query_as(
            "SELECT feed_id, last_appeared_id, last_read_id, leafs, hide_replies \
             FROM list_state WHERE feed_id = ?",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ListStateDbRow::into_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_load_missing_state() {
        let db = test_db().await;
        assert_eq!(db.load_list_state("following").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load_overwrites() {
        let db = test_db().await;
        let mut state = ListState {
            feed_id: "following".to_string(),
            last_appeared_id: Some(Arc::from("b")),
            last_read_id: Some(Arc::from("a")),
            leafs: vec![Arc::from("c"), Arc::from("b"), Arc::from("a")],
            hide_replies: false,
        };
        db.save_list_state(&state).await.unwrap();
        assert_eq!(db.load_list_state("following").await.unwrap(), Some(state.clone()));

        state.hide_replies = true;
        state.last_appeared_id = None;
        db.save_list_state(&state).await.unwrap();
        assert_eq!(db.load_list_state("following").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_saved_leafs_are_capped() {
        let db = test_db().await;
        let state = ListState {
            feed_id: "big".to_string(),
            leafs: (0..250).map(|i| Arc::from(format!("id{}", i))).collect(),
            ..Default::default()
        };
        db.save_list_state(&state).await.unwrap();

        let loaded = db.load_list_state("big").await.unwrap().unwrap();
        assert_eq!(loaded.leafs.len(), MAX_SAVED_LEAFS);
        assert_eq!(&*loaded.leafs[0], "id0");
    }
}
