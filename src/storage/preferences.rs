use anyhow::Result;
use std::sync::Arc;

use super::schema::Database;
use crate::feed::filter::FilterLists;

const BLOCKED_KEY: &str = "filters.blocked";
const MUTED_ROOTS_KEY: &str = "filters.muted_roots";
const MUTED_WORDS_KEY: &str = "filters.muted_words";

impl Database {
    // ========================================================================
    // User Preferences Operations
    // ========================================================================

    /// Get a single preference value by key.
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM user_preferences WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a preference value (UPSERT).
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load the block and mute lists. Missing keys yield empty lists; a
    /// corrupt value is logged and treated as empty.
    pub async fn load_filter_lists(&self) -> Result<FilterLists> {
        let blocked = self.get_string_list(BLOCKED_KEY).await?;
        let muted_roots = self.get_string_list(MUTED_ROOTS_KEY).await?;
        let muted_words = self.get_string_list(MUTED_WORDS_KEY).await?;

        Ok(FilterLists {
            blocked: blocked.into_iter().map(Arc::from).collect(),
            muted_roots: muted_roots.into_iter().map(Arc::from).collect(),
            muted_words,
        })
    }

    pub async fn save_filter_lists(&self, lists: &FilterLists) -> Result<()> {
        let mut blocked: Vec<&str> = lists.blocked.iter().map(|a| &**a).collect();
        blocked.sort_unstable();
        let mut muted_roots: Vec<&str> = lists.muted_roots.iter().map(|id| &**id).collect();
        muted_roots.sort_unstable();

        self.set_preference(BLOCKED_KEY, &serde_json::to_string(&blocked)?)
            .await?;
        self.set_preference(MUTED_ROOTS_KEY, &serde_json::to_string(&muted_roots)?)
            .await?;
        self.set_preference(MUTED_WORDS_KEY, &serde_json::to_string(&lists.muted_words)?)
            .await?;
        Ok(())
    }

    async fn get_string_list(&self, key: &str) -> Result<Vec<String>> {
        let Some(raw) = self.get_preference(key).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(key = %key, error = %e, "Ignoring malformed preference value");
            Vec::new()
        }))
    }
}
