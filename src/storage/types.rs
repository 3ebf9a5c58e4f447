use std::sync::Arc;
use thiserror::Error;

use crate::record::{AuthorId, Record, RecordId};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has locked the database
    #[error("Another instance of threadline appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map lock-related sqlx errors to `InstanceLocked`
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Query Types
// ============================================================================

/// Time bound of an author query. Results are always newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    /// The newest records regardless of age.
    Latest,
    /// The newest records with `created_at >= since`.
    Since(i64),
    /// The newest records with `created_at <= until`.
    Until(i64),
}

/// Records by a set of authors, used for every local feed fetch.
#[derive(Debug, Clone)]
pub struct AuthorQuery {
    pub authors: Vec<AuthorId>,
    pub kinds: Vec<u32>,
    pub window: TimeWindow,
    pub limit: usize,
    /// Exclude records that reply to something.
    pub hide_replies: bool,
}

/// Persisted reading position of one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListState {
    pub feed_id: String,
    pub last_appeared_id: Option<RecordId>,
    pub last_read_id: Option<RecordId>,
    pub leafs: Vec<RecordId>,
    pub hide_replies: bool,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for record queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RecordDbRow {
    pub id: String,
    pub author: String,
    pub kind: i64,
    pub created_at: i64,
    pub tags: String,
    pub content: String,
}

impl RecordDbRow {
    /// Rows with undecodable tags still load; they just lose their relations.
    pub fn into_record(self) -> Record {
        let tags = serde_json::from_str(&self.tags).unwrap_or_else(|e| {
            tracing::warn!(id = %self.id, error = %e, "Stored record has malformed tags");
            Vec::new()
        });
        Record {
            id: Arc::from(self.id),
            author: Arc::from(self.author),
            kind: u32::try_from(self.kind).unwrap_or_default(),
            created_at: self.created_at,
            tags,
            content: self.content,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ListStateDbRow {
    pub feed_id: String,
    pub last_appeared_id: Option<String>,
    pub last_read_id: Option<String>,
    pub leafs: String,
    pub hide_replies: bool,
}

impl ListStateDbRow {
    pub fn into_state(self) -> ListState {
        let leafs: Vec<String> = serde_json::from_str(&self.leafs).unwrap_or_default();
        ListState {
            feed_id: self.feed_id,
            last_appeared_id: self.last_appeared_id.map(Arc::from),
            last_read_id: self.last_read_id.map(Arc::from),
            leafs: leafs.into_iter().map(Arc::from).collect(),
            hide_replies: self.hide_replies,
        }
    }
}
