//! Signed content records as they arrive from relays or the local store.
//!
//! Relations between records are expressed through `e` tags:
//! `["e", <id>, <relay hint>, <marker>]` where the marker is `reply`, `root`
//! or `mention`. Older clients omit markers, in which case the first `e` tag
//! is the root and the last one the direct parent.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error;

pub type RecordId = Arc<str>;
pub type AuthorId = Arc<str>;

/// Record kinds the feed pipeline cares about.
pub mod kind {
    pub const PROFILE: u32 = 0;
    pub const POST: u32 = 1;
    pub const REPOST: u32 = 6;
    pub const HIGHLIGHT: u32 = 9802;
    pub const LONG_FORM: u32 = 30023;

    /// Kinds rendered as timeline leafs.
    pub const FEED_KINDS: [u32; 4] = [POST, REPOST, HIGHLIGHT, LONG_FORM];
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Malformed record JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Record id {claimed} does not match content hash {computed}")]
    IdMismatch { claimed: String, computed: String },
}

// ============================================================================
// Record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(alias = "pubkey")]
    pub author: AuthorId,
    pub kind: u32,
    pub created_at: i64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl Record {
    /// Parse a single JSON object (one line of an export file).
    ///
    /// Ids are not re-hashed here; use [`Record::verify_id`] when the source
    /// is untrusted.
    pub fn from_json(line: &str) -> Result<Self, RecordError> {
        let record: Record = serde_json::from_str(line)?;
        if record.id.is_empty() {
            return Err(RecordError::MissingField("id"));
        }
        if record.author.is_empty() {
            return Err(RecordError::MissingField("author"));
        }
        Ok(record)
    }

    /// Check that `id` is the hash of the record's canonical serialization.
    pub fn verify_id(&self) -> Result<(), RecordError> {
        let computed = compute_id(
            &self.author,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if computed.as_str() == &*self.id {
            Ok(())
        } else {
            Err(RecordError::IdMismatch {
                claimed: self.id.to_string(),
                computed,
            })
        }
    }

    pub fn is_repost(&self) -> bool {
        self.kind == kind::REPOST
    }

    /// Ids referenced by `e` tags, in tag order.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter(|t| t.len() >= 2 && t[0] == "e" && !t[1].is_empty())
            .map(|t| t[1].as_str())
    }

    /// Target of a repost: the first referenced id.
    pub fn repost_target(&self) -> Option<&str> {
        if !self.is_repost() {
            return None;
        }
        self.references().find(|id| *id != &*self.id)
    }

    /// Text a reader sees for this record. Reposts carry the target as JSON
    /// in `content`, so their text is the embedded record's content, or
    /// nothing when the embed is missing or unreadable.
    pub fn display_text(&self) -> Cow<'_, str> {
        if !self.is_repost() {
            return Cow::Borrowed(&self.content);
        }
        match Record::from_json(&self.content) {
            Ok(embedded) => Cow::Owned(embedded.content),
            Err(_) => Cow::Borrowed(""),
        }
    }

    /// Direct parent this record replies to.
    ///
    /// A reference to the record itself is malformed and ignored, so such a
    /// record renders as an unparented root.
    pub fn parent_id(&self) -> Option<&str> {
        if self.is_repost() {
            return None;
        }
        let parent = self
            .marked_reference("reply")
            .or_else(|| self.marked_reference("root"))
            .or_else(|| self.positional_reference(false))?;
        (parent != &*self.id).then_some(parent)
    }

    /// Root of the conversation this record belongs to.
    pub fn root_id(&self) -> Option<&str> {
        if self.is_repost() {
            return None;
        }
        let root = self
            .marked_reference("root")
            .or_else(|| self.positional_reference(true))?;
        (root != &*self.id).then_some(root)
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id().is_some()
    }

    fn marked_reference(&self, marker: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 4 && t[0] == "e" && t[3] == marker && !t[1].is_empty())
            .map(|t| t[1].as_str())
    }

    /// Fallback for tags without markers: first is root, last is parent.
    fn positional_reference(&self, root: bool) -> Option<&str> {
        let has_markers = self
            .tags
            .iter()
            .any(|t| t.len() >= 4 && t[0] == "e" && !t[3].is_empty());
        if has_markers {
            return None;
        }
        if root {
            self.references().next()
        } else {
            self.references().last()
        }
    }
}

/// Hex-encoded sha256 of `[0, author, created_at, kind, tags, content]`.
pub fn compute_id(
    author: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let canonical = serde_json::json!([0, author, created_at, kind, tags, content]);
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("{:x}", digest)
}

// ============================================================================
// Tests
// ============================================================================
