use std::sync::Arc;

use crate::record::{Record, RecordId};

/// Lifecycle of a feed engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedPhase {
    #[default]
    Initializing,
    Bootstrapping,
    Live,
    Reloading,
}

/// One leaf as the presentation layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPost {
    pub id: RecordId,
    pub record: Arc<Record>,
    /// Displayed ancestors, root first.
    pub ancestors: Vec<Arc<Record>>,
    pub repost_of: Option<Arc<Record>>,
    pub truncated: bool,
    pub thread_size: usize,
}

/// Immutable view of a feed published after every change.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    pub phase: FeedPhase,
    pub posts: Arc<[SnapshotPost]>,
    pub unread: usize,
    /// Leaf index to scroll to after a restore, if the anchor is on screen.
    pub restore_index: Option<usize>,
    /// Bootstrap finished without finding anything to show.
    pub empty: bool,
    /// Bumped on every publish.
    pub revision: u64,
}

impl FeedSnapshot {
    pub fn leaf_ids(&self) -> Vec<RecordId> {
        self.posts.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}
