//! The ordered list of thread leafs one feed displays.
//!
//! Leafs are newest first. Top inserts only ever add records at least as
//! new as the current top leaf, so the order holds across any sequence of
//! top inserts; older pages are appended at the bottom.
use indexmap::IndexMap;
use std::collections::HashSet;

use super::arena::ThreadArena;
use super::dedup::SeenRegistry;
use super::filter::FilterPipeline;
use super::snapshot::SnapshotPost;
use super::thread::{sort_newest_first, PostNode, RenderedThread};
use crate::config::Config;
use crate::record::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedLimits {
    /// Leafs kept after a top insert while the reader sits at the top.
    pub max_visible: usize,
    /// A trim must leave at least this many leafs besides the new ones.
    pub min_keep_below_new: usize,
    /// Trims smaller than this are skipped.
    pub min_drop_batch: usize,
    /// Distance from the bottom at which the next page is wanted.
    pub near_bottom_distance: usize,
    /// When set, top inserts seen at the top do not count as unread.
    pub auto_scroll: bool,
}

impl Default for FeedLimits {
    fn default() -> Self {
        Self {
            max_visible: 20,
            min_keep_below_new: 10,
            min_drop_batch: 5,
            near_bottom_distance: 15,
            auto_scroll: false,
        }
    }
}

impl FeedLimits {
    pub fn from_config(config: &Config) -> Self {
        let tuning = &config.tuning;
        if tuning.max_visible <= tuning.min_keep_below_new {
            tracing::warn!(
                max_visible = tuning.max_visible,
                min_keep_below_new = tuning.min_keep_below_new,
                "max_visible does not exceed min_keep_below_new, top inserts will never trim"
            );
        }
        Self {
            max_visible: tuning.max_visible,
            min_keep_below_new: tuning.min_keep_below_new,
            min_drop_batch: tuning.min_drop_batch,
            near_bottom_distance: tuning.near_bottom_distance,
            auto_scroll: config.auto_scroll,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Leaf ids added, in display order.
    pub inserted: Vec<RecordId>,
    /// Leafs dropped from the bottom.
    pub trimmed: usize,
    /// Top-inserted threads older than the leaf they were placed above.
    pub out_of_order: usize,
    /// Thread-size weighted count of what was inserted.
    pub added_posts: usize,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.inserted.is_empty() && self.trimmed == 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterOutcome {
    pub removed_leafs: usize,
    pub removed_ancestors: usize,
}

pub struct Feed {
    leafs: IndexMap<RecordId, PostNode>,
    /// Every id on screen, leafs and displayed ancestors.
    on_screen: HashSet<RecordId>,
    arena: ThreadArena,
    seen: SeenRegistry,
    last_appeared: Option<RecordId>,
    last_read: Option<RecordId>,
    unread: usize,
    at_top: bool,
    limits: FeedLimits,
}

impl Feed {
    pub fn new(limits: FeedLimits, seen: SeenRegistry) -> Self {
        Self {
            leafs: IndexMap::new(),
            on_screen: HashSet::new(),
            arena: ThreadArena::default(),
            seen,
            last_appeared: None,
            last_read: None,
            unread: 0,
            at_top: true,
            limits,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn len(&self) -> usize {
        self.leafs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leafs.is_empty()
    }

    pub fn leafs(&self) -> impl Iterator<Item = &PostNode> {
        self.leafs.values()
    }

    pub fn leaf_ids(&self) -> Vec<RecordId> {
        self.leafs.keys().cloned().collect()
    }

    pub fn contains_leaf(&self, id: &str) -> bool {
        self.leafs.contains_key(id)
    }

    pub fn on_screen(&self) -> &HashSet<RecordId> {
        &self.on_screen
    }

    pub fn seen(&self) -> &SeenRegistry {
        &self.seen
    }

    pub fn arena(&self) -> &ThreadArena {
        &self.arena
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn last_appeared(&self) -> Option<&RecordId> {
        self.last_appeared.as_ref()
    }

    pub fn last_read(&self) -> Option<&RecordId> {
        self.last_read.as_ref()
    }

    pub fn is_at_top(&self) -> bool {
        self.at_top
    }

    pub fn set_at_top(&mut self, at_top: bool) {
        self.at_top = at_top;
        if at_top && self.limits.auto_scroll {
            self.unread = 0;
        }
    }

    pub fn limits(&self) -> FeedLimits {
        self.limits
    }

    pub fn newest_created_at(&self) -> Option<i64> {
        self.leafs.first().map(|(_, node)| node.created_at)
    }

    pub fn oldest_created_at(&self) -> Option<i64> {
        self.leafs.last().map(|(_, node)| node.created_at)
    }

    // ========================================================================
    // Merging
    // ========================================================================

    /// Merge rendered threads into the screen.
    ///
    /// Threads whose leaf is already on screen, or whose repost target is,
    /// are ignored, so merging the same batch twice is a no-op. With
    /// `older` the threads are appended at the bottom; otherwise they are
    /// inserted at the top and the bottom may be trimmed. Each batch is
    /// placed newest first. A new thread is never dropped for being older
    /// than what is already on screen.
    pub fn merge(&mut self, threads: Vec<RenderedThread>, older: bool) -> MergeOutcome {
        let mut batch_ids: HashSet<RecordId> = HashSet::new();
        let mut fresh: Vec<RenderedThread> = threads
            .into_iter()
            .filter(|t| {
                let node = &t.node;
                !self.on_screen.contains(&node.id)
                    && !node
                        .repost_of
                        .as_ref()
                        .is_some_and(|target| self.on_screen.contains(target))
                    && batch_ids.insert(node.id.clone())
            })
            .collect();
        if fresh.is_empty() {
            return MergeOutcome::default();
        }
        sort_newest_first(&mut fresh);

        let mut outcome = MergeOutcome::default();
        if older {
            for thread in fresh {
                outcome.added_posts += thread.node.thread_size;
                outcome.inserted.push(thread.node.id.clone());
                self.attach(thread);
            }
            return outcome;
        }

        if self.leafs.is_empty() {
            fresh.truncate(self.limits.max_visible);
        } else if let Some(newest) = self.newest_created_at() {
            outcome.out_of_order = fresh
                .iter()
                .filter(|t| t.node.created_at < newest)
                .count();
        }

        let was_empty = self.leafs.is_empty();
        let previous = std::mem::take(&mut self.leafs);
        for thread in fresh {
            outcome.added_posts += thread.node.thread_size;
            outcome.inserted.push(thread.node.id.clone());
            self.attach(thread);
        }
        self.leafs.extend(previous);

        outcome.trimmed = self.trim_after_top_insert(outcome.inserted.len());
        if !was_empty && !(self.at_top && self.limits.auto_scroll) {
            self.unread += outcome.added_posts;
        }
        outcome
    }

    /// Put the reader's own new record at the very top, bypassing order
    /// checks. Returns false if it is already on screen.
    pub fn insert_own(&mut self, thread: RenderedThread) -> bool {
        if self.on_screen.contains(&thread.node.id) {
            return false;
        }
        let previous = std::mem::take(&mut self.leafs);
        self.attach(thread);
        self.leafs.extend(previous);
        if !(self.at_top && self.limits.auto_scroll) {
            self.unread += 1;
        }
        true
    }

    /// Trim the bottom after a top insert, but only while the reader is at
    /// the top, the drop is big enough to be worth it, and enough older
    /// leafs survive besides the new ones.
    fn trim_after_top_insert(&mut self, inserted: usize) -> usize {
        let total = self.leafs.len();
        let drop_count = total.saturating_sub(self.limits.max_visible);
        let survivors = total - drop_count;
        let keeps_enough = survivors >= inserted + self.limits.min_keep_below_new;
        let worth_it = drop_count > self.limits.min_drop_batch;
        if !(self.at_top && keeps_enough && worth_it) {
            return 0;
        }
        self.leafs.truncate(survivors);
        self.reindex();
        tracing::debug!(dropped = drop_count, remaining = survivors, "Trimmed feed bottom");
        drop_count
    }

    fn attach(&mut self, thread: RenderedThread) {
        self.arena.insert_thread(&thread);
        self.on_screen.extend(thread.node.ids().cloned());
        self.leafs.insert(thread.node.id.clone(), thread.node);
    }

    /// Recompute the on-screen set and drop arena entries nothing displays.
    fn reindex(&mut self) {
        self.on_screen = self
            .leafs
            .values()
            .flat_map(|node| node.ids().cloned())
            .collect();
        self.arena.retain(&self.on_screen);
        self.arena.rebuild_links(self.leafs.values());
    }

    // ========================================================================
    // Reading Position
    // ========================================================================

    /// A leaf became visible. Marks it seen and lowers the unread count to
    /// the thread-weighted number of leafs above it; the count never rises
    /// here. Returns false for ids that are not leafs.
    pub fn record_appeared(&mut self, id: &str) -> bool {
        let Some((index, key, node)) = self.leafs.get_full(id) else {
            return false;
        };
        let key = key.clone();
        self.seen.mark_seen(node.ids().cloned());

        self.at_top = index == 0;
        let above = self.posts_above(index);
        if index == 0 || above < self.unread {
            self.unread = above;
            self.last_read = Some(key.clone());
        } else if self.last_read.is_none() {
            self.last_read = Some(key.clone());
        }
        self.last_appeared = Some(key);
        true
    }

    /// The reader is close enough to the bottom to want older records.
    pub fn needs_next_page(&self) -> bool {
        let Some(anchor) = &self.last_appeared else {
            return false;
        };
        match self.leafs.get_index_of(anchor) {
            Some(index) => index + self.limits.near_bottom_distance > self.leafs.len(),
            None => false,
        }
    }

    /// Index to scroll to for `id`: its leaf, or the nearest leaf that
    /// displays it as an ancestor.
    pub fn restore_index(&self, id: &str) -> Option<usize> {
        if let Some(index) = self.leafs.get_index_of(id) {
            return Some(index);
        }
        let leaf = self
            .arena
            .find_descendant(id, |candidate| self.leafs.contains_key(candidate))?;
        self.leafs.get_index_of(&leaf)
    }

    /// Reinstate a persisted reading position.
    pub fn restore_position(&mut self, last_appeared: Option<RecordId>, last_read: Option<RecordId>) {
        self.last_appeared = last_appeared;
        self.last_read = last_read;
    }

    fn posts_above(&self, index: usize) -> usize {
        self.leafs
            .values()
            .take(index)
            .map(|node| node.thread_size)
            .sum()
    }

    // ========================================================================
    // Filtering and Reset
    // ========================================================================

    /// Re-run the filters over everything on screen. Filtered leafs are
    /// removed with their threads; filtered ancestors are cut out of their
    /// chains, which are then marked truncated.
    pub fn apply_filters(&mut self, pipeline: &FilterPipeline) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        let arena = &self.arena;
        self.leafs.retain(|_, node| {
            let leaf_ok = arena.record(&node.id).map_or(true, |r| pipeline.admits(r));
            let target_ok = node
                .repost_of
                .as_ref()
                .and_then(|target| arena.record(target))
                .map_or(true, |r| pipeline.admits_context(r));
            if !(leaf_ok && target_ok) {
                outcome.removed_leafs += 1;
                return false;
            }

            let before = node.ancestors.len();
            node.ancestors
                .retain(|a| arena.record(a).map_or(true, |r| pipeline.admits_context(r)));
            let removed = before - node.ancestors.len();
            if removed > 0 {
                outcome.removed_ancestors += removed;
                node.truncated = true;
                node.thread_size = 1 + node.ancestors.len();
            }
            true
        });

        if outcome != FilterOutcome::default() {
            self.reindex();
            let cap = match self
                .last_appeared
                .as_ref()
                .and_then(|id| self.leafs.get_index_of(id))
            {
                Some(index) => self.posts_above(index),
                None => self.leafs.values().map(|n| n.thread_size).sum(),
            };
            self.unread = self.unread.min(cap);
        }
        outcome
    }

    /// Empty the screen but keep the seen set and reading anchor; used when
    /// the feed is rebuilt with different options.
    pub fn clear_screen(&mut self) {
        self.leafs.clear();
        self.on_screen.clear();
        self.arena.clear();
        self.unread = 0;
        self.at_top = true;
    }

    /// Full reset: screen, reading position and, when this feed owns it,
    /// the seen set.
    pub fn reset(&mut self) {
        self.clear_screen();
        if self.seen.is_owned() {
            self.seen.clear();
        }
        self.last_appeared = None;
        self.last_read = None;
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    pub fn snapshot_posts(&self) -> Vec<SnapshotPost> {
        self.leafs
            .values()
            .filter_map(|node| {
                let record = self.arena.record(&node.id)?.clone();
                Some(SnapshotPost {
                    id: node.id.clone(),
                    record,
                    ancestors: node
                        .ancestors
                        .iter()
                        .filter_map(|a| self.arena.record(a).cloned())
                        .collect(),
                    repost_of: node
                        .repost_of
                        .as_ref()
                        .and_then(|t| self.arena.record(t).cloned()),
                    truncated: node.truncated,
                    thread_size: node.thread_size,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::filter::FilterLists;
    use crate::record::{kind, Record};
    use crate::trust::AdmitAll;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn record(id: &str, author: &str, created_at: i64) -> Arc<Record> {
        Arc::new(Record {
            id: id.into(),
            author: author.into(),
            kind: kind::POST,
            created_at,
            tags: Vec::new(),
            content: String::new(),
        })
    }

    fn thread(id: &str, created_at: i64, ancestors: &[&str]) -> RenderedThread {
        let mut records: Vec<Arc<Record>> = ancestors
            .iter()
            .map(|a| record(a, "carol", created_at - 100))
            .collect();
        records.push(record(id, "alice", created_at));
        RenderedThread {
            node: PostNode {
                id: id.into(),
                author: "alice".into(),
                kind: kind::POST,
                created_at,
                ancestors: ancestors.iter().map(|a| RecordId::from(*a)).collect(),
                truncated: false,
                repost_of: None,
                replying_to: ancestors.last().map(|a| RecordId::from(*a)),
                thread_size: 1 + ancestors.len(),
            },
            records,
        }
    }

    fn batch(range: std::ops::Range<i64>) -> Vec<RenderedThread> {
        range.map(|i| thread(&format!("n{}", i), i, &[])).collect()
    }

    fn feed() -> Feed {
        Feed::new(FeedLimits::default(), SeenRegistry::new())
    }

    fn ids(feed: &Feed) -> Vec<String> {
        feed.leafs().map(|n| n.id.to_string()).collect()
    }

    #[test]
    fn test_initial_merge_caps_at_max_visible() {
        let mut f = feed();
        let outcome = f.merge(batch(0..25), false);
        assert_eq!(outcome.inserted.len(), 20);
        assert_eq!(f.len(), 20);
        assert_eq!(f.unread(), 0);
        assert_eq!(ids(&f)[0], "n24");
    }

    #[test]
    fn test_top_insert_trims_when_at_top() {
        let mut f = feed();
        f.merge(batch(0..25), false);
        let outcome = f.merge(batch(100..110), false);

        assert_eq!(outcome.trimmed, 10);
        assert_eq!(f.len(), 20);
        assert_eq!(ids(&f)[0], "n109");
        assert_eq!(f.unread(), 10);
        assert!(!f.on_screen().contains("n5"));
    }

    #[test]
    fn test_top_insert_keeps_everything_when_scrolled() {
        let mut f = feed();
        f.merge(batch(0..25), false);
        f.set_at_top(false);
        let outcome = f.merge(batch(100..110), false);

        assert_eq!(outcome.trimmed, 0);
        assert_eq!(f.len(), 30);
    }

    #[test]
    fn test_small_overflow_is_not_trimmed() {
        let mut f = feed();
        f.merge(batch(0..20), false);
        let outcome = f.merge(batch(100..104), false);
        assert_eq!(outcome.trimmed, 0);
        assert_eq!(f.len(), 24);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut f = feed();
        f.merge(batch(0..5), false);
        let before = ids(&f);
        let outcome = f.merge(batch(0..5), false);
        assert!(outcome.is_noop());
        assert_eq!(ids(&f), before);
    }

    #[test]
    fn test_late_records_still_go_on_top() {
        let mut f = feed();
        f.merge(batch(10..15), false);
        let outcome = f.merge(vec![thread("late", 12, &[]), thread("new", 20, &[])], false);

        assert_eq!(outcome.out_of_order, 1);
        assert_eq!(outcome.inserted, vec![RecordId::from("new"), RecordId::from("late")]);
        assert_eq!(ids(&f)[..3], ["new", "late", "n14"]);
        assert_eq!(f.len(), 7);
    }

    #[test]
    fn test_older_page_keeps_overlapping_records() {
        let mut f = feed();
        f.merge(batch(10..15), false);
        let outcome = f.merge(vec![thread("gap", 13, &[]), thread("n12", 12, &[])], true);

        assert_eq!(outcome.inserted, vec![RecordId::from("gap")]);
        assert_eq!(ids(&f).last().map(String::as_str), Some("gap"));
    }

    #[test]
    fn test_older_page_appends_at_bottom() {
        let mut f = feed();
        f.merge(batch(10..15), false);
        let outcome = f.merge(batch(0..5), true);
        assert_eq!(outcome.inserted.len(), 5);
        assert_eq!(ids(&f).last().map(String::as_str), Some("n0"));
        assert_eq!(f.unread(), 0);
    }

    #[test]
    fn test_unread_decreases_through_appearance_only() {
        let mut f = feed();
        f.merge(batch(0..5), false);
        f.record_appeared("n4");
        f.set_at_top(false);
        f.merge(vec![thread("a", 10, &["pa"]), thread("b", 11, &[])], false);
        // "a" carries one ancestor, so the batch counts three posts.
        assert_eq!(f.unread(), 3);

        assert!(f.record_appeared("n4"));
        assert_eq!(f.unread(), 3);
        assert!(f.record_appeared("a"));
        assert_eq!(f.unread(), 1);
        // Scrolling back down does not raise it again.
        assert!(f.record_appeared("n3"));
        assert_eq!(f.unread(), 1);
        assert!(f.record_appeared("b"));
        assert_eq!(f.unread(), 0);
        assert_eq!(f.last_read().map(|id| &**id), Some("b"));
        assert!(f.is_at_top());
    }

    #[test]
    fn test_appeared_marks_thread_seen() {
        let mut f = feed();
        f.merge(vec![thread("leaf", 10, &["root"])], false);
        assert!(f.record_appeared("leaf"));
        assert!(f.seen().has("leaf"));
        assert!(f.seen().has("root"));
        assert!(!f.record_appeared("root"));
    }

    #[test]
    fn test_needs_next_page_near_bottom() {
        let mut f = feed();
        f.merge(batch(0..20), false);
        f.record_appeared("n19");
        assert!(!f.needs_next_page());
        f.record_appeared("n14");
        assert!(!f.needs_next_page());
        f.record_appeared("n13");
        assert!(f.needs_next_page());
    }

    #[test]
    fn test_restore_index_via_ancestor() {
        let mut f = feed();
        f.merge(vec![thread("x", 20, &[]), thread("leaf", 10, &["root", "mid"])], false);
        assert_eq!(f.restore_index("x"), Some(0));
        assert_eq!(f.restore_index("leaf"), Some(1));
        assert_eq!(f.restore_index("root"), Some(1));
        assert_eq!(f.restore_index("missing"), None);
    }

    #[test]
    fn test_apply_filters_removes_blocked_leafs_and_ancestors() {
        let mut f = feed();
        f.merge(
            vec![
                thread("leaf", 30, &["root", "mid"]),
                thread("other", 20, &[]),
            ],
            false,
        );
        let mut blocked = FilterLists::default();
        blocked.blocked.insert(Arc::from("carol"));
        let pipeline = FilterPipeline::new(blocked, Arc::new(AdmitAll));

        let outcome = f.apply_filters(&pipeline);
        assert_eq!(outcome.removed_leafs, 0);
        assert_eq!(outcome.removed_ancestors, 2);
        let leaf = f.leafs().next().unwrap();
        assert!(leaf.truncated);
        assert_eq!(leaf.thread_size, 1);
        assert!(!f.on_screen().contains("root"));
        assert!(f.arena().record("mid").is_none());

        let mut blocked_alice = FilterLists::default();
        blocked_alice.blocked.insert(Arc::from("alice"));
        let outcome = f.apply_filters(&FilterPipeline::new(blocked_alice, Arc::new(AdmitAll)));
        assert_eq!(outcome.removed_leafs, 2);
        assert!(f.is_empty());
    }

    #[test]
    fn test_insert_own_goes_on_top() {
        let mut f = feed();
        f.merge(batch(10..15), false);
        assert!(f.insert_own(thread("mine", 1, &[])));
        assert_eq!(ids(&f)[0], "mine");
        assert!(!f.insert_own(thread("mine", 1, &[])));
    }

    #[test]
    fn test_reset_clears_seen_but_clear_screen_does_not() {
        let mut f = feed();
        f.merge(batch(0..3), false);
        f.record_appeared("n2");
        f.clear_screen();
        assert!(f.is_empty());
        assert!(f.seen().has("n2"));
        assert_eq!(f.last_appeared().map(|id| &**id), Some("n2"));

        f.reset();
        assert!(!f.seen().has("n2"));
        assert!(f.last_appeared().is_none());
    }

    #[test]
    fn test_reset_leaves_shared_seen_set_alone() {
        let app_wide = SeenRegistry::new();
        let mut following = Feed::new(FeedLimits::default(), SeenRegistry::for_feed(&app_wide, false));
        following.merge(batch(0..3), false);
        following.record_appeared("n2");

        following.reset();
        assert!(following.is_empty());
        assert!(following.last_appeared().is_none());
        assert!(app_wide.has("n2"));
    }

    #[test]
    fn test_snapshot_posts_resolve_records() {
        let mut f = feed();
        f.merge(vec![thread("leaf", 10, &["root"])], false);
        let posts = f.snapshot_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(&*posts[0].record.id, "leaf");
        assert_eq!(&*posts[0].ancestors[0].id, "root");
    }

    proptest! {
        #[test]
        fn prop_top_inserts_land_on_top_newest_first(batches in prop::collection::vec(
            prop::collection::vec(0i64..1000, 0..15), 1..8)
        ) {
            let mut f = feed();
            for (n, times) in batches.iter().enumerate() {
                let threads = times
                    .iter()
                    .enumerate()
                    .map(|(i, t)| thread(&format!("b{}-{}", n, i), *t, &[]))
                    .collect();
                let outcome = f.merge(threads, false);
                prop_assert_eq!(outcome.inserted.len(), times.len());

                let top: Vec<RecordId> = f.leaf_ids().into_iter().take(times.len()).collect();
                prop_assert_eq!(&top, &outcome.inserted);
                let top_times: Vec<i64> = f.leafs().take(times.len()).map(|node| node.created_at).collect();
                prop_assert!(top_times.windows(2).all(|w| w[0] >= w[1]));
            }
        }

        #[test]
        fn prop_unread_only_rises_with_inserts(
            steps in prop::collection::vec((any::<bool>(), 0usize..40), 1..40)
        ) {
            let mut f = feed();
            f.merge(batch(0..20), false);
            let mut clock = 1000i64;
            for (insert, pick) in steps {
                let before = f.unread();
                if insert {
                    clock += 1;
                    f.set_at_top(false);
                    f.merge(vec![thread(&format!("t{}", clock), clock, &[])], false);
                    prop_assert!(f.unread() >= before);
                } else {
                    let ids = f.leaf_ids();
                    let id = ids[pick % ids.len()].clone();
                    f.record_appeared(&id);
                    prop_assert!(f.unread() <= before);
                }
            }
        }
    }
}
