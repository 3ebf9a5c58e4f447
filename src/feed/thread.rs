//! Turning flat records into rendered thread leafs.
//!
//! Resolution is async (ancestors may come from the store), rendering is a
//! pure function over the resolved candidates and the current screen state.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::cache::RecordCache;
use super::dedup::SeenRegistry;
use super::relations::RelationQueue;
use crate::record::{AuthorId, Record, RecordId};
use crate::storage::RecordStore;

// ============================================================================
// Types
// ============================================================================

/// A record with whatever ancestry could be loaded for it.
#[derive(Debug, Clone)]
pub struct ThreadCandidate {
    pub record: Arc<Record>,
    /// Root first, immediate parent last.
    pub ancestors: Vec<Arc<Record>>,
    pub repost_of: Option<Arc<Record>>,
    /// Declared parent that could not be loaded from any source.
    pub unresolved_parent: Option<RecordId>,
    /// Some ancestors between the known ones and the leaf are missing or hidden.
    pub gap: bool,
}

impl ThreadCandidate {
    /// A candidate that renders as an unparented root no matter what it declares.
    pub fn standalone(record: Arc<Record>) -> Self {
        Self {
            gap: record.parent_id().is_some(),
            record,
            ancestors: Vec::new(),
            repost_of: None,
            unresolved_parent: None,
        }
    }

    /// Remove ancestors rejected by `keep`, marking the chain as having a gap.
    pub fn retain_ancestors(&mut self, keep: impl Fn(&Record) -> bool) {
        let before = self.ancestors.len();
        self.ancestors.retain(|a| keep(a));
        if self.ancestors.len() != before {
            self.gap = true;
        }
    }
}

/// A leaf as displayed. Ancestors are referenced by id; the records live
/// in the feed's arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostNode {
    pub id: RecordId,
    pub author: AuthorId,
    pub kind: u32,
    pub created_at: i64,
    /// Displayed ancestors, root first.
    pub ancestors: Vec<RecordId>,
    /// The original chain was longer than what is displayed.
    pub truncated: bool,
    pub repost_of: Option<RecordId>,
    pub replying_to: Option<RecordId>,
    /// Leaf plus displayed ancestors.
    pub thread_size: usize,
}

impl PostNode {
    /// Every id this node puts on screen.
    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        std::iter::once(&self.id)
            .chain(self.ancestors.iter())
            .chain(self.repost_of.iter())
    }
}

/// A node together with every record it references.
#[derive(Debug, Clone)]
pub struct RenderedThread {
    pub node: PostNode,
    pub records: Vec<Arc<Record>>,
}

/// A recent reply whose parent is not available yet.
#[derive(Debug, Clone)]
pub struct Dangler {
    pub record: Arc<Record>,
    pub parent_id: RecordId,
}

pub struct RenderContext<'a> {
    /// Every id currently on screen, leafs and ancestors.
    pub on_screen: &'a HashSet<RecordId>,
    pub seen: &'a SeenRegistry,
    pub now: i64,
    /// Replies older than this many seconds never wait for their parent.
    pub recency_horizon: i64,
}

#[derive(Debug, Default)]
pub struct RenderOutput {
    /// Newest first.
    pub leafs: Vec<RenderedThread>,
    pub danglers: Vec<Dangler>,
}

// ============================================================================
// Ancestry Resolution
// ============================================================================

/// Where ancestors are looked up, in order: the batch being merged, the
/// relation queue, the LRU cache, then the store.
pub struct AncestorSource<'a> {
    pub batch: &'a HashMap<RecordId, Arc<Record>>,
    pub queue: &'a RelationQueue,
    pub cache: &'a mut RecordCache,
    pub store: &'a dyn RecordStore,
    pub max_depth: usize,
}

impl AncestorSource<'_> {
    pub async fn lookup(&mut self, id: &str) -> Option<Arc<Record>> {
        if let Some(record) = self.batch.get(id).or_else(|| self.queue.resolved(id)) {
            return Some(record.clone());
        }
        if let Some(record) = self.cache.get(id) {
            return Some(record);
        }
        match self.store.fetch_by_id(id).await {
            Ok(Some(record)) => {
                let record = Arc::new(record);
                self.cache.put(record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Ancestor lookup failed");
                None
            }
        }
    }

    /// Follow parent references up to `max_depth` hops.
    ///
    /// A reference back into the chain ends the walk; the record is then
    /// treated as the root of what was collected. When the direct parent is
    /// missing but the declared root is available, the root is used as
    /// context and the chain is marked as having a gap.
    pub async fn resolve(&mut self, record: Arc<Record>) -> ThreadCandidate {
        let mut ancestors: Vec<Arc<Record>> = Vec::new();
        let mut visited: HashSet<RecordId> = HashSet::from([record.id.clone()]);
        let mut unresolved = None;
        let mut gap = false;
        let mut current = record.clone();

        loop {
            let Some(parent_id) = current.parent_id().map(RecordId::from) else {
                break;
            };
            if ancestors.len() >= self.max_depth {
                gap = true;
                break;
            }
            if !visited.insert(parent_id.clone()) {
                tracing::debug!(id = %record.id, parent = %parent_id, "Reference cycle in thread");
                break;
            }
            match self.lookup(&parent_id).await {
                Some(parent) => {
                    ancestors.push(parent.clone());
                    current = parent;
                }
                None if ancestors.is_empty() => {
                    let root_id = record
                        .root_id()
                        .filter(|root| *root != &*parent_id && !visited.contains(*root))
                        .map(RecordId::from);
                    if let Some(root_id) = root_id {
                        if let Some(root) = self.lookup(&root_id).await {
                            ancestors.push(root);
                            gap = true;
                        }
                    }
                    unresolved = Some(parent_id);
                    break;
                }
                None => {
                    gap = true;
                    break;
                }
            }
        }
        ancestors.reverse();

        let repost_of = match record.repost_target().map(RecordId::from) {
            Some(target) => match self.lookup(&target).await {
                Some(found) => Some(found),
                // Reposts usually embed the target as JSON content.
                None => Record::from_json(&record.content)
                    .ok()
                    .filter(|embedded| embedded.id == target)
                    .map(Arc::new),
            },
            None => None,
        };

        ThreadCandidate {
            unresolved_parent: unresolved.filter(|_| ancestors.is_empty()),
            record,
            ancestors,
            repost_of,
            gap,
        }
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// True when a candidate should wait for its parent instead of rendering.
pub fn is_dangling(candidate: &ThreadCandidate, now: i64, recency_horizon: i64) -> bool {
    candidate.ancestors.is_empty()
        && candidate.unresolved_parent.is_some()
        && candidate.record.created_at >= now - recency_horizon
}

/// Split off the candidates that should wait for their parent.
pub fn extract_danglers(
    candidates: Vec<ThreadCandidate>,
    now: i64,
    recency_horizon: i64,
) -> (Vec<Dangler>, Vec<ThreadCandidate>) {
    let mut danglers = Vec::new();
    let mut rest = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match candidate.unresolved_parent.clone() {
            Some(parent_id) if is_dangling(&candidate, now, recency_horizon) => {
                danglers.push(Dangler {
                    record: candidate.record,
                    parent_id,
                })
            }
            _ => rest.push(candidate),
        }
    }
    (danglers, rest)
}

/// Render candidates into leafs without duplicating anything already on
/// screen or already claimed by another leaf in the same batch.
///
/// Candidates with the longest chains go first so they claim their
/// ancestors before those ancestors are considered as leafs. The immediate
/// parent is always shown; older ancestors are shown until the first one
/// already on screen, already seen or already claimed. Nothing older than
/// that point is shown, so a chain never has holes.
pub fn render(candidates: Vec<ThreadCandidate>, ctx: &RenderContext<'_>) -> RenderOutput {
    let (danglers, mut candidates) = extract_danglers(candidates, ctx.now, ctx.recency_horizon);
    candidates.sort_by(|a, b| b.ancestors.len().cmp(&a.ancestors.len()));

    let mut claimed: HashSet<RecordId> = HashSet::new();
    let mut leafs = Vec::new();
    let taken = |claimed: &HashSet<RecordId>, id: &str| claimed.contains(id) || ctx.on_screen.contains(id);

    for candidate in candidates {
        let id = candidate.record.id.clone();
        if taken(&claimed, &id) {
            continue;
        }

        if let Some(target) = candidate.record.repost_target() {
            if taken(&claimed, target) {
                continue;
            }
            claimed.insert(RecordId::from(target));
            claimed.insert(id);
            leafs.push(build_thread(candidate, Vec::new(), false));
            continue;
        }

        let Some((parent, older)) = candidate.ancestors.split_last() else {
            claimed.insert(id);
            let truncated = candidate.gap;
            leafs.push(build_thread(candidate, Vec::new(), truncated));
            continue;
        };

        let mut kept: Vec<Arc<Record>> = vec![parent.clone()];
        for ancestor in older.iter().rev() {
            if taken(&claimed, &ancestor.id) || ctx.seen.has(&ancestor.id) {
                break;
            }
            kept.push(ancestor.clone());
        }
        kept.reverse();

        let truncated = candidate.gap || kept.len() < candidate.ancestors.len();
        claimed.insert(id);
        claimed.extend(kept.iter().map(|a| a.id.clone()));
        leafs.push(build_thread(candidate, kept, truncated));
    }

    sort_newest_first(&mut leafs);
    RenderOutput { leafs, danglers }
}

pub(crate) fn sort_newest_first(threads: &mut [RenderedThread]) {
    threads.sort_by(|a, b| {
        b.node
            .created_at
            .cmp(&a.node.created_at)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
}

fn build_thread(
    candidate: ThreadCandidate,
    ancestors: Vec<Arc<Record>>,
    truncated: bool,
) -> RenderedThread {
    let record = candidate.record;
    let repost_of = candidate
        .repost_of
        .as_ref()
        .map(|target| target.id.clone())
        .or_else(|| record.repost_target().map(RecordId::from));

    let node = PostNode {
        id: record.id.clone(),
        author: record.author.clone(),
        kind: record.kind,
        created_at: record.created_at,
        ancestors: ancestors.iter().map(|a| a.id.clone()).collect(),
        truncated,
        repost_of,
        replying_to: record.parent_id().map(RecordId::from),
        thread_size: 1 + ancestors.len(),
    };

    let mut records = ancestors;
    records.push(record);
    records.extend(candidate.repost_of);
    RenderedThread { node, records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::kind;
    use crate::storage::Database;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;
    const DAY: i64 = 86_400;

    fn post(id: &str, created_at: i64, parent: Option<&str>) -> Arc<Record> {
        let tags = parent
            .map(|p| {
                vec![vec![
                    "e".to_string(),
                    p.to_string(),
                    String::new(),
                    "reply".to_string(),
                ]]
            })
            .unwrap_or_default();
        Arc::new(Record {
            id: id.into(),
            author: "alice".into(),
            kind: kind::POST,
            created_at,
            tags,
            content: String::new(),
        })
    }

    fn repost(id: &str, created_at: i64, target: &str) -> Arc<Record> {
        Arc::new(Record {
            id: id.into(),
            author: "bob".into(),
            kind: kind::REPOST,
            created_at,
            tags: vec![vec!["e".to_string(), target.to_string()]],
            content: String::new(),
        })
    }

    fn candidate(record: Arc<Record>, ancestors: Vec<Arc<Record>>) -> ThreadCandidate {
        ThreadCandidate {
            record,
            ancestors,
            repost_of: None,
            unresolved_parent: None,
            gap: false,
        }
    }

    fn render_with(candidates: Vec<ThreadCandidate>, on_screen: &[&str], seen: &[&str]) -> RenderOutput {
        let on_screen: HashSet<RecordId> = on_screen.iter().map(|id| RecordId::from(*id)).collect();
        let registry = SeenRegistry::new();
        registry.mark_seen(seen.iter().map(|id| RecordId::from(*id)));
        let ctx = RenderContext {
            on_screen: &on_screen,
            seen: &registry,
            now: NOW,
            recency_horizon: DAY,
        };
        render(candidates, &ctx)
    }

    fn leaf_ids(out: &RenderOutput) -> Vec<&str> {
        out.leafs.iter().map(|t| &*t.node.id).collect()
    }

    #[test]
    fn test_reply_claims_its_parent() {
        let root = post("root", NOW - 30, None);
        let reply = post("reply", NOW - 10, Some("root"));
        let out = render_with(
            vec![
                candidate(root.clone(), vec![]),
                candidate(reply, vec![root]),
            ],
            &[],
            &[],
        );

        assert_eq!(leaf_ids(&out), vec!["reply"]);
        let node = &out.leafs[0].node;
        assert_eq!(node.ancestors, vec![RecordId::from("root")]);
        assert_eq!(node.thread_size, 2);
        assert!(!node.truncated);
    }

    #[test]
    fn test_chain_stops_at_first_seen_ancestor() {
        let a = post("a", NOW - 40, None);
        let b = post("b", NOW - 30, Some("a"));
        let c = post("c", NOW - 20, Some("b"));
        let d = post("d", NOW - 10, Some("c"));
        let out = render_with(vec![candidate(d, vec![a, b, c])], &[], &["b"]);

        let node = &out.leafs[0].node;
        assert_eq!(node.ancestors, vec![RecordId::from("c")]);
        assert!(node.truncated);
        assert_eq!(node.thread_size, 2);
    }

    #[test]
    fn test_immediate_parent_kept_even_if_on_screen() {
        let p = post("p", NOW - 20, None);
        let r = post("r", NOW - 10, Some("p"));
        let out = render_with(vec![candidate(r, vec![p])], &["p"], &[]);

        assert_eq!(out.leafs[0].node.ancestors, vec![RecordId::from("p")]);
        assert!(!out.leafs[0].node.truncated);
    }

    #[test]
    fn test_on_screen_leaf_is_not_rendered_again() {
        let p = post("p", NOW - 20, None);
        let out = render_with(vec![candidate(p, vec![])], &["p"], &[]);
        assert!(out.leafs.is_empty());
    }

    #[test]
    fn test_repost_and_target_render_once() {
        let target = post("t", NOW - 50, None);
        let rp = repost("rp", NOW - 5, "t");
        let out = render_with(
            vec![candidate(rp, vec![]), candidate(target, vec![])],
            &[],
            &[],
        );
        assert_eq!(out.leafs.len(), 1);
    }

    #[test]
    fn test_repost_of_on_screen_target_is_skipped() {
        let rp = repost("rp", NOW - 5, "t");
        let out = render_with(vec![candidate(rp, vec![])], &["t"], &[]);
        assert!(out.leafs.is_empty());
    }

    #[test]
    fn test_recent_reply_without_parent_dangles() {
        let mut c = candidate(post("r", NOW - 60, Some("p")), vec![]);
        c.unresolved_parent = Some(RecordId::from("p"));
        let out = render_with(vec![c], &[], &[]);

        assert!(out.leafs.is_empty());
        assert_eq!(out.danglers.len(), 1);
        assert_eq!(&*out.danglers[0].parent_id, "p");
    }

    #[test]
    fn test_old_reply_without_parent_renders_as_root() {
        let mut c = candidate(post("r", NOW - 2 * DAY, Some("p")), vec![]);
        c.unresolved_parent = Some(RecordId::from("p"));
        let out = render_with(vec![c], &[], &[]);

        assert!(out.danglers.is_empty());
        assert_eq!(leaf_ids(&out), vec!["r"]);
        assert!(out.leafs[0].node.ancestors.is_empty());
    }

    #[test]
    fn test_output_is_newest_first_with_id_tiebreak() {
        let out = render_with(
            vec![
                candidate(post("b", NOW - 10, None), vec![]),
                candidate(post("old", NOW - 100, None), vec![]),
                candidate(post("a", NOW - 10, None), vec![]),
            ],
            &[],
            &[],
        );
        assert_eq!(leaf_ids(&out), vec!["a", "b", "old"]);
    }

    #[test]
    fn test_standalone_marks_gap_for_replies() {
        let c = ThreadCandidate::standalone(post("r", NOW, Some("p")));
        let out = render_with(vec![c], &[], &[]);
        assert!(out.danglers.is_empty());
        assert!(out.leafs[0].node.truncated);
    }

    async fn resolve_with(
        store: &Database,
        batch: &[Arc<Record>],
        record: Arc<Record>,
        max_depth: usize,
    ) -> ThreadCandidate {
        let batch: HashMap<RecordId, Arc<Record>> =
            batch.iter().map(|r| (r.id.clone(), r.clone())).collect();
        let queue = RelationQueue::new(10, Duration::from_secs(30));
        let mut cache = RecordCache::new(10);
        let mut source = AncestorSource {
            batch: &batch,
            queue: &queue,
            cache: &mut cache,
            store,
            max_depth,
        };
        source.resolve(record).await
    }

    #[tokio::test]
    async fn test_resolve_walks_store_and_batch() {
        let db = Database::open(":memory:").await.unwrap();
        let a = post("a", NOW - 30, None);
        let b = post("b", NOW - 20, Some("a"));
        db.store_records(&[(*a).clone()]).await.unwrap();

        let c = post("c", NOW - 10, Some("b"));
        let resolved = resolve_with(&db, &[b], c, 35).await;
        let ids: Vec<&str> = resolved.ancestors.iter().map(|r| &*r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(resolved.unresolved_parent.is_none());
        assert!(!resolved.gap);
    }

    #[tokio::test]
    async fn test_resolve_missing_parent() {
        let db = Database::open(":memory:").await.unwrap();
        let r = post("r", NOW, Some("p"));
        let resolved = resolve_with(&db, &[], r, 35).await;
        assert!(resolved.ancestors.is_empty());
        assert_eq!(resolved.unresolved_parent.as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn test_resolve_depth_limit_marks_gap() {
        let db = Database::open(":memory:").await.unwrap();
        let chain: Vec<Arc<Record>> = (0..5)
            .map(|i| {
                let parent = (i > 0).then(|| format!("n{}", i - 1));
                post(&format!("n{}", i), NOW - 100 + i, parent.as_deref())
            })
            .collect();
        let leaf = chain[4].clone();
        let resolved = resolve_with(&db, &chain[..4], leaf, 2).await;

        let ids: Vec<&str> = resolved.ancestors.iter().map(|r| &*r.id).collect();
        assert_eq!(ids, vec!["n2", "n3"]);
        assert!(resolved.gap);
    }

    #[tokio::test]
    async fn test_resolve_cycle_terminates() {
        let db = Database::open(":memory:").await.unwrap();
        let a = post("a", NOW - 20, Some("b"));
        let b = post("b", NOW - 10, Some("a"));
        let resolved = resolve_with(&db, &[a], b, 35).await;
        assert_eq!(resolved.ancestors.len(), 1);
        assert!(resolved.unresolved_parent.is_none());
    }

    #[tokio::test]
    async fn test_resolve_repost_from_embedded_content() {
        let db = Database::open(":memory:").await.unwrap();
        let target = post("t", NOW - 100, None);
        let mut rp = (*repost("rp", NOW, "t")).clone();
        rp.content = serde_json::to_string(&*target).unwrap();

        let resolved = resolve_with(&db, &[], Arc::new(rp), 35).await;
        assert_eq!(resolved.repost_of.map(|r| r.id.clone()), Some(RecordId::from("t")));
    }
}
