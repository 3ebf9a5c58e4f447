use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::thread::{PostNode, RenderedThread};
use crate::record::{Record, RecordId};

/// Records currently displayed by a feed, addressed by id, plus the
/// parent/child adjacency of the displayed chains.
#[derive(Debug, Default)]
pub struct ThreadArena {
    records: HashMap<RecordId, Arc<Record>>,
    parent_of: HashMap<RecordId, RecordId>,
    children_of: HashMap<RecordId, HashSet<RecordId>>,
}

impl ThreadArena {
    pub fn insert_thread(&mut self, thread: &RenderedThread) {
        for record in &thread.records {
            self.records
                .entry(record.id.clone())
                .or_insert_with(|| record.clone());
        }
        self.link_chain(&thread.node);
    }

    pub fn record(&self, id: &str) -> Option<&Arc<Record>> {
        self.records.get(id)
    }

    pub fn parent(&self, id: &str) -> Option<&RecordId> {
        self.parent_of.get(id)
    }

    pub fn children(&self, id: &str) -> impl Iterator<Item = &RecordId> {
        self.children_of.get(id).into_iter().flatten()
    }

    /// Nearest descendant of `id` (breadth first) for which `matches` holds.
    pub fn find_descendant(&self, id: &str, matches: impl Fn(&str) -> bool) -> Option<RecordId> {
        let mut queue: VecDeque<&RecordId> = self.children(id).collect();
        let mut visited: HashSet<&str> = HashSet::from([id]);
        while let Some(next) = queue.pop_front() {
            if !visited.insert(&**next) {
                continue;
            }
            if matches(&**next) {
                return Some(next.clone());
            }
            queue.extend(self.children(next));
        }
        None
    }

    /// Drop every record and link not in `keep`. Returns how many records were dropped.
    pub fn retain(&mut self, keep: &HashSet<RecordId>) -> usize {
        let before = self.records.len();
        self.records.retain(|id, _| keep.contains(id));
        self.parent_of
            .retain(|child, parent| keep.contains(child) && keep.contains(parent));
        self.children_of.retain(|parent, children| {
            children.retain(|c| keep.contains(c));
            keep.contains(parent) && !children.is_empty()
        });
        before - self.records.len()
    }

    /// Recompute adjacency from the displayed chains, after ancestors were
    /// dropped from some of them.
    pub fn rebuild_links<'a>(&mut self, nodes: impl Iterator<Item = &'a PostNode>) {
        self.parent_of.clear();
        self.children_of.clear();
        for node in nodes {
            self.link_chain(node);
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.parent_of.clear();
        self.children_of.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn link_chain(&mut self, node: &PostNode) {
        let chain: Vec<&RecordId> = node
            .ancestors
            .iter()
            .chain(std::iter::once(&node.id))
            .collect();
        for pair in chain.windows(2) {
            self.link(pair[1].clone(), pair[0].clone());
        }
    }

    fn link(&mut self, child: RecordId, parent: RecordId) {
        if let Some(previous) = self.parent_of.insert(child.clone(), parent.clone()) {
            if previous != parent {
                if let Some(siblings) = self.children_of.get_mut(&previous) {
                    siblings.remove(&child);
                }
            }
        }
        self.children_of.entry(parent).or_default().insert(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> Arc<Record> {
        Arc::new(Record {
            id: id.into(),
            author: "alice".into(),
            kind: 1,
            created_at: 0,
            tags: Vec::new(),
            content: String::new(),
        })
    }

    fn thread(leaf: &str, ancestors: &[&str]) -> RenderedThread {
        let mut records: Vec<Arc<Record>> = ancestors.iter().map(|id| record(id)).collect();
        records.push(record(leaf));
        RenderedThread {
            node: PostNode {
                id: leaf.into(),
                author: "alice".into(),
                kind: 1,
                created_at: 0,
                ancestors: ancestors.iter().map(|id| RecordId::from(*id)).collect(),
                truncated: false,
                repost_of: None,
                replying_to: ancestors.last().map(|id| RecordId::from(*id)),
                thread_size: ancestors.len() + 1,
            },
            records,
        }
    }

    fn ids(values: &[&str]) -> HashSet<RecordId> {
        values.iter().map(|id| RecordId::from(*id)).collect()
    }

    #[test]
    fn test_adjacency() {
        let mut arena = ThreadArena::default();
        arena.insert_thread(&thread("c", &["a", "b"]));
        arena.insert_thread(&thread("d", &["b"]));

        assert_eq!(arena.parent("c").map(|p| &**p), Some("b"));
        assert_eq!(arena.parent("b").map(|p| &**p), Some("a"));
        let mut children: Vec<&str> = arena.children("b").map(|c| &**c).collect();
        children.sort();
        assert_eq!(children, vec!["c", "d"]);
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn test_find_descendant() {
        let mut arena = ThreadArena::default();
        arena.insert_thread(&thread("c", &["a", "b"]));

        let found = arena.find_descendant("a", |id| id == "c");
        assert_eq!(found.as_deref(), Some("c"));
        assert!(arena.find_descendant("c", |_| true).is_none());
    }

    #[test]
    fn test_retain_drops_records_and_links() {
        let mut arena = ThreadArena::default();
        arena.insert_thread(&thread("c", &["a", "b"]));
        arena.insert_thread(&thread("x", &[]));

        assert_eq!(arena.retain(&ids(&["b", "c"])), 2);
        assert!(arena.record("a").is_none());
        assert!(arena.parent("b").is_none());
        assert_eq!(arena.parent("c").map(|p| &**p), Some("b"));
        assert_eq!(arena.children("a").count(), 0);
    }
}
