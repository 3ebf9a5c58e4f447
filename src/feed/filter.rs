use std::collections::HashSet;
use std::sync::Arc;

use crate::record::{AuthorId, Record, RecordId};
use crate::trust::TrustGraph;

/// Block and mute lists as configured by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterLists {
    pub blocked: HashSet<AuthorId>,
    /// Threads muted by root (or any record) id.
    pub muted_roots: HashSet<RecordId>,
    pub muted_words: Vec<String>,
}

/// Predicates applied to every record before it can reach the screen.
pub struct FilterPipeline {
    lists: FilterLists,
    /// Lowercased, non-empty copies of `lists.muted_words`.
    words: Vec<String>,
    trust: Arc<dyn TrustGraph>,
}

impl FilterPipeline {
    pub fn new(lists: FilterLists, trust: Arc<dyn TrustGraph>) -> Self {
        let words = normalize_words(&lists.muted_words);
        Self {
            lists,
            words,
            trust,
        }
    }

    pub fn lists(&self) -> &FilterLists {
        &self.lists
    }

    pub fn update_lists(&mut self, lists: FilterLists) {
        self.words = normalize_words(&lists.muted_words);
        self.lists = lists;
    }

    /// All predicates; used for leafs.
    pub fn admits(&self, record: &Record) -> bool {
        self.admits_context(record) && self.trust.is_admitted(&record.author)
    }

    /// Block, thread-mute and word-mute checks; used for ancestors, which
    /// are shown as context regardless of trust.
    pub fn admits_context(&self, record: &Record) -> bool {
        self.not_blocked(record) && self.not_muted_thread(record) && self.no_muted_words(record)
    }

    fn not_blocked(&self, record: &Record) -> bool {
        !self.lists.blocked.contains(&record.author)
    }

    fn not_muted_thread(&self, record: &Record) -> bool {
        let muted = &self.lists.muted_roots;
        if muted.is_empty() {
            return true;
        }
        !(muted.contains(&record.id)
            || record.root_id().is_some_and(|root| muted.contains(root))
            || record.parent_id().is_some_and(|parent| muted.contains(parent)))
    }

    fn no_muted_words(&self, record: &Record) -> bool {
        if self.words.is_empty() {
            return true;
        }
        let text = record.display_text().to_lowercase();
        !self.words.iter().any(|word| text.contains(word.as_str()))
    }
}

fn normalize_words(words: &[String]) -> Vec<String> {
    words
        .iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::kind;
    use crate::trust::{AdmitAll, TrustedSet};

    fn post(id: &str, author: &str, content: &str, tags: Vec<Vec<&str>>) -> Record {
        Record {
            id: id.into(),
            author: author.into(),
            kind: kind::POST,
            created_at: 0,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: content.to_string(),
        }
    }

    fn lists() -> FilterLists {
        FilterLists {
            blocked: [Arc::from("mallory")].into_iter().collect(),
            muted_roots: [Arc::from("flamewar")].into_iter().collect(),
            muted_words: vec!["  GiveAway ".to_string(), String::new()],
        }
    }

    #[test]
    fn test_blocked_author() {
        let f = FilterPipeline::new(lists(), Arc::new(AdmitAll));
        assert!(!f.admits(&post("a", "mallory", "hi", vec![])));
        assert!(f.admits(&post("b", "alice", "hi", vec![])));
    }

    #[test]
    fn test_muted_thread_by_root_or_self() {
        let f = FilterPipeline::new(lists(), Arc::new(AdmitAll));
        assert!(!f.admits(&post("flamewar", "alice", "", vec![])));
        assert!(!f.admits(&post(
            "r",
            "alice",
            "",
            vec![vec!["e", "flamewar", "", "root"], vec!["e", "x", "", "reply"]]
        )));
        assert!(f.admits(&post("r2", "alice", "", vec![vec!["e", "calm", "", "root"]])));
    }

    #[test]
    fn test_muted_words_case_insensitive() {
        let f = FilterPipeline::new(lists(), Arc::new(AdmitAll));
        assert!(!f.admits(&post("a", "alice", "Huge GIVEAWAY today", vec![])));
        assert!(f.admits(&post("b", "alice", "give away nothing", vec![])));
    }

    #[test]
    fn test_muted_words_match_repost_text_not_its_json() {
        let f = FilterPipeline::new(
            FilterLists {
                muted_words: vec!["content".to_string(), "giveaway".to_string()],
                ..FilterLists::default()
            },
            Arc::new(AdmitAll),
        );
        let embed = |text: &str| {
            let mut repost = post("rp", "bob", "", vec![vec!["e", "t"]]);
            repost.kind = kind::REPOST;
            repost.content = format!(
                r#"{{"id":"t","pubkey":"alice","kind":1,"created_at":5,"tags":[],"content":"{}"}}"#,
                text
            );
            repost
        };
        assert!(f.admits(&embed("nice weather")));
        assert!(!f.admits(&embed("Giveaway inside")));
    }

    #[test]
    fn test_trust_applies_to_leafs_only() {
        let f = FilterPipeline::new(FilterLists::default(), Arc::new(TrustedSet::new([Arc::from("alice")])));
        let stranger = post("s", "stranger", "hello", vec![]);
        assert!(!f.admits(&stranger));
        assert!(f.admits_context(&stranger));
    }

    #[test]
    fn test_update_lists() {
        let mut f = FilterPipeline::new(FilterLists::default(), Arc::new(AdmitAll));
        let r = post("a", "mallory", "hi", vec![]);
        assert!(f.admits(&r));
        f.update_lists(lists());
        assert!(!f.admits(&r));
        assert_eq!(f.lists().muted_words.len(), 2);
    }
}
