//! Record ids the reader has already had on screen.
//!
//! Feeds either share one app-wide registry or each own a private one,
//! depending on `per_feed_dedup`. Entries are only removed by an explicit
//! reset of a feed that owns its registry; resetting one feed never wipes
//! the app-wide set.
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::record::RecordId;

#[derive(Debug, Clone)]
pub struct SeenRegistry {
    inner: Arc<RwLock<HashSet<RecordId>>>,
    owned: bool,
}

impl Default for SeenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SeenRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            owned: true,
        }
    }

    /// The registry a feed should use: a handle on the shared one, or a
    /// fresh private one.
    pub fn for_feed(shared: &SeenRegistry, per_feed: bool) -> Self {
        if per_feed {
            Self::new()
        } else {
            Self {
                inner: shared.inner.clone(),
                owned: false,
            }
        }
    }

    /// Whether this handle may clear the set. Handles on the app-wide
    /// registry may not.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn mark_seen<I>(&self, ids: I)
    where
        I: IntoIterator<Item = RecordId>,
    {
        let mut set = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        set.extend(ids);
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shares_with(&self, other: &SeenRegistry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_registry_is_visible_across_feeds() {
        let app_wide = SeenRegistry::new();
        let following = SeenRegistry::for_feed(&app_wide, false);
        let list = SeenRegistry::for_feed(&app_wide, false);

        following.mark_seen([Arc::from("a")]);
        assert!(list.has("a"));
        assert!(following.shares_with(&list));
    }

    #[test]
    fn test_per_feed_registry_is_private() {
        let app_wide = SeenRegistry::new();
        let following = SeenRegistry::for_feed(&app_wide, true);
        following.mark_seen([Arc::from("a")]);

        assert!(!app_wide.has("a"));
        assert!(!following.shares_with(&app_wide));
    }

    #[test]
    fn test_only_private_handles_are_owned() {
        let app_wide = SeenRegistry::new();
        assert!(!SeenRegistry::for_feed(&app_wide, false).is_owned());
        assert!(SeenRegistry::for_feed(&app_wide, true).is_owned());
    }

    #[test]
    fn test_clear() {
        let seen = SeenRegistry::new();
        seen.mark_seen([Arc::from("a"), Arc::from("b")]);
        assert_eq!(seen.len(), 2);
        seen.clear();
        assert!(seen.is_empty());
    }
}
