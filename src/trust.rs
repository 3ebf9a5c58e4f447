//! Author admission policy ("web of trust").
use std::collections::HashSet;

use crate::record::AuthorId;

pub trait TrustGraph: Send + Sync {
    fn is_admitted(&self, author: &str) -> bool;
}

/// Admits everyone; used when trust filtering is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmitAll;

impl TrustGraph for AdmitAll {
    fn is_admitted(&self, _author: &str) -> bool {
        true
    }
}

/// Admits only authors in a fixed set, typically the follows of the
/// account plus their follows.
#[derive(Debug, Default, Clone)]
pub struct TrustedSet {
    authors: HashSet<AuthorId>,
}

impl TrustedSet {
    pub fn new(authors: impl IntoIterator<Item = AuthorId>) -> Self {
        Self {
            authors: authors.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.authors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authors.is_empty()
    }
}

impl TrustGraph for TrustedSet {
    fn is_admitted(&self, author: &str) -> bool {
        self.authors.contains(author)
    }
}
