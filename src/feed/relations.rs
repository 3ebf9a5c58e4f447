//! Bounded holding area for records whose relations are not loaded yet.
//!
//! Entries expire after a TTL. A full queue refuses new entries rather
//! than evicting old ones.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::record::{Record, RecordId};

#[derive(Debug, Clone)]
pub struct QueuedRecord {
    pub record: Arc<Record>,
    pub queued_at: Instant,
}

#[derive(Debug)]
pub struct RelationQueue {
    entries: HashMap<RecordId, QueuedRecord>,
    capacity: usize,
    ttl: Duration,
}

impl RelationQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Queue a record. Returns false, leaving the queue untouched, when the
    /// id is already queued or the queue is full.
    pub fn enqueue(&mut self, record: Arc<Record>, now: Instant) -> bool {
        if self.entries.contains_key(&record.id) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            tracing::info!(
                id = %record.id,
                capacity = self.capacity,
                "Relation queue full, not queuing record"
            );
            return false;
        }
        self.entries.insert(
            record.id.clone(),
            QueuedRecord {
                record,
                queued_at: now,
            },
        );
        true
    }

    /// The queued record with this id, if it is still waiting.
    pub fn resolved(&self, id: &str) -> Option<&Arc<Record>> {
        self.entries.get(id).map(|q| &q.record)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Record>> {
        self.entries.remove(id).map(|q| q.record)
    }

    /// Queued records that declare `parent_id` as their direct parent.
    pub fn waiting_on(&self, parent_id: &str) -> Vec<Arc<Record>> {
        self.entries
            .values()
            .filter(|q| q.record.parent_id() == Some(parent_id))
            .map(|q| q.record.clone())
            .collect()
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, q| now.saturating_duration_since(q.queued_at) < ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Swept relation queue");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
