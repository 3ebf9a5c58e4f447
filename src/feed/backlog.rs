//! Outstanding network fetches, each completing exactly once: either by a
//! response or by its timeout, never both.
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use super::throttle::Debounce;
use crate::record::RecordId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPurpose {
    /// Initial network load while the local store is still thin.
    Bootstrap,
    /// Missing parents of dangling replies.
    DanglingParents { danglers: Vec<RecordId> },
    /// Records published while the feed was not listening.
    CatchUp,
    /// Records older than the bottom of the screen.
    NextPage,
    /// Profile records for authors shown without one.
    Profiles,
}

/// What completes a task besides its timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaiting {
    /// Relays signalled end of stored records for the subscription.
    EndOfStored,
    /// All of these ids became available locally, from any source.
    /// End of stored records for the subscription completes it too.
    Records(HashSet<RecordId>),
}

#[derive(Debug, Clone)]
pub struct FetchTask {
    pub subscription_id: String,
    pub purpose: TaskPurpose,
    pub awaiting: Awaiting,
    pub created_at: Instant,
    pub timeout: Duration,
}

impl FetchTask {
    pub fn new(
        subscription_id: impl Into<String>,
        purpose: TaskPurpose,
        awaiting: Awaiting,
        timeout: Duration,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            purpose,
            awaiting,
            created_at: Instant::now(),
            timeout,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.timeout
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Responded(FetchTask),
    TimedOut(FetchTask),
}

#[derive(Debug, Default)]
pub struct Backlog {
    tasks: HashMap<String, FetchTask>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. A task with the same subscription id is replaced
    /// without firing.
    pub fn add(&mut self, task: FetchTask) {
        if let Some(previous) = self.tasks.insert(task.subscription_id.clone(), task) {
            tracing::debug!(subscription_id = %previous.subscription_id, "Replaced pending fetch task");
        }
    }

    /// Remove a task without firing it.
    pub fn remove(&mut self, subscription_id: &str) -> Option<FetchTask> {
        self.tasks.remove(subscription_id)
    }

    pub fn get_mut(&mut self, subscription_id: &str) -> Option<&mut FetchTask> {
        self.tasks.get_mut(subscription_id)
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.tasks.contains_key(subscription_id)
    }

    /// Subscription already waiting for `id`, if any.
    pub fn awaiting_record(&self, id: &str) -> Option<&str> {
        self.tasks.values().find_map(|task| match &task.awaiting {
            Awaiting::Records(ids) if ids.contains(id) => Some(task.subscription_id.as_str()),
            _ => None,
        })
    }

    /// Ids became available locally. Tasks whose whole wanted set is now
    /// covered respond.
    pub fn records_available(&mut self, available: &HashSet<RecordId>) -> Vec<TaskOutcome> {
        if available.is_empty() {
            return Vec::new();
        }
        let mut done = Vec::new();
        for (subscription_id, task) in self.tasks.iter_mut() {
            if let Awaiting::Records(wanted) = &mut task.awaiting {
                let before = wanted.len();
                wanted.retain(|id| !available.contains(id));
                if wanted.is_empty() && before > 0 {
                    done.push(subscription_id.clone());
                }
            }
        }
        done.into_iter()
            .filter_map(|id| self.tasks.remove(&id))
            .map(TaskOutcome::Responded)
            .collect()
    }

    pub fn end_of_stored(&mut self, subscription_id: &str) -> Option<TaskOutcome> {
        self.tasks.remove(subscription_id).map(TaskOutcome::Responded)
    }

    /// Remove and return every task past its timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<TaskOutcome> {
        let expired: Vec<String> = self
            .tasks
            .values()
            .filter(|task| task.is_expired(now))
            .map(|task| task.subscription_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.tasks.remove(&id))
            .map(TaskOutcome::TimedOut)
            .collect()
    }

    /// Drop every task without firing. Returns the subscription ids to close.
    pub fn cancel_all(&mut self) -> Vec<String> {
        self.tasks.drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

// ============================================================================
// Parent Request Coalescing
// ============================================================================

/// Collects missing parent ids over a short window so that a burst of
/// dangling replies produces one request.
#[derive(Debug)]
pub struct RequestCoalescer {
    parents: Vec<RecordId>,
    parent_set: HashSet<RecordId>,
    danglers: Vec<RecordId>,
    debounce: Debounce,
}

pub struct CoalescedRequest {
    pub parents: Vec<RecordId>,
    pub danglers: Vec<RecordId>,
}

impl RequestCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            parents: Vec::new(),
            parent_set: HashSet::new(),
            danglers: Vec::new(),
            debounce: Debounce::new(window, window * 3),
        }
    }

    pub fn push(&mut self, parent_id: RecordId, dangler_id: RecordId, now: Instant) {
        if self.parent_set.insert(parent_id.clone()) {
            self.parents.push(parent_id);
        }
        self.danglers.push(dangler_id);
        self.debounce.touch(now);
    }

    pub fn contains_parent(&self, parent_id: &str) -> bool {
        self.parent_set.contains(parent_id)
    }

    /// Returns the batch once the window has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<CoalescedRequest> {
        if self.parents.is_empty() || !self.debounce.poll(now) {
            return None;
        }
        self.parent_set.clear();
        Some(CoalescedRequest {
            parents: std::mem::take(&mut self.parents),
            danglers: std::mem::take(&mut self.danglers),
        })
    }

    pub fn clear(&mut self) {
        self.parents.clear();
        self.parent_set.clear();
        self.danglers.clear();
        self.debounce.cancel();
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}
