//! From fetched records to leafs on screen: filtering, ancestry, dangling
//! replies and the final merge into the view.
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

use super::backlog::TaskPurpose;
use super::engine::FeedEngine;
use super::filter::FilterPipeline;
use super::thread::{is_dangling, render, AncestorSource, Dangler, RenderContext, ThreadCandidate};
use super::view::MergeOutcome;
use crate::record::{kind, AuthorId, Record, RecordId};
use crate::util::unix_now;

impl FeedEngine {
    /// Merge records into the screen, at the top or, with `older`, at the
    /// bottom. Records already on screen, waiting for a parent, filtered
    /// out or already seen (top inserts only) are dropped; when nothing
    /// new remains the call does nothing.
    pub(super) async fn merge_incoming(&mut self, records: Vec<Record>, older: bool) -> MergeOutcome {
        let screen_empty = self.feed.is_empty();
        let mut batch: HashMap<RecordId, Arc<Record>> = HashMap::with_capacity(records.len());
        let mut admitted: Vec<Arc<Record>> = Vec::new();
        let mut filtered = 0usize;

        for record in records {
            if batch.contains_key(&record.id) {
                continue;
            }
            let record = Arc::new(record);
            batch.insert(record.id.clone(), record.clone());

            if self.feed.on_screen().contains(&record.id) || self.dangling.contains_key(&record.id) {
                continue;
            }
            if !kind::FEED_KINDS.contains(&record.kind) || (self.hide_replies && record.is_reply()) {
                continue;
            }
            if !self.filters.admits(&record) {
                filtered += 1;
                continue;
            }
            // An empty screen shows seen records rather than nothing.
            if !older && !screen_empty && self.feed.seen().has(&record.id) {
                continue;
            }
            admitted.push(record);
        }
        if admitted.is_empty() {
            return MergeOutcome::default();
        }

        let now = unix_now();
        let horizon = self.tuning.recency_horizon_secs as i64;
        let mut candidates = self.resolve_candidates(&batch, admitted).await;
        for candidate in candidates.iter_mut() {
            // A reply gets one chance to wait for its parent.
            if self.dangling_ids.contains(&candidate.record.id) && is_dangling(candidate, now, horizon) {
                *candidate = ThreadCandidate::standalone(candidate.record.clone());
            }
        }

        let output = render(
            candidates,
            &RenderContext {
                on_screen: self.feed.on_screen(),
                seen: self.feed.seen(),
                now,
                recency_horizon: horizon,
            },
        );
        self.park_danglers(output.danglers);

        let outcome = self.feed.merge(output.leafs, older);
        tracing::debug!(
            feed = %self.spec.id,
            older,
            inserted = outcome.inserted.len(),
            trimmed = outcome.trimmed,
            out_of_order = outcome.out_of_order,
            filtered,
            unread = self.feed.unread(),
            "Merged records"
        );
        self.after_merge(&outcome).await;
        outcome
    }

    /// Resolve ancestry for each record, dropping ancestors the filters
    /// reject and reposts of rejected targets.
    async fn resolve_candidates(
        &mut self,
        batch: &HashMap<RecordId, Arc<Record>>,
        records: Vec<Arc<Record>>,
    ) -> Vec<ThreadCandidate> {
        let mut source = AncestorSource {
            batch,
            queue: &self.queue,
            cache: &mut self.cache,
            store: self.store.as_ref(),
            max_depth: self.tuning.max_thread_depth,
        };
        let mut candidates = Vec::with_capacity(records.len());
        for record in records {
            let candidate = source.resolve(record).await;
            if let Some(candidate) = admit_context(candidate, &self.filters) {
                candidates.push(candidate);
            }
        }
        candidates
    }

    /// Hold recent replies back until their parent arrives or the request
    /// for it times out.
    fn park_danglers(&mut self, danglers: Vec<Dangler>) {
        let now = Instant::now();
        for Dangler { record, parent_id } in danglers {
            let id = record.id.clone();
            self.dangling_ids.insert(id.clone());
            self.queue.enqueue(record.clone(), now);
            self.dangling.insert(id.clone(), record);

            let in_flight = self.backlog.awaiting_record(&parent_id).map(str::to_owned);
            match in_flight.and_then(|sub| self.backlog.get_mut(&sub)) {
                Some(task) => {
                    if let TaskPurpose::DanglingParents { danglers } = &mut task.purpose {
                        danglers.push(id);
                    }
                }
                None => self.coalescer.push(parent_id, id, now),
            }
        }
    }

    /// Render waiting replies for good: with their parent if it arrived,
    /// unparented otherwise. Each waiting reply is rendered at most once.
    pub(super) async fn resolve_danglers(&mut self, ids: Vec<RecordId>) {
        let records: Vec<Arc<Record>> = ids
            .iter()
            .filter_map(|id| self.dangling.remove(id))
            .filter(|record| self.filters.admits(record))
            .collect();
        if records.is_empty() {
            return;
        }
        for record in &records {
            self.queue.remove(&record.id);
        }

        let batch = HashMap::new();
        let resolved = self.resolve_candidates(&batch, records).await;
        let candidates: Vec<ThreadCandidate> = resolved
            .into_iter()
            .map(|candidate| {
                if candidate.ancestors.is_empty() {
                    ThreadCandidate::standalone(candidate.record)
                } else {
                    candidate
                }
            })
            .collect();

        let output = render(
            candidates,
            &RenderContext {
                on_screen: self.feed.on_screen(),
                seen: self.feed.seen(),
                now: unix_now(),
                recency_horizon: self.tuning.recency_horizon_secs as i64,
            },
        );
        let outcome = self.feed.merge(output.leafs, false);
        tracing::debug!(
            feed = %self.spec.id,
            inserted = outcome.inserted.len(),
            out_of_order = outcome.out_of_order,
            "Rendered waiting replies"
        );
        self.after_merge(&outcome).await;
    }

    /// Put a record the reader just published at the top.
    pub(super) async fn insert_own_post(&mut self, record: Record) {
        let own = self.spec.account.as_deref() == Some(&*record.author);
        if !own {
            tracing::debug!(feed = %self.spec.id, id = %record.id, "Record is not the reader's, importing normally");
            self.pending_import.push(record);
            return;
        }
        if let Err(e) = self.store.insert_records(std::slice::from_ref(&record)).await {
            tracing::warn!(feed = %self.spec.id, error = %e, "Failed to store own record");
        }

        let record = Arc::new(record);
        let batch = HashMap::new();
        let mut candidates = self.resolve_candidates(&batch, vec![record.clone()]).await;
        let candidate = match candidates.pop() {
            Some(candidate) if candidate.unresolved_parent.is_none() => candidate,
            _ => ThreadCandidate::standalone(record),
        };

        let output = render(
            vec![candidate],
            &RenderContext {
                on_screen: self.feed.on_screen(),
                seen: self.feed.seen(),
                now: unix_now(),
                recency_horizon: self.tuning.recency_horizon_secs as i64,
            },
        );
        let mut inserted = false;
        for thread in output.leafs {
            inserted |= self.feed.insert_own(thread);
        }
        if inserted {
            self.mark_dirty();
        }
    }

    async fn after_merge(&mut self, outcome: &MergeOutcome) {
        if outcome.is_noop() {
            return;
        }
        self.mark_dirty();
        let authors: Vec<AuthorId> = outcome
            .inserted
            .iter()
            .filter_map(|id| self.feed.arena().record(id))
            .map(|record| record.author.clone())
            .collect();
        self.request_missing_profiles(authors).await;
    }
}

/// Apply the context filters to a resolved candidate. A repost of a
/// rejected target is dropped entirely.
fn admit_context(mut candidate: ThreadCandidate, filters: &FilterPipeline) -> Option<ThreadCandidate> {
    if candidate
        .repost_of
        .as_ref()
        .is_some_and(|target| !filters.admits_context(target))
    {
        return None;
    }
    candidate.retain_ancestors(|ancestor| filters.admits_context(ancestor));
    Some(candidate)
}
