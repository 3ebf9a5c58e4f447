//! Everything that moves records toward the screen: bootstrap, local store
//! windows, relay requests and their outcomes, imports.
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use super::backlog::{Awaiting, CoalescedRequest, FetchTask, TaskOutcome, TaskPurpose};
use super::bootstrap::BootstrapDecision;
use super::engine::FeedEngine;
use super::snapshot::FeedPhase;
use crate::record::{kind, AuthorId, Record, RecordId};
use crate::relay::{RelayMessage, RequestFilter};
use crate::storage::{AuthorQuery, ListState, TimeWindow};
use crate::util::unix_now;

/// The first screen never starts later than this far back.
const INITIAL_LOOKBACK_SECS: i64 = 8 * 3600;
/// Local "newer" fetches overlap the top of the screen by this much.
const NEWER_OVERLAP_SECS: i64 = 15 * 60;
/// Local "older" fetches overlap the bottom of the screen by this much.
const OLDER_OVERLAP_SECS: i64 = 60;
/// Catch-up window when nothing is on screen.
const EMPTY_CATCHUP_SECS: i64 = 4 * 3600;
const PAGE_GUARD: Duration = Duration::from_secs(2);
/// Buffered relay records are written out at this size even between ticks.
const IMPORT_FLUSH_SIZE: usize = 50;

impl FeedEngine {
    // ========================================================================
    // Bootstrap
    // ========================================================================

    pub(super) async fn start(&mut self) {
        let restoring = match self.phase {
            FeedPhase::Initializing => true,
            FeedPhase::Reloading => false,
            phase => {
                tracing::debug!(feed = %self.spec.id, ?phase, "Feed already started");
                return;
            }
        };
        self.set_phase(FeedPhase::Bootstrapping);
        if restoring {
            self.restore_list_state().await;
        }

        let local = self.count_recent_local().await;
        match self.bootstrap.on_local(local) {
            BootstrapDecision::Complete => {
                tracing::debug!(feed = %self.spec.id, local, "Enough local records, skipping network bootstrap");
                self.finish_bootstrap().await;
            }
            // Nobody to ask the relays about.
            BootstrapDecision::KeepWaiting if self.spec.authors.is_empty() => {
                self.finish_bootstrap().await;
            }
            BootstrapDecision::KeepWaiting => self.request_bootstrap(),
        }
    }

    async fn restore_list_state(&mut self) {
        match self.state_store.load_state(&self.spec.id).await {
            Ok(Some(state)) => {
                tracing::debug!(
                    feed = %self.spec.id,
                    last_appeared = ?state.last_appeared_id,
                    "Restored list state"
                );
                self.hide_replies = state.hide_replies;
                self.feed
                    .restore_position(state.last_appeared_id, state.last_read_id);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(feed = %self.spec.id, error = %e, "Failed to load list state");
            }
        }
    }

    async fn count_recent_local(&self) -> usize {
        let since = unix_now() - INITIAL_LOOKBACK_SECS;
        let limit = self.tuning.bootstrap_min_records + 1;
        self.query_local(TimeWindow::Since(since), limit).await.len()
    }

    fn request_bootstrap(&mut self) {
        let subscription_id = format!("bootstrap-{}", self.spec.id);
        let filter = RequestFilter::authors(self.spec.authors.iter().cloned(), &kind::FEED_KINDS)
            .since(unix_now() - INITIAL_LOOKBACK_SECS)
            .limit(self.tuning.bootstrap_limit);
        self.relay.send_request(filter, &subscription_id);
        self.backlog.add(FetchTask::new(
            subscription_id.clone(),
            TaskPurpose::Bootstrap,
            Awaiting::EndOfStored,
            self.tuning.bootstrap_timeout(),
        ));
        tracing::debug!(feed = %self.spec.id, subscription_id = %subscription_id, "Waiting for network bootstrap");
        self.bootstrap.begin_network(subscription_id);
    }

    async fn finish_bootstrap(&mut self) {
        self.load_initial().await;
        self.set_phase(FeedPhase::Live);
        self.refresh_realtime();

        let now = Instant::now();
        self.catch_up_at = Some(now + self.tuning.catchup_delay());
        if self.feed.is_empty() {
            self.empty_retry_at = Some(now + self.tuning.empty_retry());
        }
        tracing::info!(feed = %self.spec.id, leafs = self.feed.len(), "Feed is live");
    }

    // ========================================================================
    // Local Store Windows
    // ========================================================================

    pub(super) async fn query_local(&self, window: TimeWindow, limit: usize) -> Vec<Record> {
        let query = AuthorQuery {
            authors: self.spec.authors.clone(),
            kinds: kind::FEED_KINDS.to_vec(),
            window,
            limit,
            hide_replies: self.hide_replies,
        };
        match self.store.fetch_by_authors(&query).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(feed = %self.spec.id, error = %e, "Local fetch failed");
                Vec::new()
            }
        }
    }

    /// Fill an empty screen: the page before the anchor and everything after.
    ///
    /// The anchor is the restored last-appeared record or 8 hours ago,
    /// whichever is older.
    pub(super) async fn load_initial(&mut self) {
        let mut cutoff = unix_now() - INITIAL_LOOKBACK_SECS;
        if let Some(anchor) = self.feed.last_appeared().cloned() {
            match self.store.fetch_by_id(&anchor).await {
                Ok(Some(record)) => cutoff = cutoff.min(record.created_at),
                Ok(None) => {}
                Err(e) => tracing::warn!(feed = %self.spec.id, error = %e, "Failed to load anchor record"),
            }
        }

        let mut records = self
            .query_local(TimeWindow::Until(cutoff), self.tuning.page_size)
            .await;
        records.extend(
            self.query_local(TimeWindow::Since(cutoff), self.tuning.bootstrap_limit)
                .await,
        );
        self.merge_incoming(records, false).await;

        self.restore_index = self
            .feed
            .last_appeared()
            .and_then(|id| self.feed.restore_index(id))
            .map(|index| (index + 1).min(self.feed.len().saturating_sub(1)));
        self.mark_dirty();
    }

    pub(super) async fn load_newer(&mut self) {
        let Some(newest) = self.feed.newest_created_at() else {
            self.load_initial().await;
            return;
        };
        let records = self
            .query_local(
                TimeWindow::Since(newest - NEWER_OVERLAP_SECS),
                self.tuning.bootstrap_limit,
            )
            .await;
        self.merge_incoming(records, false).await;
    }

    /// The reader neared the bottom: append the next local page and ask
    /// the relays for the page below it.
    pub(super) async fn load_older(&mut self) {
        let Some(oldest) = self.feed.oldest_created_at() else {
            return;
        };
        if !self.load_older_local().await {
            return;
        }
        self.request_next_page(oldest);
    }

    /// Returns false when another older-page fetch ran too recently.
    async fn load_older_local(&mut self) -> bool {
        let now = Instant::now();
        if self.page_guard.is_some_and(|until| now < until) {
            return false;
        }
        let Some(oldest) = self.feed.oldest_created_at() else {
            return false;
        };
        self.page_guard = Some(now + PAGE_GUARD);

        let records = self
            .query_local(
                TimeWindow::Until(oldest + OLDER_OVERLAP_SECS),
                self.tuning.page_size,
            )
            .await;
        let outcome = self.merge_incoming(records, true).await;
        tracing::debug!(feed = %self.spec.id, appended = outcome.inserted.len(), "Loaded older page");
        true
    }

    // ========================================================================
    // Relay Requests
    // ========================================================================

    /// (Re)issue the live subscription under the feed's own id.
    pub(super) fn refresh_realtime(&mut self) {
        if self.phase != FeedPhase::Live || self.spec.authors.is_empty() {
            return;
        }
        let filter = RequestFilter::authors(self.spec.authors.iter().cloned(), &kind::FEED_KINDS)
            .since(unix_now());
        self.relay.send_request(filter, &self.spec.id);
    }

    /// One catch-up per foreground session, after the real-time
    /// subscription had time to settle and no import is in flight.
    pub(super) fn maybe_catch_up(&mut self, now: Instant) {
        if self.did_catch_up || !self.visible || self.phase != FeedPhase::Live {
            return;
        }
        if self.catch_up_at.map_or(true, |at| now < at) {
            return;
        }
        if !self.pending_import.is_empty() || self.import_signal.is_pending() {
            tracing::debug!(feed = %self.spec.id, "Import in progress, postponing catch-up");
            return;
        }

        let since = match self.feed.newest_created_at() {
            Some(newest) => newest - self.tuning.catchup_lookback_secs as i64,
            None => unix_now() - EMPTY_CATCHUP_SECS,
        };
        let subscription_id = format!("catchup-{}-{}", self.spec.id, since);
        let filter = RequestFilter::authors(self.spec.authors.iter().cloned(), &kind::FEED_KINDS)
            .since(since);
        self.relay.send_request(filter, &subscription_id);
        self.backlog.add(FetchTask::new(
            subscription_id,
            TaskPurpose::CatchUp,
            Awaiting::EndOfStored,
            self.tuning.fetch_timeout(),
        ));
        self.did_catch_up = true;
        self.catch_up_at = None;
        tracing::debug!(feed = %self.spec.id, since, "Catching up");
    }

    fn request_next_page(&mut self, until: i64) {
        let subscription_id = format!("page-{}-{}", self.spec.id, until);
        if self.backlog.contains(&subscription_id) {
            return;
        }
        let filter = RequestFilter::authors(self.spec.authors.iter().cloned(), &kind::FEED_KINDS)
            .until(until)
            .limit(self.tuning.page_size);
        self.relay.send_request(filter, &subscription_id);
        self.backlog.add(FetchTask::new(
            subscription_id,
            TaskPurpose::NextPage,
            Awaiting::EndOfStored,
            self.tuning.fetch_timeout(),
        ));
    }

    /// One request for every parent collected during the debounce window.
    pub(super) fn request_parents(&mut self, request: CoalescedRequest) {
        let danglers: Vec<RecordId> = request
            .danglers
            .into_iter()
            .filter(|id| self.dangling.contains_key(id))
            .collect();
        if danglers.is_empty() {
            return;
        }

        self.request_seq += 1;
        let subscription_id = format!("parents-{}-{}", self.spec.id, self.request_seq);
        let wanted: HashSet<RecordId> = request.parents.iter().cloned().collect();
        tracing::debug!(
            feed = %self.spec.id,
            parents = wanted.len(),
            danglers = danglers.len(),
            "Requesting missing parents"
        );
        self.relay
            .send_request(RequestFilter::ids(request.parents), &subscription_id);
        self.backlog.add(FetchTask::new(
            subscription_id,
            TaskPurpose::DanglingParents { danglers },
            Awaiting::Records(wanted),
            self.tuning.fetch_timeout(),
        ));
    }

    /// Ask once for the profiles of authors the store has none for.
    pub(super) async fn request_missing_profiles(&mut self, authors: Vec<AuthorId>) {
        let mut candidates: Vec<AuthorId> = authors
            .into_iter()
            .filter(|a| !self.profiles_requested.contains(a))
            .collect();
        candidates.sort();
        candidates.dedup();
        if candidates.is_empty() {
            return;
        }

        let known = match self.store.known_profiles(&candidates).await {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!(feed = %self.spec.id, error = %e, "Profile lookup failed");
                return;
            }
        };
        self.profiles_requested.extend(candidates.iter().cloned());
        let missing: Vec<AuthorId> = candidates
            .into_iter()
            .filter(|a| !known.contains(a))
            .collect();
        if missing.is_empty() {
            return;
        }

        self.request_seq += 1;
        let subscription_id = format!("profiles-{}-{}", self.spec.id, self.request_seq);
        tracing::debug!(feed = %self.spec.id, authors = missing.len(), "Requesting missing profiles");
        self.relay.send_request(
            RequestFilter::authors(missing, &[kind::PROFILE]),
            &subscription_id,
        );
        self.backlog.add(FetchTask::new(
            subscription_id,
            TaskPurpose::Profiles,
            Awaiting::EndOfStored,
            self.tuning.fetch_timeout(),
        ));
    }

    // ========================================================================
    // Inbound Records
    // ========================================================================

    pub(super) async fn handle_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Record {
                subscription_id,
                record,
            } => {
                tracing::trace!(feed = %self.spec.id, subscription_id = %subscription_id, id = %record.id, "Record received");
                self.pending_import.push(record);
                if self.pending_import.len() >= IMPORT_FLUSH_SIZE {
                    self.flush_imports().await;
                }
            }
            RelayMessage::EndOfStored { subscription_id } => {
                self.flush_imports().await;
                if let Some(outcome) = self.backlog.end_of_stored(&subscription_id) {
                    self.handle_outcome(outcome).await;
                }
            }
        }
    }

    /// Write buffered relay records to the store and react to what arrived.
    pub(super) async fn flush_imports(&mut self) {
        if self.pending_import.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending_import);
        let available: HashSet<RecordId> = batch.iter().map(|r| r.id.clone()).collect();
        let inserted = match self.store.insert_records(&batch).await {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::warn!(feed = %self.spec.id, error = %e, "Failed to store imported records");
                0
            }
        };
        tracing::debug!(feed = %self.spec.id, received = batch.len(), inserted, "Imported records");

        // Replies whose parent is in this batch need not wait for the rest of their request.
        let ready: Vec<RecordId> = available
            .iter()
            .flat_map(|id| self.queue.waiting_on(id))
            .map(|record| record.id.clone())
            .filter(|id| self.dangling.contains_key(id))
            .collect();
        if !ready.is_empty() {
            self.resolve_danglers(ready).await;
        }
        for outcome in self.backlog.records_available(&available) {
            self.handle_outcome(outcome).await;
        }

        if inserted > 0 {
            if self.import_signal.request(Instant::now()) {
                self.on_new_records().await;
            }
        } else if self.feed.is_empty() && self.phase == FeedPhase::Live {
            self.load_initial().await;
        }
    }

    /// Write buffered records without reacting to them.
    pub(super) async fn store_pending_imports(&mut self) {
        if self.pending_import.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending_import);
        if let Err(e) = self.store.insert_records(&batch).await {
            tracing::warn!(feed = %self.spec.id, error = %e, "Failed to store imported records");
        }
    }

    /// New records are in the store.
    pub(super) async fn on_new_records(&mut self) {
        if let Some(subscription_id) = self.bootstrap.subscription_id().map(str::to_owned) {
            let local = self.count_recent_local().await;
            if self.bootstrap.on_progress(local) == BootstrapDecision::Complete {
                self.backlog.remove(&subscription_id);
                self.relay.close_subscription(&subscription_id);
                self.finish_bootstrap().await;
            }
            return;
        }
        if self.phase == FeedPhase::Live {
            self.load_newer().await;
        }
    }

    // ========================================================================
    // Task Outcomes
    // ========================================================================

    pub(super) async fn handle_outcome(&mut self, outcome: TaskOutcome) {
        let (task, timed_out) = match outcome {
            TaskOutcome::Responded(task) => (task, false),
            TaskOutcome::TimedOut(task) => (task, true),
        };
        self.relay.close_subscription(&task.subscription_id);
        if timed_out {
            tracing::debug!(
                feed = %self.spec.id,
                subscription_id = %task.subscription_id,
                "Fetch timed out, continuing with what is local"
            );
        }

        match task.purpose {
            TaskPurpose::Bootstrap => {
                if self.bootstrap.on_settled() == BootstrapDecision::Complete {
                    self.finish_bootstrap().await;
                }
            }
            TaskPurpose::DanglingParents { danglers } => self.resolve_danglers(danglers).await,
            TaskPurpose::CatchUp => self.load_newer().await,
            TaskPurpose::NextPage => {
                self.page_guard = None;
                self.load_older_local().await;
            }
            TaskPurpose::Profiles => {}
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub(super) async fn persist_state(&mut self) {
        let state = ListState {
            feed_id: self.spec.id.clone(),
            last_appeared_id: self.feed.last_appeared().cloned(),
            last_read_id: self.feed.last_read().cloned(),
            leafs: self.feed.leaf_ids(),
            hide_replies: self.hide_replies,
        };
        if let Err(e) = self.state_store.save_state(&state).await {
            tracing::warn!(feed = %self.spec.id, error = %e, "Failed to save list state");
        }
    }
}
