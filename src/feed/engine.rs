//! The per-feed actor.
//!
//! One task owns a [`Feed`] and every piece of state that feeds it. The
//! outside world talks to it through a [`FeedHandle`]: commands go in over
//! an mpsc channel, relay messages over another, and immutable
//! [`FeedSnapshot`]s come out over a watch channel. Nothing else can reach
//! the feed, so there is exactly one writer.
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::backlog::{Backlog, RequestCoalescer};
use super::bootstrap::BootstrapLoader;
use super::cache::RecordCache;
use super::dedup::SeenRegistry;
use super::filter::{FilterLists, FilterPipeline};
use super::relations::RelationQueue;
use super::snapshot::{FeedPhase, FeedSnapshot};
use super::throttle::{Debounce, Throttle};
use super::view::{Feed, FeedLimits};
use crate::config::{Config, Tuning};
use crate::record::{AuthorId, Record, RecordId};
use crate::relay::{RelayClient, RelayMessage};
use crate::storage::{ListStateStore, RecordStore};
use crate::trust::TrustGraph;

/// Housekeeping period: flushes imports, fires throttles and timeouts.
const TICK: Duration = Duration::from_millis(100);

const COMMAND_BUFFER: usize = 64;

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Feed engine has stopped")]
    Closed,
}

/// Which records a feed shows.
#[derive(Debug, Clone)]
pub struct FeedSpec {
    /// Stable id; also the subscription id of the real-time subscription.
    pub id: String,
    pub authors: Vec<AuthorId>,
    /// The reader's own author id.
    pub account: Option<AuthorId>,
}

#[derive(Debug, Clone)]
pub enum FeedCommand {
    /// Leave `Initializing`: restore position and bootstrap.
    Start,
    /// A leaf became visible on screen.
    Appeared(RecordId),
    ScrolledToTop(bool),
    FilterListsChanged(FilterLists),
    /// The followed set changed. With `reload` the feed is rebuilt from scratch.
    AuthorsChanged {
        authors: Vec<AuthorId>,
        reload: bool,
    },
    SetHideReplies(bool),
    /// The reader published a record; it goes straight to the top.
    OwnPostSaved(Record),
    Reload,
    Background,
    Foreground,
    Shutdown,
}

/// Collaborators injected into every engine.
#[derive(Clone)]
pub struct EngineServices {
    pub store: Arc<dyn RecordStore>,
    pub state_store: Arc<dyn ListStateStore>,
    pub relay: Arc<dyn RelayClient>,
    pub trust: Arc<dyn TrustGraph>,
}

/// The only way to reach a running engine.
pub struct FeedHandle {
    commands: mpsc::Sender<FeedCommand>,
    snapshots: watch::Receiver<FeedSnapshot>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub async fn send(&self, command: FeedCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the engine after it persisted its state.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        // A closed channel means the engine already stopped; join it anyway.
        let _ = self.commands.send(FeedCommand::Shutdown).await;
        self.task.await.map_err(|_| EngineError::Closed)
    }
}

/// Check the store, then start the engine task.
///
/// The engine stays in `Initializing` until it receives [`FeedCommand::Start`].
pub async fn spawn(
    spec: FeedSpec,
    config: &Config,
    lists: FilterLists,
    seen: SeenRegistry,
    services: EngineServices,
    inbound: mpsc::Receiver<RelayMessage>,
) -> Result<FeedHandle, EngineError> {
    services
        .store
        .ping()
        .await
        .map_err(|e| EngineError::StoreUnavailable(format!("{:#}", e)))?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(FeedSnapshot::default());
    let engine = FeedEngine::new(spec, config, lists, seen, services, snapshot_tx);
    let feed_id = engine.spec.id.clone();

    let task = tokio::spawn(async move {
        if let Err(panic) = catch_task_panic(engine.run(command_rx, inbound)).await {
            tracing::error!(feed = %feed_id, error = %panic, "Feed engine panicked");
        }
    });

    Ok(FeedHandle {
        commands: command_tx,
        snapshots: snapshot_rx,
        task,
    })
}

/// Runs a future, turning a panic into `Err` with the panic message.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        }
    })
}

// ============================================================================
// Engine State
// ============================================================================

pub(crate) struct FeedEngine {
    pub(super) spec: FeedSpec,
    pub(super) tuning: Tuning,
    pub(super) store: Arc<dyn RecordStore>,
    pub(super) state_store: Arc<dyn ListStateStore>,
    pub(super) relay: Arc<dyn RelayClient>,
    pub(super) filters: FilterPipeline,
    pub(super) feed: Feed,
    pub(super) phase: FeedPhase,
    pub(super) hide_replies: bool,
    /// False while the app is in the background.
    pub(super) visible: bool,

    pub(super) queue: RelationQueue,
    pub(super) cache: RecordCache,
    pub(super) backlog: Backlog,
    pub(super) coalescer: RequestCoalescer,
    pub(super) bootstrap: BootstrapLoader,
    /// Replies waiting for their parent, by id.
    pub(super) dangling: HashMap<RecordId, Arc<Record>>,
    /// Every id ever parked as dangling; these never wait a second time.
    pub(super) dangling_ids: HashSet<RecordId>,
    pub(super) profiles_requested: HashSet<AuthorId>,

    /// Relay records not yet written to the store.
    pub(super) pending_import: Vec<Record>,
    /// New records landed in the store; gates local fetches.
    pub(super) import_signal: Throttle,
    pub(super) scroll: Throttle,
    pub(super) pending_appeared: Option<RecordId>,
    pub(super) save_state: Debounce,
    pub(super) did_catch_up: bool,
    pub(super) catch_up_at: Option<Instant>,
    /// An older-page fetch ran recently; no other one until this instant.
    pub(super) page_guard: Option<Instant>,
    pub(super) empty_retry_at: Option<Instant>,
    pub(super) restore_index: Option<usize>,
    pub(super) request_seq: u64,

    publisher: Throttle,
    snapshots: watch::Sender<FeedSnapshot>,
    dirty: bool,
    revision: u64,
}

impl FeedEngine {
    fn new(
        spec: FeedSpec,
        config: &Config,
        lists: FilterLists,
        seen: SeenRegistry,
        services: EngineServices,
        snapshots: watch::Sender<FeedSnapshot>,
    ) -> Self {
        let tuning = config.tuning.clone();
        let mut lists = lists;
        for word in &config.muted_words {
            if !lists.muted_words.contains(word) {
                lists.muted_words.push(word.clone());
            }
        }

        Self {
            filters: FilterPipeline::new(lists, services.trust),
            feed: Feed::new(FeedLimits::from_config(config), seen),
            phase: FeedPhase::Initializing,
            hide_replies: config.hide_replies,
            visible: true,
            queue: RelationQueue::new(tuning.queue_capacity, tuning.queue_ttl()),
            cache: RecordCache::new(tuning.cache_capacity),
            backlog: Backlog::new(),
            coalescer: RequestCoalescer::new(tuning.fetch_debounce()),
            bootstrap: BootstrapLoader::new(tuning.bootstrap_min_records),
            dangling: HashMap::new(),
            dangling_ids: HashSet::new(),
            profiles_requested: HashSet::new(),
            pending_import: Vec::new(),
            import_signal: Throttle::new(tuning.merge_throttle()),
            scroll: Throttle::new(tuning.scroll_throttle()),
            pending_appeared: None,
            save_state: Debounce::new(tuning.save_state_debounce(), tuning.save_state_debounce() * 5),
            did_catch_up: false,
            catch_up_at: None,
            page_guard: None,
            empty_retry_at: None,
            restore_index: None,
            request_seq: 0,
            publisher: Throttle::new(tuning.publish_throttle()),
            snapshots,
            dirty: false,
            revision: 0,
            store: services.store,
            state_store: services.state_store,
            relay: services.relay,
            spec,
            tuning,
        }
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<FeedCommand>,
        mut inbound: mpsc::Receiver<RelayMessage>,
    ) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut realtime = tokio::time::interval(self.tuning.catchup_interval());
        realtime.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.tuning.queue_sweep());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(feed = %self.spec.id, authors = self.spec.authors.len(), "Feed engine started");

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(FeedCommand::Shutdown) | None => break,
                    Some(command) => {
                        let resumed = matches!(command, FeedCommand::Foreground) && !self.visible;
                        self.handle_command(command).await;
                        // Foregrounding resubscribes itself; skip the overdue tick.
                        if resumed {
                            realtime.reset();
                        }
                    }
                },

                Some(message) = inbound.recv() => {
                    self.handle_message(message).await;
                }

                // Timers only run while the app is in the foreground.
                _ = tick.tick(), if self.visible => {
                    self.on_tick().await;
                }

                _ = realtime.tick(), if self.visible => {
                    self.refresh_realtime();
                }

                _ = sweep.tick(), if self.visible => {
                    self.queue.sweep(Instant::now());
                }
            }

            self.publish_if_dirty(Instant::now());
        }

        self.stop().await;
    }

    async fn handle_command(&mut self, command: FeedCommand) {
        let now = Instant::now();
        match command {
            FeedCommand::Start => self.start().await,
            FeedCommand::Appeared(id) => {
                self.pending_appeared = Some(id);
                if self.scroll.request(now) {
                    self.apply_appeared().await;
                }
            }
            FeedCommand::ScrolledToTop(at_top) => {
                self.feed.set_at_top(at_top);
                self.mark_dirty();
            }
            FeedCommand::FilterListsChanged(lists) => self.apply_filter_lists(lists),
            FeedCommand::AuthorsChanged { authors, reload } => {
                self.spec.authors = authors;
                if reload {
                    self.reload().await;
                } else if self.phase == FeedPhase::Live {
                    self.refresh_realtime();
                    self.load_newer().await;
                }
            }
            FeedCommand::SetHideReplies(hide) => self.set_hide_replies(hide).await,
            FeedCommand::OwnPostSaved(record) => self.insert_own_post(record).await,
            FeedCommand::Reload => self.reload().await,
            FeedCommand::Background => self.enter_background().await,
            FeedCommand::Foreground => self.enter_foreground(),
            FeedCommand::Shutdown => {}
        }
    }

    async fn on_tick(&mut self) {
        self.flush_imports().await;

        let now = Instant::now();
        if self.scroll.poll(now) {
            self.apply_appeared().await;
        }
        if self.import_signal.poll(now) {
            self.on_new_records().await;
        }
        if let Some(request) = self.coalescer.take_due(now) {
            self.request_parents(request);
        }
        for outcome in self.backlog.expire(now) {
            self.handle_outcome(outcome).await;
        }
        self.maybe_catch_up(now);

        if self.page_guard.is_some_and(|until| now >= until) {
            self.page_guard = None;
        }
        if self.empty_retry_at.is_some_and(|at| now >= at) {
            self.empty_retry_at = None;
            if self.feed.is_empty() {
                tracing::debug!(feed = %self.spec.id, "Screen still empty, retrying local fetch");
                self.load_initial().await;
            }
        }
        if self.save_state.poll(now) {
            self.persist_state().await;
        }
        if self.publisher.poll(now) {
            self.publish_snapshot();
        }
    }

    // ========================================================================
    // Reading Position and Lifecycle
    // ========================================================================

    async fn apply_appeared(&mut self) {
        let Some(id) = self.pending_appeared.take() else {
            return;
        };
        if !self.feed.record_appeared(&id) {
            return;
        }
        self.mark_dirty();
        self.save_state.touch(Instant::now());
        if self.feed.needs_next_page() {
            self.load_older().await;
        }
    }

    fn apply_filter_lists(&mut self, lists: FilterLists) {
        self.filters.update_lists(lists);
        let outcome = self.feed.apply_filters(&self.filters);

        let filters = &self.filters;
        self.dangling.retain(|_, record| filters.admits(record));

        if outcome.removed_leafs > 0 || outcome.removed_ancestors > 0 {
            tracing::info!(
                feed = %self.spec.id,
                removed_leafs = outcome.removed_leafs,
                removed_ancestors = outcome.removed_ancestors,
                "Filters removed records from screen"
            );
            self.mark_dirty();
        }
    }

    async fn set_hide_replies(&mut self, hide: bool) {
        if self.hide_replies == hide {
            return;
        }
        self.hide_replies = hide;
        self.feed.clear_screen();
        self.restore_index = None;
        self.mark_dirty();
        if self.phase == FeedPhase::Live {
            self.load_initial().await;
        }
        self.persist_state().await;
    }

    /// Cancel everything outstanding, forget the screen and the seen set,
    /// then bootstrap again.
    pub(super) async fn reload(&mut self) {
        tracing::info!(feed = %self.spec.id, "Reloading feed");
        for subscription_id in self.backlog.cancel_all() {
            self.relay.close_subscription(&subscription_id);
        }
        self.relay.close_subscription(&self.spec.id);
        self.store_pending_imports().await;

        self.queue.clear();
        self.coalescer.clear();
        self.cache.clear();
        self.dangling.clear();
        self.dangling_ids.clear();
        self.profiles_requested.clear();
        self.feed.reset();
        self.bootstrap.reset();
        self.import_signal.reset();
        self.scroll.reset();
        self.save_state.cancel();
        self.pending_appeared = None;
        self.did_catch_up = false;
        self.catch_up_at = None;
        self.page_guard = None;
        self.empty_retry_at = None;
        self.restore_index = None;

        self.set_phase(FeedPhase::Reloading);
        self.publish_snapshot();
        self.start().await;
    }

    async fn enter_background(&mut self) {
        if !self.visible {
            return;
        }
        self.visible = false;
        self.relay.close_subscription(&self.spec.id);
        self.flush_imports().await;
        self.save_state.cancel();
        self.persist_state().await;
        self.did_catch_up = false;
        self.catch_up_at = None;
        tracing::debug!(feed = %self.spec.id, "Feed in background");
    }

    fn enter_foreground(&mut self) {
        if self.visible {
            return;
        }
        self.visible = true;
        if self.phase == FeedPhase::Live {
            self.refresh_realtime();
            self.catch_up_at = Some(Instant::now() + self.tuning.catchup_delay());
        }
        tracing::debug!(feed = %self.spec.id, "Feed in foreground");
    }

    async fn stop(&mut self) {
        self.store_pending_imports().await;
        for subscription_id in self.backlog.cancel_all() {
            self.relay.close_subscription(&subscription_id);
        }
        self.relay.close_subscription(&self.spec.id);
        if self.phase != FeedPhase::Initializing {
            self.persist_state().await;
        }
        tracing::debug!(feed = %self.spec.id, "Feed engine stopped");
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    pub(super) fn set_phase(&mut self, phase: FeedPhase) {
        if self.phase != phase {
            tracing::debug!(feed = %self.spec.id, from = ?self.phase, to = ?phase, "Feed phase changed");
            self.phase = phase;
            self.mark_dirty();
        }
    }

    pub(super) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn publish_if_dirty(&mut self, now: Instant) {
        if self.dirty && self.publisher.request(now) {
            self.publish_snapshot();
        }
    }

    fn publish_snapshot(&mut self) {
        self.revision += 1;
        let snapshot = FeedSnapshot {
            phase: self.phase,
            posts: self.feed.snapshot_posts().into(),
            unread: self.feed.unread(),
            restore_index: self.restore_index,
            empty: self.phase == FeedPhase::Live && self.feed.is_empty(),
            revision: self.revision,
        };
        self.snapshots.send_replace(snapshot);
        self.dirty = false;
    }
}
