//! Feed synchronization and thread reconstruction.
//!
//! Records reach a feed from the local store and from relays, in any order,
//! possibly twice, and often before their parents. This module turns that
//! stream into a stable, newest-first list of thread leafs.
//!
//! # Architecture
//!
//! - [`engine`] - the per-feed actor and its handle; the only writer of a feed
//! - [`view`] - the on-screen list: merging, trimming, unread counting, filters
//! - [`thread`] - ancestry resolution and rendering of records into leafs
//! - [`arena`] - records on screen plus their parent/child adjacency
//! - [`relations`], [`backlog`], [`bootstrap`] - waiting for what is not local yet
//! - [`dedup`], [`filter`], [`cache`], [`throttle`] - supporting pieces
//!
//! # Example
//!
//! ```ignore
//! let handle = feed::spawn(spec, &config, lists, seen, services, inbound_rx).await?;
//! handle.send(FeedCommand::Start).await?;
//! let snapshot = handle.snapshot();
//! ```

pub mod arena;
pub mod backlog;
pub mod bootstrap;
pub mod cache;
pub mod dedup;
pub mod engine;
mod fetching;
pub mod filter;
mod merge;
pub mod relations;
pub mod snapshot;
pub mod thread;
pub mod throttle;
pub mod view;

pub use dedup::SeenRegistry;
pub use engine::{spawn, EngineError, EngineServices, FeedCommand, FeedHandle, FeedSpec};
pub use filter::{FilterLists, FilterPipeline};
pub use snapshot::{FeedPhase, FeedSnapshot, SnapshotPost};
pub use view::{Feed, FeedLimits, MergeOutcome};
