//! threadline: feed synchronization and thread reconstruction for
//! relay-based social timelines.
//!
//! The [`feed`] module holds the per-feed engine; [`storage`] the SQLite
//! record store it reads from; [`relay`] the outbound request port.

pub mod config;
pub mod feed;
pub mod record;
pub mod relay;
pub mod storage;
pub mod trust;
pub mod util;
