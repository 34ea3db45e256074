//! Core domain logic for chatwatch.
//!
//! This crate contains the fundamental types and logic for:
//! - Session reconstruction: inferring watch sessions from chat timestamps
//! - Lifetime statistics: totals, streaks, and activity windows per viewer
//! - Ranking: percent ranks across a channel's viewer population
//! - Caching: a small TTL cache shared by dedup and channel resolution

pub mod cache;
pub mod lifetime;
pub mod rank;
pub mod sessions;
pub mod types;

pub use cache::TtlCache;
pub use lifetime::{DailyWatchRow, LifetimeStats, MessageDailyRow, compute_lifetime};
pub use rank::percent_ranks;
pub use sessions::{
    SessionAccumulator, SessionConfig, StreamBounds, WatchSession, reconstruct_sessions,
    total_watch_seconds,
};
pub use types::{ChannelId, ValidationError, ViewerId};
