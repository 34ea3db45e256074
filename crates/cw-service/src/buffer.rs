//! Write-behind buffer for viewer heartbeats.
//!
//! Heartbeats arrive far faster than SQLite likes individual writes, so
//! submissions are deduplicated and coalesced in memory per
//! `(viewer, channel, day)` and flushed in batches. Flushes run on a timer
//! and early when the buffered heartbeat count crosses the batch size. A
//! failed flush requeues everything and stretches the timer with bounded
//! exponential backoff.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use cw_core::cache::TtlCache;
use cw_db::{DailyDelta, Database, LastWatchedTouch};
use tokio::sync::watch;

use crate::ServiceError;

/// One watch-time heartbeat as reported by a channel listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub viewer_id: String,
    /// Channel name as seen on the wire; resolved to an id on submit.
    pub channel_name: String,
    pub timestamp: DateTime<Utc>,
    pub watch_seconds: i64,
}

/// Buffer tuning knobs. Defaults match the documented service profile.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Base interval between timed flushes.
    pub flush_interval: Duration,
    /// Buffered heartbeat count that triggers an early flush.
    pub batch_size: usize,
    /// How long a heartbeat key suppresses duplicates.
    pub dedup_ttl: Duration,
    /// Hard cap on in-memory dedup entries.
    pub dedup_capacity: usize,
    /// How long a resolved channel name stays cached.
    pub channel_cache_ttl: Duration,
    /// How often the persistent dedup table is pruned.
    pub dedup_prune_interval: Duration,
    /// Ceiling for the flush-interval backoff multiplier.
    pub max_backoff_multiplier: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            batch_size: 200,
            dedup_ttl: Duration::from_secs(300),
            dedup_capacity: 20_000,
            channel_cache_ttl: Duration::from_secs(300),
            dedup_prune_interval: Duration::from_secs(60),
            max_backoff_multiplier: 32,
        }
    }
}

/// Where flushed watch time gets announced.
///
/// The production sink posts to downstream consumers; tests swap in a
/// recorder. Failures must be handled internally, a sink cannot fail a
/// flush that already committed.
pub trait NotificationSink {
    fn watch_time_recorded(&self, viewer_id: &str, channel_id: &str, watch_seconds: i64);
}

/// Default sink: announces flushed watch time to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn watch_time_recorded(&self, viewer_id: &str, channel_id: &str, watch_seconds: i64) {
        tracing::info!(viewer_id, channel_id, watch_seconds, "watch time recorded");
    }
}

/// What happened to a submitted heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Buffered,
    /// Same heartbeat seen within the dedup TTL.
    Duplicate,
    /// Channel name does not resolve to a tracked channel.
    UnknownChannel,
    /// Non-positive watch duration.
    Invalid,
}

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// `(viewer, channel, day)` rows written.
    pub pairs: usize,
    /// Total watch seconds persisted.
    pub watch_seconds: i64,
    /// Heartbeats dropped by the persistent dedup table.
    pub persisted_duplicates: usize,
}

#[derive(Debug, Clone)]
struct BufferedHeartbeat {
    dedup_key: String,
    watch_seconds: i64,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    watch_seconds: i64,
    last_watched_at: DateTime<Utc>,
    heartbeats: Vec<BufferedHeartbeat>,
}

type PendingKey = (String, String, NaiveDate);

struct BufferState {
    dedup: TtlCache<String, ()>,
    /// Positive resolutions only; unknown names are re-checked every time
    /// so a channel tracked mid-stream starts counting immediately.
    channels: TtlCache<String, String>,
    pending: HashMap<PendingKey, PendingEntry>,
    heartbeat_count: usize,
    backoff_multiplier: u32,
    last_dedup_prune: Instant,
    /// Keys claimed in the dedup table by a flush whose write then failed.
    /// The retry must treat them as fresh or the requeued data is lost.
    claimed_keys: HashSet<String>,
}

/// The heartbeat ingestion buffer. Cheap to share behind an [`Arc`].
pub struct HeartbeatBuffer {
    db: Arc<Mutex<Database>>,
    sink: Arc<dyn NotificationSink + Send + Sync>,
    config: BufferConfig,
    state: Mutex<BufferState>,
}

impl HeartbeatBuffer {
    pub fn new(
        db: Arc<Mutex<Database>>,
        sink: Arc<dyn NotificationSink + Send + Sync>,
        config: BufferConfig,
    ) -> Self {
        let state = BufferState {
            dedup: TtlCache::new(config.dedup_ttl, config.dedup_capacity),
            channels: TtlCache::new(config.channel_cache_ttl, 1024),
            pending: HashMap::new(),
            heartbeat_count: 0,
            backoff_multiplier: 1,
            last_dedup_prune: Instant::now(),
            claimed_keys: HashSet::new(),
        };
        Self {
            db,
            sink,
            config,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accepts one heartbeat into the buffer.
    ///
    /// May trigger an early flush when the batch threshold is crossed; a
    /// flush failure in that path is logged and retried by the timer, the
    /// submission itself still succeeds.
    pub fn submit(&self, heartbeat: &Heartbeat) -> Result<SubmitOutcome, ServiceError> {
        self.submit_at(heartbeat, Instant::now())
    }

    fn submit_at(
        &self,
        heartbeat: &Heartbeat,
        now: Instant,
    ) -> Result<SubmitOutcome, ServiceError> {
        if heartbeat.watch_seconds <= 0 {
            return Ok(SubmitOutcome::Invalid);
        }

        let should_flush = {
            let mut state = self.state();

            let channel_id = match state.channels.get_at(&heartbeat.channel_name, now) {
                Some(id) => id.clone(),
                None => {
                    let resolved = self.db().resolve_channel_id(&heartbeat.channel_name)?;
                    let Some(id) = resolved else {
                        return Ok(SubmitOutcome::UnknownChannel);
                    };
                    state
                        .channels
                        .insert_at(heartbeat.channel_name.clone(), id.clone(), now);
                    id
                }
            };

            let dedup_key = format!(
                "{}|{}|{}|{}",
                heartbeat.viewer_id,
                channel_id,
                heartbeat
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                heartbeat.watch_seconds,
            );
            if !state.dedup.insert_if_absent_at(dedup_key.clone(), (), now) {
                return Ok(SubmitOutcome::Duplicate);
            }

            let key = (
                heartbeat.viewer_id.clone(),
                channel_id,
                heartbeat.timestamp.date_naive(),
            );
            let entry = state.pending.entry(key).or_insert_with(|| PendingEntry {
                watch_seconds: 0,
                last_watched_at: heartbeat.timestamp,
                heartbeats: Vec::new(),
            });
            entry.watch_seconds += heartbeat.watch_seconds;
            entry.last_watched_at = entry.last_watched_at.max(heartbeat.timestamp);
            entry.heartbeats.push(BufferedHeartbeat {
                dedup_key,
                watch_seconds: heartbeat.watch_seconds,
            });
            state.heartbeat_count += 1;
            state.heartbeat_count >= self.config.batch_size
        };

        if should_flush {
            if let Err(error) = self.flush() {
                tracing::warn!(%error, "threshold flush failed; heartbeats requeued");
            }
        }
        Ok(SubmitOutcome::Buffered)
    }

    /// Writes all buffered heartbeats to the database.
    ///
    /// On error the drained entries are merged back into the buffer and the
    /// backoff multiplier doubles; nothing is lost short of process death.
    pub fn flush(&self) -> Result<FlushReport, ServiceError> {
        self.flush_at(Utc::now())
    }

    fn flush_at(&self, now: DateTime<Utc>) -> Result<FlushReport, ServiceError> {
        let mut state = self.state();
        if state.pending.is_empty() {
            state.backoff_multiplier = 1;
            return Ok(FlushReport::default());
        }
        let drained = std::mem::take(&mut state.pending);
        state.heartbeat_count = 0;

        // Persistent dedup is best effort: if the table is unavailable we
        // count everything and rely on the in-memory cache alone.
        let all_keys: Vec<String> = drained
            .values()
            .flat_map(|entry| entry.heartbeats.iter().map(|hb| hb.dedup_key.clone()))
            .collect();
        let claimed = std::mem::take(&mut state.claimed_keys);
        let mut fresh: HashSet<String> = match self.db().filter_new_heartbeat_keys(&all_keys, now) {
            Ok(fresh) => fresh.into_iter().collect(),
            Err(error) => {
                tracing::warn!(%error, "persistent dedup unavailable; continuing without it");
                all_keys.iter().cloned().collect()
            }
        };
        fresh.extend(claimed);

        let mut deltas = Vec::new();
        let mut touches = Vec::new();
        let mut report = FlushReport::default();
        for ((viewer_id, channel_id, date), entry) in &drained {
            let stale: i64 = entry
                .heartbeats
                .iter()
                .filter(|hb| !fresh.contains(&hb.dedup_key))
                .map(|hb| hb.watch_seconds)
                .sum();
            let stale_count = entry
                .heartbeats
                .iter()
                .filter(|hb| !fresh.contains(&hb.dedup_key))
                .count();
            report.persisted_duplicates += stale_count;
            let watch_seconds = entry.watch_seconds - stale;
            if watch_seconds <= 0 {
                continue;
            }
            deltas.push(DailyDelta {
                viewer_id: viewer_id.clone(),
                channel_id: channel_id.clone(),
                date: *date,
                watch_seconds,
                ..DailyDelta::default()
            });
            touches.push(LastWatchedTouch {
                viewer_id: viewer_id.clone(),
                channel_id: channel_id.clone(),
                watched_at: entry.last_watched_at,
            });
            report.pairs += 1;
            report.watch_seconds += watch_seconds;
        }

        if deltas.is_empty() {
            state.backoff_multiplier = 1;
            return Ok(report);
        }

        if let Err(error) = self.db().flush_heartbeats(&deltas, &touches, now) {
            for (key, entry) in drained {
                state.heartbeat_count += entry.heartbeats.len();
                let requeued = state.pending.entry(key).or_insert_with(|| PendingEntry {
                    watch_seconds: 0,
                    last_watched_at: entry.last_watched_at,
                    heartbeats: Vec::new(),
                });
                requeued.watch_seconds += entry.watch_seconds;
                requeued.last_watched_at = requeued.last_watched_at.max(entry.last_watched_at);
                requeued.heartbeats.extend(entry.heartbeats);
            }
            state.claimed_keys = fresh;
            state.backoff_multiplier = (state.backoff_multiplier * 2)
                .min(self.config.max_backoff_multiplier);
            tracing::warn!(
                backoff = state.backoff_multiplier,
                "flush failed; requeued buffered heartbeats"
            );
            return Err(error.into());
        }

        state.backoff_multiplier = 1;
        drop(state);

        for delta in &deltas {
            self.sink
                .watch_time_recorded(&delta.viewer_id, &delta.channel_id, delta.watch_seconds);
        }
        tracing::debug!(
            pairs = report.pairs,
            watch_seconds = report.watch_seconds,
            "flushed heartbeats"
        );
        Ok(report)
    }

    fn maintain_caches(&self) {
        let prune_due = {
            let mut state = self.state();
            state.dedup.purge_expired();
            state.channels.purge_expired();
            if state.last_dedup_prune.elapsed() >= self.config.dedup_prune_interval {
                state.last_dedup_prune = Instant::now();
                true
            } else {
                false
            }
        };
        if prune_due {
            let ttl = chrono::Duration::from_std(self.config.dedup_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            match self.db().prune_dedup_before(Utc::now() - ttl) {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed, "pruned persistent dedup keys");
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "dedup prune failed"),
            }
        }
    }

    /// Timer loop: flush on an interval stretched by the current backoff,
    /// plus cache maintenance. Performs a final flush on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.config.flush_interval * self.state().backoff_multiplier;
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    if let Err(error) = self.flush() {
                        tracing::warn!(%error, "timed flush failed");
                    }
                    self.maintain_caches();
                }
                _ = shutdown.changed() => {
                    if let Err(error) = self.flush() {
                        tracing::error!(%error, "final flush failed; buffered heartbeats lost");
                    }
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    fn pending_pairs(&self) -> usize {
        self.state().pending.len()
    }

    #[cfg(test)]
    fn backoff(&self) -> u32 {
        self.state().backoff_multiplier
    }
}
