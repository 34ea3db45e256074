//! Storage layer for chatwatch.
//!
//! Provides persistence for daily viewer activity, lifetime statistics,
//! heartbeat dedup, and listener leases using `rusqlite`.
//!
//! # Thread Safety
//!
//! [`Database`] wraps a `rusqlite::Connection`, which is `Send` but not
//! `Sync`. Long-lived services share one instance behind a `Mutex`; the
//! write paths here are short transactions, so contention stays low.
//!
//! # Schema
//!
//! Timestamps are stored as TEXT in RFC 3339 format with a fixed `Z` offset
//! and millisecond precision, so lexicographic ordering matches
//! chronological ordering. Calendar days are TEXT `YYYY-MM-DD`, which has
//! the same property. Day boundaries are UTC.
//!
//! The routine write path for `daily_stats` and `message_daily_agg` is
//! increment-only (`x = x + excluded.x`): concurrent writers compose by
//! addition instead of stomping each other. The only overwrite is the
//! explicitly opt-in reconciliation path.

mod locks;
mod stats;

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use thiserror::Error;

pub use locks::{InstanceRecord, LockRecord};
pub use stats::{LifetimeRecord, RankOutcome, WriteMode};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp in column {column}: {value}")]
    TimestampParse {
        column: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    /// Failed to parse a stored calendar date.
    #[error("invalid date in column {column}: {value}")]
    DateParse {
        column: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A raw chat message timestamp, replayed by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessageRecord {
    pub viewer_id: String,
    pub channel_id: String,
    pub timestamp: DateTime<Utc>,
}

/// An additive update for one `daily_stats` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyDelta {
    pub viewer_id: String,
    pub channel_id: String,
    pub date: NaiveDate,
    pub watch_seconds: i64,
    pub message_count: i64,
    pub emote_count: i64,
}

/// One persisted `daily_stats` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyStatRecord {
    pub viewer_id: String,
    pub channel_id: String,
    pub date: NaiveDate,
    pub watch_seconds: i64,
    pub message_count: i64,
    pub emote_count: i64,
}

/// An additive update for one `message_daily_agg` row.
///
/// Written by the chat-event ingestion path; read by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDelta {
    pub viewer_id: String,
    pub channel_id: String,
    pub date: NaiveDate,
    pub total_messages: i64,
    pub chat_messages: i64,
    pub subscriptions: i64,
    pub cheers: i64,
    pub gift_subs: i64,
    pub raids: i64,
    pub total_bits: i64,
}

impl Default for DailyDelta {
    fn default() -> Self {
        Self {
            viewer_id: String::new(),
            channel_id: String::new(),
            date: NaiveDate::default(),
            watch_seconds: 0,
            message_count: 0,
            emote_count: 0,
        }
    }
}

/// A tracked channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
}

/// A lifetime `last_watched_at` touch applied during heartbeat flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWatchedTouch {
    pub viewer_id: String,
    pub channel_id: String,
    pub watched_at: DateTime<Utc>,
}

/// Row counts for operator status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub channels: i64,
    pub chat_messages: i64,
    pub daily_rows: i64,
    pub message_rows: i64,
    pub lifetime_rows: i64,
    pub locks: i64,
    pub instances: i64,
}

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str, column: &'static str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            column,
            value: value.to_string(),
            source,
        })
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(value: &str, column: &'static str) -> Result<NaiveDate, DbError> {
    value.parse().map_err(|source| DbError::DateParse {
        column,
        value: value.to_string(),
        source,
    })
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            -- Raw chat timestamps, kept for the retention horizon so the
            -- reconciliation path can replay a day.
            CREATE TABLE IF NOT EXISTS chat_messages (
                viewer_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chat_messages_pair_ts
                ON chat_messages(viewer_id, channel_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_chat_messages_ts
                ON chat_messages(timestamp);

            CREATE TABLE IF NOT EXISTS daily_stats (
                viewer_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                date TEXT NOT NULL,
                watch_seconds INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                emote_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (viewer_id, channel_id, date)
            );

            CREATE INDEX IF NOT EXISTS idx_daily_stats_channel_date
                ON daily_stats(channel_id, date);

            CREATE TABLE IF NOT EXISTS message_daily_agg (
                viewer_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                date TEXT NOT NULL,
                total_messages INTEGER NOT NULL DEFAULT 0,
                chat_messages INTEGER NOT NULL DEFAULT 0,
                subscriptions INTEGER NOT NULL DEFAULT 0,
                cheers INTEGER NOT NULL DEFAULT 0,
                gift_subs INTEGER NOT NULL DEFAULT 0,
                raids INTEGER NOT NULL DEFAULT 0,
                total_bits INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (viewer_id, channel_id, date)
            );

            CREATE TABLE IF NOT EXISTS lifetime_stats (
                viewer_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                total_watch_time_minutes INTEGER NOT NULL DEFAULT 0,
                total_sessions INTEGER NOT NULL DEFAULT 0,
                avg_session_minutes INTEGER NOT NULL DEFAULT 0,
                first_watched_at TEXT,
                last_watched_at TEXT,
                total_messages INTEGER NOT NULL DEFAULT 0,
                total_chat_messages INTEGER NOT NULL DEFAULT 0,
                total_subscriptions INTEGER NOT NULL DEFAULT 0,
                total_cheers INTEGER NOT NULL DEFAULT 0,
                total_bits INTEGER NOT NULL DEFAULT 0,
                tracking_started_at TEXT NOT NULL,
                tracking_days INTEGER NOT NULL DEFAULT 0,
                longest_streak_days INTEGER NOT NULL DEFAULT 0,
                current_streak_days INTEGER NOT NULL DEFAULT 0,
                active_days_last_30 INTEGER NOT NULL DEFAULT 0,
                active_days_last_90 INTEGER NOT NULL DEFAULT 0,
                most_active_month TEXT,
                most_active_month_count INTEGER NOT NULL DEFAULT 0,
                watch_time_percentile REAL,
                message_percentile REAL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (viewer_id, channel_id)
            );

            CREATE INDEX IF NOT EXISTS idx_lifetime_channel_updated
                ON lifetime_stats(channel_id, updated_at);

            -- Cross-instance heartbeat dedup; best-effort by design.
            CREATE TABLE IF NOT EXISTS heartbeat_dedup (
                dedup_key TEXT PRIMARY KEY,
                seen_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS listener_locks (
                channel_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                label TEXT,
                last_heartbeat TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ---- channels ----

    /// Registers or renames a tracked channel.
    pub fn track_channel(&self, id: &str, name: &str, now: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO channels (id, name, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
            params![id, name, format_timestamp(now)],
        )?;
        Ok(())
    }

    /// Resolves a channel name to its ID, if tracked.
    pub fn resolve_channel_id(&self, name: &str) -> Result<Option<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM channels WHERE name = ?")?;
        let mut rows = stmt.query([name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Lists tracked channels ordered by name.
    pub fn list_channels(&self) -> Result<Vec<ChannelRecord>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM channels ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ChannelRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    // ---- raw chat messages ----

    /// Inserts a batch of raw chat message timestamps.
    pub fn record_chat_messages(&mut self, messages: &[ChatMessageRecord]) -> Result<usize, DbError> {
        if messages.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chat_messages (viewer_id, channel_id, timestamp) VALUES (?, ?, ?)",
            )?;
            for message in messages {
                stmt.execute(params![
                    message.viewer_id,
                    message.channel_id,
                    format_timestamp(message.timestamp),
                ])?;
            }
        }
        tx.commit()?;
        Ok(messages.len())
    }

    /// Chronologically ordered message timestamps for one viewer-day.
    pub fn message_timestamps_for_day(
        &self,
        viewer_id: &str,
        channel_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DateTime<Utc>>, DbError> {
        let day_start = format_date(date);
        let day_end = format_date(date + chrono::Duration::days(1));
        let mut stmt = self.conn.prepare(
            "
            SELECT timestamp
            FROM chat_messages
            WHERE viewer_id = ? AND channel_id = ? AND timestamp >= ? AND timestamp < ?
            ORDER BY timestamp ASC
            ",
        )?;
        let rows = stmt.query_map(params![viewer_id, channel_id, day_start, day_end], |row| {
            row.get::<_, String>(0)
        })?;
        let mut timestamps = Vec::new();
        for row in rows {
            timestamps.push(parse_timestamp(&row?, "chat_messages.timestamp")?);
        }
        Ok(timestamps)
    }

    /// Deletes chat messages older than the cutoff. Returns rows removed.
    pub fn prune_chat_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let removed = self.conn.execute(
            "DELETE FROM chat_messages WHERE timestamp < ?",
            [format_timestamp(cutoff)],
        )?;
        Ok(removed)
    }

    // ---- daily stats ----

    /// Applies a batch of additive daily-stat updates in one transaction.
    ///
    /// This is the only routine write path for `daily_stats`; increments
    /// commute, so interleaving with other writers cannot lose updates.
    pub fn apply_daily_deltas(&mut self, deltas: &[DailyDelta]) -> Result<usize, DbError> {
        if deltas.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        apply_daily_deltas_tx(&tx, deltas)?;
        tx.commit()?;
        Ok(deltas.len())
    }

    /// Overwrites one day's watch seconds from a batch reconstruction.
    ///
    /// Reconciliation only. Never call this on the hot heartbeat path;
    /// it replaces rather than increments.
    pub fn replace_daily_watch_seconds(
        &self,
        viewer_id: &str,
        channel_id: &str,
        date: NaiveDate,
        watch_seconds: i64,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO daily_stats (viewer_id, channel_id, date, watch_seconds)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(viewer_id, channel_id, date) DO UPDATE SET
                watch_seconds = excluded.watch_seconds
            ",
            params![viewer_id, channel_id, format_date(date), watch_seconds],
        )?;
        Ok(())
    }

    /// Fetches one daily-stat row.
    pub fn get_daily_stat(
        &self,
        viewer_id: &str,
        channel_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStatRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT viewer_id, channel_id, date, watch_seconds, message_count, emote_count
            FROM daily_stats
            WHERE viewer_id = ? AND channel_id = ? AND date = ?
            ",
        )?;
        let mut rows = stmt.query(params![viewer_id, channel_id, format_date(date)])?;
        match rows.next()? {
            Some(row) => {
                let date: String = row.get(2)?;
                Ok(Some(DailyStatRecord {
                    viewer_id: row.get(0)?,
                    channel_id: row.get(1)?,
                    date: parse_date(&date, "daily_stats.date")?,
                    watch_seconds: row.get(3)?,
                    message_count: row.get(4)?,
                    emote_count: row.get(5)?,
                }))
            }
            None => Ok(None),
        }
    }

    // ---- message daily aggregates ----

    /// Applies additive message-aggregate updates in one transaction.
    pub fn apply_message_deltas(&mut self, deltas: &[MessageDelta]) -> Result<usize, DbError> {
        if deltas.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO message_daily_agg
                (viewer_id, channel_id, date, total_messages, chat_messages, subscriptions,
                 cheers, gift_subs, raids, total_bits)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(viewer_id, channel_id, date) DO UPDATE SET
                    total_messages = message_daily_agg.total_messages + excluded.total_messages,
                    chat_messages = message_daily_agg.chat_messages + excluded.chat_messages,
                    subscriptions = message_daily_agg.subscriptions + excluded.subscriptions,
                    cheers = message_daily_agg.cheers + excluded.cheers,
                    gift_subs = message_daily_agg.gift_subs + excluded.gift_subs,
                    raids = message_daily_agg.raids + excluded.raids,
                    total_bits = message_daily_agg.total_bits + excluded.total_bits
                ",
            )?;
            for delta in deltas {
                stmt.execute(params![
                    delta.viewer_id,
                    delta.channel_id,
                    format_date(delta.date),
                    delta.total_messages,
                    delta.chat_messages,
                    delta.subscriptions,
                    delta.cheers,
                    delta.gift_subs,
                    delta.raids,
                    delta.total_bits,
                ])?;
            }
        }
        tx.commit()?;
        Ok(deltas.len())
    }

    // ---- heartbeat flush ----

    /// Persists one heartbeat flush: daily increments plus lifetime
    /// `last_watched_at` touches, atomically.
    pub fn flush_heartbeats(
        &mut self,
        deltas: &[DailyDelta],
        touches: &[LastWatchedTouch],
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        apply_daily_deltas_tx(&tx, deltas)?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO lifetime_stats
                (viewer_id, channel_id, last_watched_at, tracking_started_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(viewer_id, channel_id) DO UPDATE SET
                    last_watched_at = MAX(
                        COALESCE(lifetime_stats.last_watched_at, excluded.last_watched_at),
                        excluded.last_watched_at
                    ),
                    updated_at = excluded.updated_at
                ",
            )?;
            let now_str = format_timestamp(now);
            for touch in touches {
                stmt.execute(params![
                    touch.viewer_id,
                    touch.channel_id,
                    format_timestamp(touch.watched_at),
                    now_str,
                    now_str,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- persistent heartbeat dedup ----

    /// Records dedup keys, returning the subset not seen before.
    ///
    /// Callers treat a failure here as a degraded-but-continue condition;
    /// this method itself reports errors normally.
    pub fn filter_new_heartbeat_keys(
        &mut self,
        keys: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DbError> {
        let tx = self.conn.transaction()?;
        let mut fresh = Vec::new();
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO heartbeat_dedup (dedup_key, seen_at) VALUES (?, ?)")?;
            let now_str = format_timestamp(now);
            for key in keys {
                if stmt.execute(params![key, now_str])? == 1 {
                    fresh.push(key.clone());
                }
            }
        }
        tx.commit()?;
        Ok(fresh)
    }

    /// Deletes dedup rows older than the cutoff. Returns rows removed.
    pub fn prune_dedup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let removed = self.conn.execute(
            "DELETE FROM heartbeat_dedup WHERE seen_at < ?",
            [format_timestamp(cutoff)],
        )?;
        Ok(removed)
    }

    // ---- misc ----

    /// Distinct viewers with any activity for a channel.
    pub fn viewers_for_channel(&self, channel_id: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT viewer_id FROM daily_stats WHERE channel_id = ?1
            UNION
            SELECT viewer_id FROM message_daily_agg WHERE channel_id = ?1
            ORDER BY viewer_id ASC
            ",
        )?;
        let rows = stmt.query_map([channel_id], |row| row.get(0))?;
        let mut viewers = Vec::new();
        for row in rows {
            viewers.push(row?);
        }
        Ok(viewers)
    }

    /// Row counts for `cw status`.
    pub fn status_counts(&self) -> Result<StatusCounts, DbError> {
        let count = |table: &str| -> Result<i64, DbError> {
            Ok(self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        };
        Ok(StatusCounts {
            channels: count("channels")?,
            chat_messages: count("chat_messages")?,
            daily_rows: count("daily_stats")?,
            message_rows: count("message_daily_agg")?,
            lifetime_rows: count("lifetime_stats")?,
            locks: count("listener_locks")?,
            instances: count("instances")?,
        })
    }
}

fn apply_daily_deltas_tx(tx: &rusqlite::Transaction<'_>, deltas: &[DailyDelta]) -> Result<(), DbError> {
    let mut stmt = tx.prepare(
        "
        INSERT INTO daily_stats
        (viewer_id, channel_id, date, watch_seconds, message_count, emote_count)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(viewer_id, channel_id, date) DO UPDATE SET
            watch_seconds = daily_stats.watch_seconds + excluded.watch_seconds,
            message_count = daily_stats.message_count + excluded.message_count,
            emote_count = daily_stats.emote_count + excluded.emote_count
        ",
    )?;
    for delta in deltas {
        stmt.execute(params![
            delta.viewer_id,
            delta.channel_id,
            format_date(delta.date),
            delta.watch_seconds,
            delta.message_count,
            delta.emote_count,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn delta(viewer: &str, channel: &str, date: &str, seconds: i64) -> DailyDelta {
        DailyDelta {
            viewer_id: viewer.to_string(),
            channel_id: channel.to_string(),
            date: d(date),
            watch_seconds: seconds,
            ..DailyDelta::default()
        }
    }

    #[test]
    fn open_in_memory_database() {
        assert!(Database::open_in_memory().is_ok());
    }

    #[test]
    fn init_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cw.db");
        drop(Database::open(&path).unwrap());
        assert!(Database::open(&path).is_ok());
    }

    #[test]
    fn track_and_resolve_channel() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap();
        db.track_channel("chan-1", "somestreamer", now).unwrap();

        assert_eq!(
            db.resolve_channel_id("somestreamer").unwrap().as_deref(),
            Some("chan-1")
        );
        assert_eq!(db.resolve_channel_id("unknown").unwrap(), None);

        // Rename keeps the ID.
        db.track_channel("chan-1", "renamedstreamer", now).unwrap();
        assert_eq!(
            db.resolve_channel_id("renamedstreamer").unwrap().as_deref(),
            Some("chan-1")
        );
    }

    #[test]
    fn daily_deltas_increment_not_overwrite() {
        let mut db = Database::open_in_memory().unwrap();
        db.apply_daily_deltas(&[delta("v1", "c1", "2025-12-01", 60)])
            .unwrap();
        db.apply_daily_deltas(&[delta("v1", "c1", "2025-12-01", 30)])
            .unwrap();

        let row = db
            .get_daily_stat("v1", "c1", d("2025-12-01"))
            .unwrap()
            .unwrap();
        assert_eq!(row.watch_seconds, 90);
    }

    #[test]
    fn daily_deltas_keep_rows_separate_per_day_and_pair() {
        let mut db = Database::open_in_memory().unwrap();
        db.apply_daily_deltas(&[
            delta("v1", "c1", "2025-12-01", 60),
            delta("v1", "c1", "2025-12-02", 45),
            delta("v2", "c1", "2025-12-01", 15),
        ])
        .unwrap();

        assert_eq!(
            db.get_daily_stat("v1", "c1", d("2025-12-01"))
                .unwrap()
                .unwrap()
                .watch_seconds,
            60
        );
        assert_eq!(
            db.get_daily_stat("v1", "c1", d("2025-12-02"))
                .unwrap()
                .unwrap()
                .watch_seconds,
            45
        );
        assert_eq!(
            db.get_daily_stat("v2", "c1", d("2025-12-01"))
                .unwrap()
                .unwrap()
                .watch_seconds,
            15
        );
    }

    #[test]
    fn replace_daily_watch_seconds_overwrites() {
        let mut db = Database::open_in_memory().unwrap();
        db.apply_daily_deltas(&[delta("v1", "c1", "2025-12-01", 500)])
            .unwrap();
        db.replace_daily_watch_seconds("v1", "c1", d("2025-12-01"), 120)
            .unwrap();

        let row = db
            .get_daily_stat("v1", "c1", d("2025-12-01"))
            .unwrap()
            .unwrap();
        assert_eq!(row.watch_seconds, 120);
    }

    #[test]
    fn message_deltas_accumulate() {
        let mut db = Database::open_in_memory().unwrap();
        let base = MessageDelta {
            viewer_id: "v1".to_string(),
            channel_id: "c1".to_string(),
            date: d("2025-12-01"),
            total_messages: 3,
            chat_messages: 2,
            total_bits: 100,
            ..MessageDelta::default()
        };
        db.apply_message_deltas(&[base.clone()]).unwrap();
        db.apply_message_deltas(&[base]).unwrap();

        let (total, bits): (i64, i64) = db
            .conn
            .query_row(
                "SELECT total_messages, total_bits FROM message_daily_agg
                 WHERE viewer_id = 'v1' AND channel_id = 'c1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(total, 6);
        assert_eq!(bits, 200);
    }

    #[test]
    fn chat_messages_roundtrip_and_day_filter() {
        let mut db = Database::open_in_memory().unwrap();
        db.record_chat_messages(&[
            ChatMessageRecord {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                timestamp: at("2025-12-01T10:00:00Z"),
            },
            ChatMessageRecord {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                timestamp: at("2025-12-01T23:59:59Z"),
            },
            ChatMessageRecord {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                timestamp: at("2025-12-02T00:00:01Z"),
            },
        ])
        .unwrap();

        let day = db
            .message_timestamps_for_day("v1", "c1", d("2025-12-01"))
            .unwrap();
        assert_eq!(day.len(), 2);
        assert_eq!(day[0], at("2025-12-01T10:00:00Z"));
    }

    #[test]
    fn prune_chat_messages_respects_cutoff() {
        let mut db = Database::open_in_memory().unwrap();
        db.record_chat_messages(&[
            ChatMessageRecord {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                timestamp: at("2025-09-01T00:00:00Z"),
            },
            ChatMessageRecord {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                timestamp: at("2025-12-01T00:00:00Z"),
            },
        ])
        .unwrap();

        let removed = db.prune_chat_messages_before(at("2025-11-01T00:00:00Z")).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.status_counts().unwrap().chat_messages, 1);
    }

    #[test]
    fn dedup_keys_filter_repeats() {
        let mut db = Database::open_in_memory().unwrap();
        let now = at("2025-12-01T10:00:00Z");
        let keys = vec!["k1".to_string(), "k2".to_string()];

        let fresh = db.filter_new_heartbeat_keys(&keys, now).unwrap();
        assert_eq!(fresh, keys);

        let fresh = db
            .filter_new_heartbeat_keys(&["k2".to_string(), "k3".to_string()], now)
            .unwrap();
        assert_eq!(fresh, vec!["k3".to_string()]);
    }

    #[test]
    fn dedup_prune_allows_key_reuse() {
        let mut db = Database::open_in_memory().unwrap();
        let keys = vec!["k1".to_string()];
        db.filter_new_heartbeat_keys(&keys, at("2025-12-01T10:00:00Z"))
            .unwrap();
        db.prune_dedup_before(at("2025-12-01T11:00:00Z")).unwrap();

        let fresh = db
            .filter_new_heartbeat_keys(&keys, at("2025-12-01T12:00:00Z"))
            .unwrap();
        assert_eq!(fresh, keys);
    }

    #[test]
    fn flush_heartbeats_writes_daily_and_touch_atomically() {
        let mut db = Database::open_in_memory().unwrap();
        let now = at("2025-12-01T10:00:05Z");
        db.flush_heartbeats(
            &[delta("v1", "c1", "2025-12-01", 75)],
            &[LastWatchedTouch {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                watched_at: at("2025-12-01T10:00:00Z"),
            }],
            now,
        )
        .unwrap();

        let row = db
            .get_daily_stat("v1", "c1", d("2025-12-01"))
            .unwrap()
            .unwrap();
        assert_eq!(row.watch_seconds, 75);

        let lifetime = db.get_lifetime("v1", "c1").unwrap().unwrap();
        assert_eq!(lifetime.stats.last_watched_at, Some(at("2025-12-01T10:00:00Z")));
    }

    #[test]
    fn flush_heartbeats_touch_never_regresses_last_watched() {
        let mut db = Database::open_in_memory().unwrap();
        let touch = |ts: &str| LastWatchedTouch {
            viewer_id: "v1".to_string(),
            channel_id: "c1".to_string(),
            watched_at: at(ts),
        };
        db.flush_heartbeats(&[], &[touch("2025-12-01T12:00:00Z")], at("2025-12-01T12:00:05Z"))
            .unwrap();
        db.flush_heartbeats(&[], &[touch("2025-12-01T09:00:00Z")], at("2025-12-01T12:00:10Z"))
            .unwrap();

        let lifetime = db.get_lifetime("v1", "c1").unwrap().unwrap();
        assert_eq!(lifetime.stats.last_watched_at, Some(at("2025-12-01T12:00:00Z")));
    }

    #[test]
    fn viewers_for_channel_unions_sources() {
        let mut db = Database::open_in_memory().unwrap();
        db.apply_daily_deltas(&[delta("v1", "c1", "2025-12-01", 10)])
            .unwrap();
        db.apply_message_deltas(&[MessageDelta {
            viewer_id: "v2".to_string(),
            channel_id: "c1".to_string(),
            date: d("2025-12-01"),
            total_messages: 1,
            ..MessageDelta::default()
        }])
        .unwrap();
        db.apply_daily_deltas(&[delta("v3", "c2", "2025-12-01", 10)])
            .unwrap();

        let viewers = db.viewers_for_channel("c1").unwrap();
        assert_eq!(viewers, vec!["v1".to_string(), "v2".to_string()]);
    }
}
