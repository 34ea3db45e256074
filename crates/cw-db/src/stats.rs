//! Lifetime aggregation and percentile ranking over the daily tables.

use chrono::{DateTime, Duration, Utc};
use cw_core::lifetime::{DailyWatchRow, LifetimeStats, MessageDailyRow, compute_lifetime};
use cw_core::rank::percent_ranks;
use rusqlite::params;
use serde::Serialize;

use crate::{Database, DbError, format_timestamp, parse_date, parse_timestamp};

/// How the aggregator persists cumulative fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Default: cumulative totals keep `MAX(old, new)`, `first_watched_at`
    /// keeps the earlier value, `last_watched_at` the later. A partial or
    /// delayed recompute can never erase previously observed maxima.
    PreventDecreases,
    /// Reconciliation: computed values are written as-is.
    AllowDecreases,
}

/// One persisted `lifetime_stats` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifetimeRecord {
    pub viewer_id: String,
    pub channel_id: String,
    pub stats: LifetimeStats,
    pub watch_time_percentile: Option<f64>,
    pub message_percentile: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a percentile refresh for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOutcome {
    /// The channel has no lifetime rows at all.
    NoRows,
    /// Nothing changed inside the recompute window; ranks left as-is.
    NoRecentChanges,
    /// Ranks recomputed over `total` rows; `refreshed` rows rewritten.
    Updated { total: usize, refreshed: usize },
}

impl Database {
    /// Recomputes and persists the lifetime profile for one pair.
    ///
    /// Safe to re-run at any time; with [`WriteMode::PreventDecreases`] a
    /// rerun over unchanged data is a no-op apart from `updated_at`.
    pub fn aggregate_lifetime(
        &mut self,
        viewer_id: &str,
        channel_id: &str,
        mode: WriteMode,
    ) -> Result<LifetimeStats, DbError> {
        self.aggregate_lifetime_at(viewer_id, channel_id, mode, Utc::now())
    }

    pub(crate) fn aggregate_lifetime_at(
        &mut self,
        viewer_id: &str,
        channel_id: &str,
        mode: WriteMode,
        now: DateTime<Utc>,
    ) -> Result<LifetimeStats, DbError> {
        let daily = self.daily_watch_rows(viewer_id, channel_id)?;
        let messages = self.message_rows(viewer_id, channel_id)?;
        let stats = compute_lifetime(&daily, &messages, now);
        self.upsert_lifetime(viewer_id, channel_id, &stats, mode, now)?;
        tracing::debug!(
            viewer_id,
            channel_id,
            minutes = stats.total_watch_time_minutes,
            tracking_days = stats.tracking_days,
            "aggregated lifetime stats"
        );
        Ok(stats)
    }

    fn daily_watch_rows(
        &self,
        viewer_id: &str,
        channel_id: &str,
    ) -> Result<Vec<DailyWatchRow>, DbError> {
        let mut stmt = self.conn().prepare(
            "
            SELECT date, watch_seconds
            FROM daily_stats
            WHERE viewer_id = ? AND channel_id = ?
            ORDER BY date ASC
            ",
        )?;
        let rows = stmt.query_map(params![viewer_id, channel_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut daily = Vec::new();
        for row in rows {
            let (date, watch_seconds) = row?;
            daily.push(DailyWatchRow {
                date: parse_date(&date, "daily_stats.date")?,
                watch_seconds,
            });
        }
        Ok(daily)
    }

    fn message_rows(
        &self,
        viewer_id: &str,
        channel_id: &str,
    ) -> Result<Vec<MessageDailyRow>, DbError> {
        let mut stmt = self.conn().prepare(
            "
            SELECT date, total_messages, chat_messages, subscriptions, cheers,
                   gift_subs, raids, total_bits
            FROM message_daily_agg
            WHERE viewer_id = ? AND channel_id = ?
            ORDER BY date ASC
            ",
        )?;
        let rows = stmt.query_map(params![viewer_id, channel_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (date, total, chat, subs, cheers, gifts, raids, bits) = row?;
            messages.push(MessageDailyRow {
                date: parse_date(&date, "message_daily_agg.date")?,
                total_messages: total,
                chat_messages: chat,
                subscriptions: subs,
                cheers,
                gift_subs: gifts,
                raids,
                total_bits: bits,
            });
        }
        Ok(messages)
    }

    /// Single conditional upsert; percentile columns are never touched here.
    fn upsert_lifetime(
        &self,
        viewer_id: &str,
        channel_id: &str,
        stats: &LifetimeStats,
        mode: WriteMode,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let guarded_update = "
            total_watch_time_minutes =
                MAX(lifetime_stats.total_watch_time_minutes, excluded.total_watch_time_minutes),
            total_sessions = MAX(lifetime_stats.total_sessions, excluded.total_sessions),
            total_messages = MAX(lifetime_stats.total_messages, excluded.total_messages),
            total_chat_messages =
                MAX(lifetime_stats.total_chat_messages, excluded.total_chat_messages),
            total_subscriptions =
                MAX(lifetime_stats.total_subscriptions, excluded.total_subscriptions),
            total_cheers = MAX(lifetime_stats.total_cheers, excluded.total_cheers),
            total_bits = MAX(lifetime_stats.total_bits, excluded.total_bits),
            first_watched_at = CASE
                WHEN lifetime_stats.first_watched_at IS NULL THEN excluded.first_watched_at
                WHEN excluded.first_watched_at IS NULL THEN lifetime_stats.first_watched_at
                ELSE MIN(lifetime_stats.first_watched_at, excluded.first_watched_at)
            END,
            last_watched_at = CASE
                WHEN lifetime_stats.last_watched_at IS NULL THEN excluded.last_watched_at
                WHEN excluded.last_watched_at IS NULL THEN lifetime_stats.last_watched_at
                ELSE MAX(lifetime_stats.last_watched_at, excluded.last_watched_at)
            END,
            tracking_started_at =
                MIN(lifetime_stats.tracking_started_at, excluded.tracking_started_at),
        ";
        let plain_update = "
            total_watch_time_minutes = excluded.total_watch_time_minutes,
            total_sessions = excluded.total_sessions,
            total_messages = excluded.total_messages,
            total_chat_messages = excluded.total_chat_messages,
            total_subscriptions = excluded.total_subscriptions,
            total_cheers = excluded.total_cheers,
            total_bits = excluded.total_bits,
            first_watched_at = excluded.first_watched_at,
            last_watched_at = excluded.last_watched_at,
            tracking_started_at = excluded.tracking_started_at,
        ";
        let cumulative = match mode {
            WriteMode::PreventDecreases => guarded_update,
            WriteMode::AllowDecreases => plain_update,
        };
        // Point-in-time fields are always overwritten.
        let sql = format!(
            "
            INSERT INTO lifetime_stats
            (viewer_id, channel_id, total_watch_time_minutes, total_sessions,
             avg_session_minutes, first_watched_at, last_watched_at, total_messages,
             total_chat_messages, total_subscriptions, total_cheers, total_bits,
             tracking_started_at, tracking_days, longest_streak_days, current_streak_days,
             active_days_last_30, active_days_last_90, most_active_month,
             most_active_month_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(viewer_id, channel_id) DO UPDATE SET
            {cumulative}
                avg_session_minutes = excluded.avg_session_minutes,
                tracking_days = excluded.tracking_days,
                longest_streak_days = excluded.longest_streak_days,
                current_streak_days = excluded.current_streak_days,
                active_days_last_30 = excluded.active_days_last_30,
                active_days_last_90 = excluded.active_days_last_90,
                most_active_month = excluded.most_active_month,
                most_active_month_count = excluded.most_active_month_count,
                updated_at = excluded.updated_at
            "
        );
        self.conn().execute(
            &sql,
            params![
                viewer_id,
                channel_id,
                stats.total_watch_time_minutes,
                stats.total_sessions,
                stats.avg_session_minutes,
                stats.first_watched_at.map(format_timestamp),
                stats.last_watched_at.map(format_timestamp),
                stats.total_messages,
                stats.total_chat_messages,
                stats.total_subscriptions,
                stats.total_cheers,
                stats.total_bits,
                format_timestamp(stats.tracking_started_at),
                stats.tracking_days,
                stats.longest_streak_days,
                stats.current_streak_days,
                stats.active_days_last_30,
                stats.active_days_last_90,
                stats.most_active_month,
                stats.most_active_month_count,
                format_timestamp(now),
            ],
        )?;
        Ok(())
    }

    /// Fetches one lifetime row.
    pub fn get_lifetime(
        &self,
        viewer_id: &str,
        channel_id: &str,
    ) -> Result<Option<LifetimeRecord>, DbError> {
        let mut stmt = self.conn().prepare(
            "
            SELECT viewer_id, channel_id, total_watch_time_minutes, total_sessions,
                   avg_session_minutes, first_watched_at, last_watched_at, total_messages,
                   total_chat_messages, total_subscriptions, total_cheers, total_bits,
                   tracking_started_at, tracking_days, longest_streak_days,
                   current_streak_days, active_days_last_30, active_days_last_90,
                   most_active_month, most_active_month_count, watch_time_percentile,
                   message_percentile, updated_at
            FROM lifetime_stats
            WHERE viewer_id = ? AND channel_id = ?
            ",
        )?;
        let mut rows = stmt.query(params![viewer_id, channel_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let first_watched: Option<String> = row.get(5)?;
        let last_watched: Option<String> = row.get(6)?;
        let tracking_started: String = row.get(12)?;
        let updated: String = row.get(22)?;

        Ok(Some(LifetimeRecord {
            viewer_id: row.get(0)?,
            channel_id: row.get(1)?,
            stats: LifetimeStats {
                total_watch_time_minutes: row.get(2)?,
                total_sessions: row.get(3)?,
                avg_session_minutes: row.get(4)?,
                first_watched_at: first_watched
                    .map(|v| parse_timestamp(&v, "lifetime_stats.first_watched_at"))
                    .transpose()?,
                last_watched_at: last_watched
                    .map(|v| parse_timestamp(&v, "lifetime_stats.last_watched_at"))
                    .transpose()?,
                total_messages: row.get(7)?,
                total_chat_messages: row.get(8)?,
                total_subscriptions: row.get(9)?,
                total_cheers: row.get(10)?,
                total_bits: row.get(11)?,
                tracking_started_at: parse_timestamp(
                    &tracking_started,
                    "lifetime_stats.tracking_started_at",
                )?,
                tracking_days: row.get(13)?,
                longest_streak_days: row.get(14)?,
                current_streak_days: row.get(15)?,
                active_days_last_30: row.get(16)?,
                active_days_last_90: row.get(17)?,
                most_active_month: row.get(18)?,
                most_active_month_count: row.get(19)?,
            },
            watch_time_percentile: row.get(20)?,
            message_percentile: row.get(21)?,
            updated_at: parse_timestamp(&updated, "lifetime_stats.updated_at")?,
        }))
    }

    /// Recomputes percentile ranks for a channel's viewers.
    ///
    /// Rate-limited by design: skips entirely when no row changed inside the
    /// recompute window, and only recently-changed rows are rewritten. Rows
    /// outside the window keep their last-computed percentile.
    pub fn refresh_channel_percentiles(
        &mut self,
        channel_id: &str,
        window: Duration,
    ) -> Result<RankOutcome, DbError> {
        self.refresh_channel_percentiles_at(channel_id, window, Utc::now())
    }

    pub(crate) fn refresh_channel_percentiles_at(
        &mut self,
        channel_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RankOutcome, DbError> {
        struct RankRow {
            viewer_id: String,
            watch_minutes: i64,
            messages: i64,
            updated_at: String,
        }

        let rows = {
            let mut stmt = self.conn().prepare(
                "
                SELECT viewer_id, total_watch_time_minutes, total_messages, updated_at
                FROM lifetime_stats
                WHERE channel_id = ?
                ",
            )?;
            let mapped = stmt.query_map([channel_id], |row| {
                Ok(RankRow {
                    viewer_id: row.get(0)?,
                    watch_minutes: row.get(1)?,
                    messages: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        if rows.is_empty() {
            return Ok(RankOutcome::NoRows);
        }

        let cutoff = format_timestamp(now - window);
        let changed: Vec<&RankRow> = rows.iter().filter(|row| row.updated_at >= cutoff).collect();
        if changed.is_empty() {
            return Ok(RankOutcome::NoRecentChanges);
        }

        let watch_input: Vec<(String, i64)> = rows
            .iter()
            .map(|row| (row.viewer_id.clone(), row.watch_minutes))
            .collect();
        let message_input: Vec<(String, i64)> = rows
            .iter()
            .map(|row| (row.viewer_id.clone(), row.messages))
            .collect();
        let watch_ranks: std::collections::HashMap<String, f64> =
            percent_ranks(&watch_input).into_iter().collect();
        let message_ranks: std::collections::HashMap<String, f64> =
            percent_ranks(&message_input).into_iter().collect();

        let refreshed = changed.len();
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                UPDATE lifetime_stats
                SET watch_time_percentile = ?, message_percentile = ?
                WHERE viewer_id = ? AND channel_id = ?
                ",
            )?;
            for row in &changed {
                stmt.execute(params![
                    watch_ranks.get(&row.viewer_id),
                    message_ranks.get(&row.viewer_id),
                    row.viewer_id,
                    channel_id,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(channel_id, total = rows.len(), refreshed, "refreshed percentiles");
        Ok(RankOutcome::Updated {
            total: rows.len(),
            refreshed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DailyDelta;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn seed_days(db: &mut Database, viewer: &str, channel: &str, days: &[(&str, i64)]) {
        let deltas: Vec<DailyDelta> = days
            .iter()
            .map(|(date, seconds)| DailyDelta {
                viewer_id: viewer.to_string(),
                channel_id: channel.to_string(),
                date: d(date),
                watch_seconds: *seconds,
                ..DailyDelta::default()
            })
            .collect();
        db.apply_daily_deltas(&deltas).unwrap();
    }

    #[test]
    fn aggregate_persists_computed_profile() {
        let mut db = Database::open_in_memory().unwrap();
        seed_days(
            &mut db,
            "v1",
            "c1",
            &[("2025-12-01", 3600), ("2025-12-02", 1800)],
        );

        let now = at("2025-12-03T12:00:00Z");
        let stats = db
            .aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();
        assert_eq!(stats.total_watch_time_minutes, 90);

        let record = db.get_lifetime("v1", "c1").unwrap().unwrap();
        assert_eq!(record.stats.total_watch_time_minutes, 90);
        assert_eq!(record.stats.total_sessions, 2);
        assert_eq!(record.stats.current_streak_days, 2);
        assert_eq!(record.updated_at, now);
    }

    #[test]
    fn aggregate_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        seed_days(&mut db, "v1", "c1", &[("2025-12-01", 3600)]);

        let now = at("2025-12-02T08:00:00Z");
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();
        let first = db.get_lifetime("v1", "c1").unwrap().unwrap();

        let later = at("2025-12-02T09:00:00Z");
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, later)
            .unwrap();
        let second = db.get_lifetime("v1", "c1").unwrap().unwrap();

        assert_eq!(first.stats, second.stats);
        assert_ne!(first.updated_at, second.updated_at);
    }

    #[test]
    fn monotonicity_guard_blocks_regression() {
        let mut db = Database::open_in_memory().unwrap();
        seed_days(&mut db, "v1", "c1", &[("2025-12-01", 7200)]);
        let now = at("2025-12-01T23:00:00Z");
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();
        assert_eq!(
            db.get_lifetime("v1", "c1").unwrap().unwrap().stats.total_watch_time_minutes,
            120
        );

        // Simulate a partial data source: the daily row shrinks to 30 minutes.
        db.replace_daily_watch_seconds("v1", "c1", d("2025-12-01"), 1800)
            .unwrap();
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();
        assert_eq!(
            db.get_lifetime("v1", "c1").unwrap().unwrap().stats.total_watch_time_minutes,
            120
        );

        // Explicit reconciliation takes the lower value.
        db.aggregate_lifetime_at("v1", "c1", WriteMode::AllowDecreases, now)
            .unwrap();
        assert_eq!(
            db.get_lifetime("v1", "c1").unwrap().unwrap().stats.total_watch_time_minutes,
            30
        );
    }

    #[test]
    fn guard_keeps_earlier_first_and_later_last_watched() {
        let mut db = Database::open_in_memory().unwrap();
        seed_days(
            &mut db,
            "v1",
            "c1",
            &[("2025-11-01", 600), ("2025-12-01", 600)],
        );
        let now = at("2025-12-01T23:00:00Z");
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();

        // Delete the November row; a recompute sees a narrower range.
        db.conn()
            .execute("DELETE FROM daily_stats WHERE date = '2025-11-01'", [])
            .unwrap();
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();

        let record = db.get_lifetime("v1", "c1").unwrap().unwrap();
        assert_eq!(record.stats.first_watched_at, Some(at("2025-11-01T00:00:00Z")));
        assert_eq!(record.stats.last_watched_at, Some(at("2025-12-01T00:00:00Z")));
    }

    #[test]
    fn point_in_time_fields_always_overwritten() {
        let mut db = Database::open_in_memory().unwrap();
        seed_days(
            &mut db,
            "v1",
            "c1",
            &[("2025-12-01", 600), ("2025-12-02", 600)],
        );
        let now = at("2025-12-02T23:00:00Z");
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();
        assert_eq!(
            db.get_lifetime("v1", "c1").unwrap().unwrap().stats.current_streak_days,
            2
        );

        // Ten days later the streak is dead even though totals are guarded.
        let later = at("2025-12-12T23:00:00Z");
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, later)
            .unwrap();
        let record = db.get_lifetime("v1", "c1").unwrap().unwrap();
        assert_eq!(record.stats.current_streak_days, 0);
        assert_eq!(record.stats.total_watch_time_minutes, 20);
    }

    #[test]
    fn percentile_refresh_ranks_all_updates_changed() {
        let mut db = Database::open_in_memory().unwrap();
        let now = at("2025-12-02T12:00:00Z");
        for (viewer, seconds) in [("v1", 600), ("v2", 6000), ("v3", 60_000)] {
            seed_days(&mut db, viewer, "c1", &[("2025-12-01", seconds)]);
            db.aggregate_lifetime_at(viewer, "c1", WriteMode::PreventDecreases, now)
                .unwrap();
        }

        let outcome = db
            .refresh_channel_percentiles_at("c1", Duration::hours(24), now)
            .unwrap();
        assert_eq!(
            outcome,
            RankOutcome::Updated {
                total: 3,
                refreshed: 3
            }
        );

        let p1 = db.get_lifetime("v1", "c1").unwrap().unwrap();
        let p3 = db.get_lifetime("v3", "c1").unwrap().unwrap();
        assert_eq!(p1.watch_time_percentile, Some(0.0));
        assert!((p3.watch_time_percentile.unwrap() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_refresh_skips_quiet_channels() {
        let mut db = Database::open_in_memory().unwrap();
        let now = at("2025-12-02T12:00:00Z");
        assert_eq!(
            db.refresh_channel_percentiles_at("c1", Duration::hours(24), now)
                .unwrap(),
            RankOutcome::NoRows
        );

        seed_days(&mut db, "v1", "c1", &[("2025-12-01", 600)]);
        db.aggregate_lifetime_at("v1", "c1", WriteMode::PreventDecreases, now)
            .unwrap();

        // Two days later nothing has changed inside the window.
        let later = at("2025-12-04T13:00:00Z");
        assert_eq!(
            db.refresh_channel_percentiles_at("c1", Duration::hours(24), later)
                .unwrap(),
            RankOutcome::NoRecentChanges
        );
    }

    #[test]
    fn percentile_refresh_is_deterministic() {
        let mut db = Database::open_in_memory().unwrap();
        let now = at("2025-12-02T12:00:00Z");
        for viewer in ["v1", "v2", "v3"] {
            seed_days(&mut db, viewer, "c1", &[("2025-12-01", 600)]);
            db.aggregate_lifetime_at(viewer, "c1", WriteMode::PreventDecreases, now)
                .unwrap();
        }

        db.refresh_channel_percentiles_at("c1", Duration::hours(24), now)
            .unwrap();
        let first: Vec<Option<f64>> = ["v1", "v2", "v3"]
            .iter()
            .map(|v| db.get_lifetime(v, "c1").unwrap().unwrap().watch_time_percentile)
            .collect();

        db.refresh_channel_percentiles_at("c1", Duration::hours(24), now)
            .unwrap();
        let second: Vec<Option<f64>> = ["v1", "v2", "v3"]
            .iter()
            .map(|v| db.get_lifetime(v, "c1").unwrap().unwrap().watch_time_percentile)
            .collect();

        assert_eq!(first, second);
        // Ties broke by viewer identity: v1 < v2 < v3.
        assert_eq!(first[0], Some(0.0));
        assert!((first[1].unwrap() - 100.0 / 3.0).abs() < 1e-9);
    }
}
