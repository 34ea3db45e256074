//! Lifetime engagement statistics for one (viewer, channel) pair.
//!
//! Everything here is a pure function over typed daily rows; persistence and
//! the monotonicity guard live in the storage layer. `now` is always injected
//! so streak and window math is testable.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

/// One `daily_stats` row as seen by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyWatchRow {
    pub date: NaiveDate,
    pub watch_seconds: i64,
}

/// One `message_daily_agg` row as seen by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDailyRow {
    pub date: NaiveDate,
    pub total_messages: i64,
    pub chat_messages: i64,
    pub subscriptions: i64,
    pub cheers: i64,
    pub gift_subs: i64,
    pub raids: i64,
    pub total_bits: i64,
}

/// Computed lifetime profile for a (viewer, channel) pair.
///
/// Cumulative fields (`total_*`) are subject to the storage layer's
/// monotonicity guard; the rest are point-in-time facts and are always
/// overwritten on persist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifetimeStats {
    pub total_watch_time_minutes: i64,
    pub total_sessions: i64,
    pub avg_session_minutes: i64,
    pub first_watched_at: Option<DateTime<Utc>>,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub total_messages: i64,
    pub total_chat_messages: i64,
    pub total_subscriptions: i64,
    pub total_cheers: i64,
    pub total_bits: i64,
    pub tracking_started_at: DateTime<Utc>,
    pub tracking_days: i64,
    pub longest_streak_days: i64,
    pub current_streak_days: i64,
    pub active_days_last_30: i64,
    pub active_days_last_90: i64,
    pub most_active_month: Option<String>,
    pub most_active_month_count: i64,
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Computes the full lifetime profile from daily watch and message rows.
///
/// Rows are keyed by day in storage, so `daily.len()` is the distinct-day
/// session count. Duplicate dates across the two inputs collapse into one
/// active date.
#[must_use]
pub fn compute_lifetime(
    daily: &[DailyWatchRow],
    messages: &[MessageDailyRow],
    now: DateTime<Utc>,
) -> LifetimeStats {
    let total_watch_seconds: i64 = daily.iter().map(|row| row.watch_seconds).sum();
    let total_watch_time_minutes = total_watch_seconds / 60;
    let total_sessions = daily.len() as i64;
    let avg_session_minutes = if total_sessions > 0 {
        total_watch_time_minutes / total_sessions
    } else {
        0
    };

    let first_watched_at = daily.iter().map(|row| row.date).min().map(start_of_day);
    let last_watched_at = daily.iter().map(|row| row.date).max().map(start_of_day);

    let total_messages: i64 = messages.iter().map(|row| row.total_messages).sum();
    let total_chat_messages: i64 = messages.iter().map(|row| row.chat_messages).sum();
    let total_subscriptions: i64 = messages.iter().map(|row| row.subscriptions).sum();
    let total_cheers: i64 = messages.iter().map(|row| row.cheers).sum();
    let total_bits: i64 = messages.iter().map(|row| row.total_bits).sum();

    let active_dates: BTreeSet<NaiveDate> = daily
        .iter()
        .map(|row| row.date)
        .chain(messages.iter().map(|row| row.date))
        .collect();
    let dates: Vec<NaiveDate> = active_dates.into_iter().collect();

    let tracking_started_at = dates.first().copied().map_or(now, start_of_day);
    let today = now.date_naive();
    let active_days_last_30 = count_recent(&dates, today, 30);
    let active_days_last_90 = count_recent(&dates, today, 90);
    let (most_active_month, most_active_month_count) =
        most_active_month(&dates).map_or((None, 0), |(month, count)| (Some(month), count));

    LifetimeStats {
        total_watch_time_minutes,
        total_sessions,
        avg_session_minutes,
        first_watched_at,
        last_watched_at,
        total_messages,
        total_chat_messages,
        total_subscriptions,
        total_cheers,
        total_bits,
        tracking_started_at,
        tracking_days: dates.len() as i64,
        longest_streak_days: longest_streak(&dates),
        current_streak_days: current_streak(&dates, today),
        active_days_last_30,
        active_days_last_90,
        most_active_month,
        most_active_month_count,
    }
}

fn count_recent(dates: &[NaiveDate], today: NaiveDate, window_days: i64) -> i64 {
    dates
        .iter()
        .filter(|date| today.signed_duration_since(**date).num_days() < window_days)
        .count() as i64
}

/// Length of the longest run of consecutive dates.
///
/// `dates` must be sorted ascending and distinct.
#[must_use]
pub fn longest_streak(dates: &[NaiveDate]) -> i64 {
    let mut longest = 0i64;
    let mut run = 0i64;
    let mut previous: Option<NaiveDate> = None;
    for &date in dates {
        run = match previous {
            Some(prev) if date.signed_duration_since(prev).num_days() == 1 => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(date);
    }
    longest
}

/// Length of the run ending at the most recent active date, or 0 if that
/// date is more than one day before `today`.
#[must_use]
pub fn current_streak(dates: &[NaiveDate], today: NaiveDate) -> i64 {
    let Some(&last) = dates.last() else {
        return 0;
    };
    if today.signed_duration_since(last).num_days() > 1 {
        return 0;
    }
    let mut run = 1i64;
    for pair in dates.windows(2).rev() {
        if pair[1].signed_duration_since(pair[0]).num_days() == 1 {
            run += 1;
        } else {
            break;
        }
    }
    run
}

/// The `YYYY-MM` bucket with the most active dates; ties break toward the
/// most recent month.
#[must_use]
pub fn most_active_month(dates: &[NaiveDate]) -> Option<(String, i64)> {
    let mut best: Option<(String, i64)> = None;
    let mut current: Option<(String, i64)> = None;
    for &date in dates {
        let month = format!("{:04}-{:02}", date.year(), date.month());
        current = match current {
            Some((ref m, count)) if *m == month => Some((month, count + 1)),
            other => {
                if let Some(finished) = other {
                    best = pick_month(best, finished);
                }
                Some((month, 1))
            }
        };
    }
    if let Some(finished) = current {
        best = pick_month(best, finished);
    }
    best
}

fn pick_month(best: Option<(String, i64)>, candidate: (String, i64)) -> Option<(String, i64)> {
    match best {
        // Candidate months arrive in ascending order, so >= prefers recency.
        Some(current) if candidate.1 >= current.1 => Some(candidate),
        None => Some(candidate),
        other => other,
    }
}
