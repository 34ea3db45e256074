//! Reconcile command: rebuild one day's watch time from raw chat messages.
//!
//! Batch reconstruction over the stored messages replaces whatever the
//! streaming path accumulated for that day, then lifetime statistics are
//! recomputed with decreases allowed so the corrected value sticks.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use cw_core::{SessionConfig, StreamBounds, reconstruct_sessions, total_watch_seconds};
use cw_db::{Database, WriteMode};

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    viewer: &str,
    channel: &str,
    date: &str,
) -> Result<()> {
    let date: NaiveDate = date
        .parse()
        .with_context(|| format!("invalid date '{date}' (expected YYYY-MM-DD)"))?;

    let timestamps = db
        .message_timestamps_for_day(viewer, channel, date)
        .context("failed to load chat messages")?;
    if timestamps.is_empty() {
        writeln!(writer, "No chat messages for {viewer} on {date}; nothing to reconcile.")?;
        return Ok(());
    }

    let sessions = reconstruct_sessions(
        &timestamps,
        StreamBounds {
            start: None,
            end: None,
        },
        SessionConfig::default(),
    );
    let watch_seconds = total_watch_seconds(&sessions);
    db.replace_daily_watch_seconds(viewer, channel, date, watch_seconds)
        .context("failed to write reconciled watch time")?;
    db.aggregate_lifetime(viewer, channel, WriteMode::AllowDecreases)
        .context("failed to recompute lifetime stats")?;

    writeln!(
        writer,
        "Reconciled {date}: {} session(s), {watch_seconds} watch seconds.",
        sessions.len(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use cw_db::{ChatMessageRecord, DailyDelta};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn replaces_streaming_estimate() {
        let mut db = Database::open_in_memory().unwrap();
        // Streaming path overcounted this day.
        db.apply_daily_deltas(&[DailyDelta {
            viewer_id: "v1".to_string(),
            channel_id: "c1".to_string(),
            date: "2025-12-01".parse().unwrap(),
            watch_seconds: 99_999,
            ..DailyDelta::default()
        }])
        .unwrap();
        // Two messages 5 minutes apart: one session with both buffers.
        db.record_chat_messages(&[
            ChatMessageRecord {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                timestamp: at("2025-12-01T10:00:00Z"),
            },
            ChatMessageRecord {
                viewer_id: "v1".to_string(),
                channel_id: "c1".to_string(),
                timestamp: at("2025-12-01T10:05:00Z"),
            },
        ])
        .unwrap();

        let mut out = Vec::new();
        run(&mut out, &mut db, "v1", "c1", "2025-12-01").unwrap();

        let stat = db
            .get_daily_stat("v1", "c1", "2025-12-01".parse().unwrap())
            .unwrap()
            .unwrap();
        // 10 min pre-buffer + 5 min gap + 30 min post-buffer.
        assert_eq!(stat.watch_seconds, 45 * 60);
        let lifetime = db.get_lifetime("v1", "c1").unwrap().unwrap();
        assert_eq!(lifetime.stats.total_watch_time_minutes, 45);
    }

    #[test]
    fn day_without_messages_is_a_no_op() {
        let mut db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        run(&mut out, &mut db, "v1", "c1", "2025-12-01").unwrap();
        assert!(String::from_utf8(out).unwrap().contains("nothing to reconcile"));
        assert!(
            db.get_daily_stat("v1", "c1", "2025-12-01".parse().unwrap())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn rejects_malformed_date() {
        let mut db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        let err = run(&mut out, &mut db, "v1", "c1", "12/01/2025").unwrap_err();
        assert!(err.to_string().contains("invalid date"));
    }
}
