//! Ranks command: refresh percentile ranks for a channel.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::Duration;
use cw_db::{Database, RankOutcome};

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    channel: &str,
    window_hours: i64,
) -> Result<()> {
    let outcome = db
        .refresh_channel_percentiles(channel, Duration::hours(window_hours))
        .context("failed to refresh percentiles")?;
    match outcome {
        RankOutcome::NoRows => {
            writeln!(writer, "No lifetime rows for channel {channel}.")?;
        }
        RankOutcome::NoRecentChanges => {
            writeln!(writer, "No changes in the last {window_hours}h; ranks left as-is.")?;
        }
        RankOutcome::Updated { total, refreshed } => {
            writeln!(writer, "Refreshed {refreshed} of {total} viewer ranks.")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_db::{DailyDelta, WriteMode};

    #[test]
    fn reports_refresh_counts() {
        let mut db = Database::open_in_memory().unwrap();
        for (viewer, seconds) in [("v1", 600), ("v2", 6000)] {
            db.apply_daily_deltas(&[DailyDelta {
                viewer_id: viewer.to_string(),
                channel_id: "c1".to_string(),
                date: "2025-12-01".parse().unwrap(),
                watch_seconds: seconds,
                ..DailyDelta::default()
            }])
            .unwrap();
            db.aggregate_lifetime(viewer, "c1", WriteMode::PreventDecreases)
                .unwrap();
        }

        let mut out = Vec::new();
        run(&mut out, &mut db, "c1", 24).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Refreshed 2 of 2"));
    }

    #[test]
    fn reports_empty_channel() {
        let mut db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        run(&mut out, &mut db, "c1", 24).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("No lifetime rows"));
    }
}
