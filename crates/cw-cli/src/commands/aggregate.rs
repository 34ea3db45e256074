//! Aggregate command: recompute lifetime statistics.

use std::io::Write;

use anyhow::{Context, Result};
use cw_db::{Database, LifetimeRecord, WriteMode};

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    viewer: Option<&str>,
    channel: &str,
    allow_decreases: bool,
    json: bool,
) -> Result<()> {
    let mode = if allow_decreases {
        WriteMode::AllowDecreases
    } else {
        WriteMode::PreventDecreases
    };

    let viewers = match viewer {
        Some(viewer) => vec![viewer.to_string()],
        None => db
            .viewers_for_channel(channel)
            .context("failed to list viewers")?,
    };
    if viewers.is_empty() {
        writeln!(writer, "No viewers recorded for channel {channel}.")?;
        return Ok(());
    }

    if json {
        let mut records: Vec<LifetimeRecord> = Vec::with_capacity(viewers.len());
        for viewer in &viewers {
            db.aggregate_lifetime(viewer, channel, mode)
                .with_context(|| format!("failed to aggregate {viewer}"))?;
            if let Some(record) = db.get_lifetime(viewer, channel)? {
                records.push(record);
            }
        }
        writeln!(writer, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }

    for viewer in &viewers {
        let stats = db
            .aggregate_lifetime(viewer, channel, mode)
            .with_context(|| format!("failed to aggregate {viewer}"))?;
        writeln!(
            writer,
            "{viewer}: {} min, {} sessions, streak {}d (longest {}d)",
            stats.total_watch_time_minutes,
            stats.total_sessions,
            stats.current_streak_days,
            stats.longest_streak_days,
        )?;
    }
    writeln!(writer, "Aggregated {} viewer(s).", viewers.len())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cw_db::DailyDelta;

    fn seeded_db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        db.track_channel("c1", "chan", Utc::now()).unwrap();
        let deltas: Vec<DailyDelta> = ["v1", "v2"]
            .iter()
            .map(|viewer| DailyDelta {
                viewer_id: (*viewer).to_string(),
                channel_id: "c1".to_string(),
                date: "2025-12-01".parse().unwrap(),
                watch_seconds: 3600,
                ..DailyDelta::default()
            })
            .collect();
        db.apply_daily_deltas(&deltas).unwrap();
        db
    }

    #[test]
    fn aggregates_single_viewer() {
        let mut db = seeded_db();
        let mut out = Vec::new();
        run(&mut out, &mut db, Some("v1"), "c1", false, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("v1: 60 min"));
        assert!(text.contains("Aggregated 1 viewer(s)."));
        assert!(db.get_lifetime("v2", "c1").unwrap().is_none());
    }

    #[test]
    fn aggregates_whole_channel() {
        let mut db = seeded_db();
        let mut out = Vec::new();
        run(&mut out, &mut db, None, "c1", false, false).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Aggregated 2 viewer(s)."));
        assert!(db.get_lifetime("v2", "c1").unwrap().is_some());
    }

    #[test]
    fn json_output_includes_all_fields() {
        let mut db = seeded_db();
        let mut out = Vec::new();
        run(&mut out, &mut db, Some("v1"), "c1", false, true).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed[0]["viewer_id"], "v1");
        assert_eq!(parsed[0]["stats"]["total_watch_time_minutes"], 60);
    }

    #[test]
    fn empty_channel_reports_nothing_to_do() {
        let mut db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        run(&mut out, &mut db, None, "c9", false, false).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("No viewers recorded"));
    }
}
