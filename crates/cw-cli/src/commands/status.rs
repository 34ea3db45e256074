//! Status command: database row counts and current listener locks.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use cw_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path) -> Result<()> {
    let counts = db.status_counts().context("failed to read row counts")?;

    writeln!(writer, "chatwatch status")?;
    writeln!(writer, "Database: {}", database_path.display())?;
    writeln!(writer, "Channels: {}", counts.channels)?;
    writeln!(writer, "Chat messages: {}", counts.chat_messages)?;
    writeln!(writer, "Daily stat rows: {}", counts.daily_rows)?;
    writeln!(writer, "Message agg rows: {}", counts.message_rows)?;
    writeln!(writer, "Lifetime rows: {}", counts.lifetime_rows)?;

    let instances = db.list_instances().context("failed to list instances")?;
    writeln!(writer, "Instances: {}", instances.len())?;
    for instance in &instances {
        writeln!(
            writer,
            "- {} ({})",
            instance.id,
            instance.label.as_deref().unwrap_or("unlabeled"),
        )?;
    }

    let locks = db.list_locks().context("failed to list locks")?;
    if locks.is_empty() {
        writeln!(writer, "No active listener locks.")?;
        return Ok(());
    }
    writeln!(writer, "Locks:")?;
    for lock in locks {
        writeln!(
            writer,
            "- {} held by {} (heartbeat {})",
            lock.channel_id,
            lock.instance_id,
            lock.last_heartbeat.to_rfc3339_opts(SecondsFormat::Secs, true),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn shows_counts_and_locks() {
        let db = Database::open_in_memory().unwrap();
        db.track_channel("c1", "chan", Utc::now()).unwrap();
        db.refresh_instance("i1", Some("listener-1"), Utc::now())
            .unwrap();
        db.try_acquire_lock("c1", "i1", Duration::seconds(60), Utc::now())
            .unwrap();

        let mut out = Vec::new();
        run(&mut out, &db, Path::new("/tmp/cw.db")).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Channels: 1"));
        assert!(text.contains("i1 (listener-1)"));
        assert!(text.contains("c1 held by i1"));
    }

    #[test]
    fn empty_database_has_no_locks_line() {
        let db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        run(&mut out, &db, Path::new("/tmp/cw.db")).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("No active listener locks."));
    }
}
