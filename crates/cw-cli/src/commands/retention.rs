//! Retention command: prune raw chat messages and stale dedup keys.

use std::io::Write;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use cw_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &Database, days: i64) -> Result<()> {
    if days <= 0 {
        bail!("Retention must be at least one day (got {days}).");
    }
    let now = Utc::now();
    let messages = db
        .prune_chat_messages_before(now - Duration::days(days))
        .context("failed to prune chat messages")?;
    // Dedup keys only matter within their TTL; anything older than a day
    // is safe to drop regardless of the message retention window.
    let dedup = db
        .prune_dedup_before(now - Duration::days(1))
        .context("failed to prune dedup keys")?;
    writeln!(
        writer,
        "Pruned {messages} chat message(s) and {dedup} dedup key(s)."
    )?;
    Ok(())
}
