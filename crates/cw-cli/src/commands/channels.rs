//! Channel registry commands.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::Utc;
use cw_core::ChannelId;
use cw_db::Database;

pub fn track<W: Write>(writer: &mut W, db: &Database, id: &str, name: &str) -> Result<()> {
    let id = ChannelId::new(id).context("invalid channel id")?;
    db.track_channel(id.as_str(), name, Utc::now())
        .context("failed to track channel")?;
    writeln!(writer, "Tracking channel {name} ({id})")?;
    Ok(())
}

pub fn list<W: Write>(writer: &mut W, db: &Database, json: bool) -> Result<()> {
    let channels = db.list_channels().context("failed to list channels")?;
    if json {
        let items: Vec<serde_json::Value> = channels
            .iter()
            .map(|c| serde_json::json!({ "id": c.id, "name": c.name }))
            .collect();
        writeln!(writer, "{}", serde_json::to_string_pretty(&items)?)?;
        return Ok(());
    }
    if channels.is_empty() {
        writeln!(writer, "No channels tracked.")?;
        return Ok(());
    }
    for channel in channels {
        writeln!(writer, "- {} ({})", channel.name, channel.id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_then_list() {
        let db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        track(&mut out, &db, "c1", "somechannel").unwrap();
        list(&mut out, &db, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("somechannel (c1)"));
    }

    #[test]
    fn list_empty_is_friendly() {
        let db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        list(&mut out, &db, false).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("No channels"));
    }

    #[test]
    fn list_json_output() {
        let db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        track(&mut out, &db, "c1", "somechannel").unwrap();
        out.clear();
        list(&mut out, &db, true).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed[0]["id"], "c1");
    }
}
