//! Heartbeat command: submit one heartbeat and flush immediately.
//!
//! Mostly useful for scripted backfills and smoke tests; the listener
//! service is the production ingestion path.

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use cw_core::ViewerId;
use cw_db::Database;
use cw_service::{BufferConfig, Heartbeat, HeartbeatBuffer, LogSink, SubmitOutcome};

pub fn run<W: Write>(
    writer: &mut W,
    db: Database,
    viewer: &str,
    channel: &str,
    timestamp: Option<&str>,
    seconds: i64,
) -> Result<()> {
    let viewer = ViewerId::new(viewer).context("invalid viewer id")?;
    let timestamp = match timestamp {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid timestamp '{raw}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let buffer = HeartbeatBuffer::new(
        Arc::new(Mutex::new(db)),
        Arc::new(LogSink),
        BufferConfig::default(),
    );
    let heartbeat = Heartbeat {
        viewer_id: viewer.into(),
        channel_name: channel.to_string(),
        timestamp,
        watch_seconds: seconds,
    };

    match buffer.submit(&heartbeat).context("failed to submit heartbeat")? {
        SubmitOutcome::Buffered => {}
        SubmitOutcome::Duplicate => {
            writeln!(writer, "Duplicate heartbeat ignored.")?;
            return Ok(());
        }
        SubmitOutcome::UnknownChannel => {
            bail!("Channel '{channel}' is not tracked.\n\nHint: use 'cw channels track' first.");
        }
        SubmitOutcome::Invalid => {
            bail!("Watch duration must be positive (got {seconds}).");
        }
    }

    let report = buffer.flush().context("failed to flush heartbeat")?;
    if report.pairs == 0 {
        writeln!(writer, "Heartbeat already recorded.")?;
    } else {
        writeln!(writer, "Recorded {} watch seconds.", report.watch_seconds)?;
    }
    Ok(())
}
