//! Listen command: run the listener service for a set of channels.
//!
//! Acquires per-channel locks, keeps them alive, and runs the heartbeat
//! buffer's flush loop until Ctrl-C. Channels another live instance holds
//! are skipped with a note; they become acquirable once that instance
//! stops heartbeating.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use cw_db::Database;
use cw_service::{AcquireOutcome, HeartbeatBuffer, ListenerCoordinator, LogSink};
use tokio::sync::watch;

use crate::Config;
use crate::identity;

pub fn run(config: &Config, db: Database, channels: &[String], label: Option<&str>) -> Result<()> {
    if channels.is_empty() {
        bail!("No channels given.\n\nHint: cw listen <channel-id>...");
    }
    let identity = identity::current(label)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    runtime.block_on(serve(config, db, channels, &identity))
}

async fn serve(
    config: &Config,
    db: Database,
    channels: &[String],
    identity: &identity::InstanceIdentity,
) -> Result<()> {
    let db = Arc::new(Mutex::new(db));
    let coordinator = Arc::new(ListenerCoordinator::new(
        db.clone(),
        identity.instance_id.clone(),
        Some(identity.label.clone()),
        config.coordinator_config(),
    ));
    coordinator.start().context("failed to register instance")?;

    let mut acquired = 0usize;
    for channel in channels {
        match coordinator.try_acquire(channel)? {
            AcquireOutcome::Acquired | AcquireOutcome::AlreadyHeld => {
                tracing::info!(channel, "listening");
                acquired += 1;
            }
            AcquireOutcome::Contended => {
                tracing::warn!(channel, "held by another instance; skipping");
            }
            AcquireOutcome::CapacityReached => {
                tracing::warn!(channel, "lock capacity reached; skipping");
            }
        }
    }
    if acquired == 0 {
        coordinator.shutdown();
        bail!("No channels acquired; nothing to do.");
    }

    let buffer = Arc::new(HeartbeatBuffer::new(
        db,
        Arc::new(LogSink),
        config.buffer_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let buffer_task = tokio::spawn(buffer.run(shutdown_rx.clone()));
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = buffer_task.await;
    let _ = coordinator_task.await;
    Ok(())
}
