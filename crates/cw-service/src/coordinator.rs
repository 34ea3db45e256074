//! Cross-instance listener coordination.
//!
//! Instances race for per-channel locks in the shared database; whoever
//! holds a channel's lock runs its listener. Held locks are kept alive by
//! a heartbeat loop, and locks whose heartbeat lapses are taken over or
//! swept. One instance listens to at most `max_locks` channels.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use cw_db::Database;
use tokio::sync::watch;

use crate::ServiceError;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Channels one instance may listen to at once.
    pub max_locks: usize,
    /// How often held locks and the instance row are refreshed.
    pub heartbeat_interval: StdDuration,
    /// A lock whose heartbeat is older than this is up for takeover.
    pub lock_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_locks: 10,
            heartbeat_interval: StdDuration::from_secs(30),
            lock_timeout: Duration::seconds(60),
        }
    }
}

/// Result of asking for a channel's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    AlreadyHeld,
    /// This instance is at its lock cap.
    CapacityReached,
    /// Another live instance holds the lock.
    Contended,
}

struct CoordinatorState {
    held: BTreeSet<String>,
    last_sweep: Option<DateTime<Utc>>,
}

/// Manages this instance's listener locks.
pub struct ListenerCoordinator {
    db: Arc<Mutex<Database>>,
    instance_id: String,
    label: Option<String>,
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
}

impl ListenerCoordinator {
    pub fn new(
        db: Arc<Mutex<Database>>,
        instance_id: String,
        label: Option<String>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            db,
            instance_id,
            label,
            config,
            state: Mutex::new(CoordinatorState {
                held: BTreeSet::new(),
                last_sweep: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announces this instance and reclaims any locks a previous run of the
    /// same instance id left behind.
    pub fn start(&self) -> Result<(), ServiceError> {
        self.start_at(Utc::now())
    }

    pub fn start_at(&self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let held = {
            let db = self.db();
            db.refresh_instance(&self.instance_id, self.label.as_deref(), now)?;
            db.refresh_locks_for(&self.instance_id, now)?;
            db.locks_for_instance(&self.instance_id)?
        };
        if !held.is_empty() {
            tracing::info!(count = held.len(), "reclaimed locks from previous run");
        }
        self.state().held = held.into_iter().collect();
        Ok(())
    }

    /// Tries to become the listener for `channel_id`.
    pub fn try_acquire(&self, channel_id: &str) -> Result<AcquireOutcome, ServiceError> {
        self.try_acquire_at(channel_id, Utc::now())
    }

    pub fn try_acquire_at(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, ServiceError> {
        let mut state = self.state();
        if state.held.contains(channel_id) {
            return Ok(AcquireOutcome::AlreadyHeld);
        }
        if state.held.len() >= self.config.max_locks {
            return Ok(AcquireOutcome::CapacityReached);
        }
        let acquired = self.db().try_acquire_lock(
            channel_id,
            &self.instance_id,
            self.config.lock_timeout,
            now,
        )?;
        if acquired {
            state.held.insert(channel_id.to_string());
            Ok(AcquireOutcome::Acquired)
        } else {
            Ok(AcquireOutcome::Contended)
        }
    }

    /// Gives up one channel's lock.
    pub fn release(&self, channel_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state();
        if state.held.remove(channel_id) {
            self.db().release_lock(channel_id, &self.instance_id)?;
        }
        Ok(())
    }

    /// Channels this instance currently listens to.
    pub fn held_channels(&self) -> Vec<String> {
        self.state().held.iter().cloned().collect()
    }

    /// One heartbeat: refresh liveness, then sweep stale peers at most once
    /// per lock timeout.
    pub fn heartbeat_tick(&self) -> Result<(), ServiceError> {
        self.heartbeat_tick_at(Utc::now())
    }

    pub fn heartbeat_tick_at(&self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        {
            let db = self.db();
            db.refresh_instance(&self.instance_id, self.label.as_deref(), now)?;
            db.refresh_locks_for(&self.instance_id, now)?;
        }

        let sweep_due = {
            let mut state = self.state();
            match state.last_sweep {
                Some(last) if now - last < self.config.lock_timeout => false,
                _ => {
                    state.last_sweep = Some(now);
                    true
                }
            }
        };
        if sweep_due {
            self.db().sweep_expired(self.config.lock_timeout, now)?;
        }
        Ok(())
    }

    /// Releases everything this instance holds. Best effort: a failure here
    /// only delays takeover until the lock times out.
    pub fn shutdown(&self) {
        let db = self.db();
        if let Err(error) = db.release_locks_for(&self.instance_id) {
            tracing::warn!(%error, "failed to release locks on shutdown");
        }
        if let Err(error) = db.remove_instance(&self.instance_id) {
            tracing::warn!(%error, "failed to remove instance row on shutdown");
        }
        drop(db);
        self.state().held.clear();
    }

    /// Heartbeat loop; releases all locks on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.heartbeat_interval) => {
                    if let Err(error) = self.heartbeat_tick() {
                        tracing::warn!(%error, "lock heartbeat failed");
                    }
                }
                _ = shutdown.changed() => {
                    self.shutdown();
                    return;
                }
            }
        }
    }
}
