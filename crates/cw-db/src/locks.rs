//! Database-backed listener locks.
//!
//! Each channel has at most one live listener across all instances. A lock
//! is a row in `listener_locks`; ownership is decided by a single
//! conditional upsert so two instances racing for the same channel cannot
//! both win. Liveness comes from heartbeats: a lock whose heartbeat is
//! older than the timeout is up for takeover or sweeping.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use crate::{Database, DbError, format_timestamp, parse_timestamp};

/// One row in `listener_locks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub channel_id: String,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// One row in `instances`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub label: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Database {
    /// Attempts to take the listener lock for `channel_id`.
    ///
    /// Succeeds when the lock is free, already ours, or held by an instance
    /// whose heartbeat is older than `timeout`. Returns `true` on success.
    /// Re-acquiring our own lock refreshes the heartbeat but keeps the
    /// original `acquired_at`.
    pub fn try_acquire_lock(
        &self,
        channel_id: &str,
        instance_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let cutoff = format_timestamp(now - timeout);
        let stamp = format_timestamp(now);
        let affected = self.conn().execute(
            "
            INSERT INTO listener_locks (channel_id, instance_id, acquired_at, last_heartbeat)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(channel_id) DO UPDATE SET
                instance_id = excluded.instance_id,
                acquired_at = CASE
                    WHEN listener_locks.instance_id = excluded.instance_id
                        THEN listener_locks.acquired_at
                    ELSE excluded.acquired_at
                END,
                last_heartbeat = excluded.last_heartbeat
            WHERE listener_locks.instance_id = excluded.instance_id
                OR listener_locks.last_heartbeat < ?4
            ",
            params![channel_id, instance_id, stamp, cutoff],
        )?;
        let acquired = affected == 1;
        if acquired {
            tracing::debug!(channel_id, instance_id, "acquired listener lock");
        }
        Ok(acquired)
    }

    /// Releases a lock, but only if we still own it.
    pub fn release_lock(&self, channel_id: &str, instance_id: &str) -> Result<bool, DbError> {
        let affected = self.conn().execute(
            "DELETE FROM listener_locks WHERE channel_id = ? AND instance_id = ?",
            params![channel_id, instance_id],
        )?;
        Ok(affected == 1)
    }

    /// Releases every lock held by an instance. Returns how many were held.
    pub fn release_locks_for(&self, instance_id: &str) -> Result<usize, DbError> {
        let affected = self.conn().execute(
            "DELETE FROM listener_locks WHERE instance_id = ?",
            [instance_id],
        )?;
        Ok(affected)
    }

    /// Bumps `last_heartbeat` on all locks held by an instance.
    pub fn refresh_locks_for(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let affected = self.conn().execute(
            "UPDATE listener_locks SET last_heartbeat = ? WHERE instance_id = ?",
            params![format_timestamp(now), instance_id],
        )?;
        Ok(affected)
    }

    /// Registers or refreshes this instance's liveness row.
    pub fn refresh_instance(
        &self,
        instance_id: &str,
        label: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.conn().execute(
            "
            INSERT INTO instances (id, label, last_heartbeat)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                label = excluded.label,
                last_heartbeat = excluded.last_heartbeat
            ",
            params![instance_id, label, format_timestamp(now)],
        )?;
        Ok(())
    }

    /// Deletes an instance's liveness row.
    pub fn remove_instance(&self, instance_id: &str) -> Result<(), DbError> {
        self.conn()
            .execute("DELETE FROM instances WHERE id = ?", [instance_id])?;
        Ok(())
    }

    /// Drops locks and instance rows whose heartbeat is past `timeout`.
    ///
    /// Returns `(locks_removed, instances_removed)`.
    pub fn sweep_expired(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), DbError> {
        let cutoff = format_timestamp(now - timeout);
        let locks = self.conn().execute(
            "DELETE FROM listener_locks WHERE last_heartbeat < ?",
            [&cutoff],
        )?;
        let instances = self.conn().execute(
            "DELETE FROM instances WHERE last_heartbeat < ?",
            [&cutoff],
        )?;
        if locks > 0 || instances > 0 {
            tracing::info!(locks, instances, "swept expired locks");
        }
        Ok((locks, instances))
    }

    /// Channels currently locked by an instance.
    pub fn locks_for_instance(&self, instance_id: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn().prepare(
            "SELECT channel_id FROM listener_locks WHERE instance_id = ? ORDER BY channel_id",
        )?;
        let rows = stmt.query_map([instance_id], |row| row.get::<_, String>(0))?;
        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    /// All locks, ordered by channel.
    pub fn list_locks(&self) -> Result<Vec<LockRecord>, DbError> {
        let mut stmt = self.conn().prepare(
            "
            SELECT channel_id, instance_id, acquired_at, last_heartbeat
            FROM listener_locks
            ORDER BY channel_id
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut locks = Vec::new();
        for row in rows {
            let (channel_id, instance_id, acquired_at, last_heartbeat) = row?;
            locks.push(LockRecord {
                channel_id,
                instance_id,
                acquired_at: parse_timestamp(&acquired_at, "listener_locks.acquired_at")?,
                last_heartbeat: parse_timestamp(&last_heartbeat, "listener_locks.last_heartbeat")?,
            });
        }
        Ok(locks)
    }

    /// All registered instances, ordered by id.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, DbError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, label, last_heartbeat FROM instances ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut instances = Vec::new();
        for row in rows {
            let (id, label, last_heartbeat) = row?;
            instances.push(InstanceRecord {
                id,
                label,
                last_heartbeat: parse_timestamp(&last_heartbeat, "instances.last_heartbeat")?,
            });
        }
        Ok(instances)
    }

    /// Who currently holds a channel's lock, if anyone.
    pub fn lock_owner(&self, channel_id: &str) -> Result<Option<String>, DbError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT instance_id FROM listener_locks WHERE channel_id = ?")?;
        let mut rows = stmt.query([channel_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}
