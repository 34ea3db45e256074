//! Long-running services built on top of `cw-db`.
//!
//! The buffer and coordinator are written against a shared
//! `Arc<Mutex<Database>>`. SQLite connections are not `Sync`, so all
//! database access funnels through the mutex; the hot path (heartbeat
//! submission) only touches in-memory state and takes the database lock
//! during flushes and channel-cache misses.

mod buffer;
mod coordinator;

pub use buffer::{
    BufferConfig, FlushReport, Heartbeat, HeartbeatBuffer, LogSink, NotificationSink,
    SubmitOutcome,
};
pub use coordinator::{AcquireOutcome, CoordinatorConfig, ListenerCoordinator};

/// Errors surfaced by the service layer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Db(#[from] cw_db::DbError),
}
