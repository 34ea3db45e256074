//! Watch-session reconstruction from sparse chat-message timestamps.
//!
//! Chat messages are a noisy proxy for presence: a viewer who chats at 10:00
//! and 10:20 was almost certainly watching in between, and for some margin
//! before the first and after the last message. This module turns a
//! chronologically ordered sequence of message timestamps into contiguous
//! watch intervals using that segmentation heuristic.
//!
//! Two modes share one implementation:
//! - [`reconstruct_sessions`] replays a full day's timestamps at once.
//! - [`SessionAccumulator`] processes one timestamp at a time while holding
//!   only the currently open session, so memory stays constant regardless of
//!   message volume.

use chrono::{DateTime, Duration, Utc};

/// Buffer configuration for session segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Minutes a session is assumed to have started before the first message.
    pub pre_buffer_minutes: i64,
    /// Minutes a session extends past a message; a gap beyond this splits.
    pub post_buffer_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pre_buffer_minutes: 10,
            post_buffer_minutes: 30,
        }
    }
}

impl SessionConfig {
    fn pre_buffer(&self) -> Duration {
        Duration::minutes(self.pre_buffer_minutes)
    }

    fn post_buffer(&self) -> Duration {
        Duration::minutes(self.post_buffer_minutes)
    }
}

/// Known stream broadcast bounds, when available.
///
/// Sessions never start before `start` or end after `end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamBounds {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// A contiguous inferred watch interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSession {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WatchSession {
    /// Session length in whole seconds, never negative.
    #[must_use]
    pub fn duration_seconds(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenSession {
    start: DateTime<Utc>,
    last_message: DateTime<Utc>,
}

/// Streaming session builder.
///
/// Feed timestamps in chronological order via [`observe`](Self::observe);
/// each call returns a session when the incoming gap closed one. Call
/// [`finish`](Self::finish) to close the trailing session.
#[derive(Debug)]
pub struct SessionAccumulator {
    config: SessionConfig,
    bounds: StreamBounds,
    open: Option<OpenSession>,
    last_close: Option<DateTime<Utc>>,
}

impl SessionAccumulator {
    #[must_use]
    pub fn new(bounds: StreamBounds, config: SessionConfig) -> Self {
        Self {
            config,
            bounds,
            open: None,
            last_close: None,
        }
    }

    /// Processes one message timestamp.
    ///
    /// Timestamps must arrive in non-decreasing order; this is the caller's
    /// contract and is not re-checked here.
    pub fn observe(&mut self, timestamp: DateTime<Utc>) -> Option<WatchSession> {
        match self.open {
            Some(ref mut open)
                if timestamp.signed_duration_since(open.last_message)
                    <= self.config.post_buffer() =>
            {
                open.last_message = timestamp;
                None
            }
            Some(open) => {
                let closed = close_session(open, self.bounds, self.config);
                self.last_close = Some(closed.end);
                self.open = Some(self.open_session(timestamp));
                Some(closed)
            }
            None => {
                self.open = Some(self.open_session(timestamp));
                None
            }
        }
    }

    /// Opens a session at `timestamp - pre_buffer`, clamped to the stream
    /// start and to the previous session's close so intervals never
    /// overlap.
    fn open_session(&self, timestamp: DateTime<Utc>) -> OpenSession {
        let mut start = timestamp - self.config.pre_buffer();
        if let Some(stream_start) = self.bounds.start {
            if start < stream_start {
                start = stream_start;
            }
        }
        if let Some(last_close) = self.last_close {
            if start < last_close {
                start = last_close;
            }
        }
        OpenSession {
            start,
            last_message: timestamp,
        }
    }

    /// Closes and returns the trailing session, if any.
    #[must_use]
    pub fn finish(self) -> Option<WatchSession> {
        self.open
            .map(|open| close_session(open, self.bounds, self.config))
    }
}

fn close_session(open: OpenSession, bounds: StreamBounds, config: SessionConfig) -> WatchSession {
    let mut end = open.last_message + config.post_buffer();
    if let Some(stream_end) = bounds.end {
        if end > stream_end {
            end = stream_end;
        }
    }
    // A stream end before the session even opened collapses it to zero length.
    if end < open.start {
        end = open.start;
    }
    WatchSession {
        start: open.start,
        end,
    }
}

/// Reconstructs all watch sessions for a day of message timestamps.
///
/// `timestamps` must be chronologically sorted. Zero timestamps yield zero
/// sessions; callers are expected to skip persistence in that case.
#[must_use]
pub fn reconstruct_sessions(
    timestamps: &[DateTime<Utc>],
    bounds: StreamBounds,
    config: SessionConfig,
) -> Vec<WatchSession> {
    let mut sessions = Vec::new();
    let mut acc = SessionAccumulator::new(bounds, config);
    for &ts in timestamps {
        if let Some(closed) = acc.observe(ts) {
            sessions.push(closed);
        }
    }
    if let Some(last) = acc.finish() {
        sessions.push(last);
    }
    sessions
}

/// Sum of session durations in seconds.
#[must_use]
pub fn total_watch_seconds(sessions: &[WatchSession]) -> i64 {
    sessions.iter().map(WatchSession::duration_seconds).sum()
}
