//! Per-device viewing session state
//!
//! One session exists per (event, viewer, device) while the device is being
//! observed. A session is either `Active` (no end time) or `Closed`; closed
//! sessions are terminal and a returning device always gets a new session.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{DeviceId, EventId, ViewerId};

/// Identity of a session slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub event_id: EventId,
    pub viewer_id: ViewerId,
    pub device_id: DeviceId,
}

impl SessionKey {
    pub fn new(event_id: EventId, viewer_id: ViewerId, device_id: DeviceId) -> Self {
        Self {
            event_id,
            viewer_id,
            device_id,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.event_id, self.viewer_id, self.device_id)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Result of applying a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// Delta credited to the watch counters (seconds)
    Credited(u64),
    /// Delta exceeded the gap tolerance; clock reset, nothing credited
    Gap,
    /// Heartbeat older than the last one; ignored
    OutOfOrder,
    /// Session already closed; ignored
    Closed,
}

/// Viewing session of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub id: Uuid,
    pub event_id: EventId,
    pub viewer_id: ViewerId,
    pub device_id: DeviceId,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_watch_seconds: u64,
    pub live_watch_seconds: u64,
    /// Sticky: once true it is never reset
    pub was_live_during_session: bool,
}

impl DeviceSession {
    /// Open a new session first observed at `now`
    pub fn open(key: SessionKey, now: DateTime<Utc>, is_live: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: key.event_id,
            viewer_id: key.viewer_id,
            device_id: key.device_id,
            started_at: now,
            last_heartbeat: now,
            ended_at: None,
            total_watch_seconds: 0,
            live_watch_seconds: 0,
            was_live_during_session: is_live,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(
            self.event_id.clone(),
            self.viewer_id.clone(),
            self.device_id.clone(),
        )
    }

    pub fn status(&self) -> SessionStatus {
        if self.ended_at.is_some() {
            SessionStatus::Closed
        } else {
            SessionStatus::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Apply a presence observation at `now`
    ///
    /// Deltas up to `gap_tolerance` extend both counters (live time only if
    /// the event is live). Longer deltas are connectivity gaps and credit
    /// nothing. Either way the heartbeat clock moves to `now`.
    pub fn heartbeat(
        &mut self,
        now: DateTime<Utc>,
        is_live: bool,
        gap_tolerance: Duration,
    ) -> Heartbeat {
        if !self.is_active() {
            return Heartbeat::Closed;
        }

        let previous = self.last_heartbeat;
        let delta = now.signed_duration_since(previous);
        if delta < Duration::zero() {
            return Heartbeat::OutOfOrder;
        }

        self.last_heartbeat = now;

        if delta > gap_tolerance {
            return Heartbeat::Gap;
        }

        // Whole-second timestamp difference so repeated sub-second passes
        // never drift from the wall clock
        let credited = (now.timestamp() - previous.timestamp()).max(0) as u64;

        self.total_watch_seconds += credited;
        if is_live {
            self.live_watch_seconds += credited;
            self.was_live_during_session = true;
        }

        Heartbeat::Credited(credited)
    }

    /// Close the session at `at`; a no-op if already closed
    pub fn close(&mut self, at: DateTime<Utc>) -> bool {
        if self.ended_at.is_some() {
            return false;
        }
        self.ended_at = Some(at);
        true
    }

    /// Apply a final heartbeat then close at `now`
    pub fn finish(
        &mut self,
        now: DateTime<Utc>,
        is_live: bool,
        gap_tolerance: Duration,
    ) -> bool {
        self.heartbeat(now, is_live, gap_tolerance);
        self.close(now)
    }

    /// Close at the last heartbeat without crediting the idle interval
    pub fn abandon(&mut self) -> bool {
        let at = self.last_heartbeat;
        self.close(at)
    }
}
