//! Event metrics and pipeline statistics

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::EventId;

/// Aggregate viewer numbers for one event
///
/// `peak_concurrent_viewers` only ever ratchets up for the lifetime of the
/// record; a new lifecycle needs a new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetrics {
    pub event_id: EventId,
    pub current_concurrent_viewers: u32,
    pub peak_concurrent_viewers: u32,
    /// Only recomputed at finalize points, not continuously
    pub total_unique_viewers: u32,
    pub last_update: DateTime<Utc>,
}

impl EventMetrics {
    pub fn new(event_id: EventId, now: DateTime<Utc>) -> Self {
        Self {
            event_id,
            current_concurrent_viewers: 0,
            peak_concurrent_viewers: 0,
            total_unique_viewers: 0,
            last_update: now,
        }
    }

    /// Set current concurrency, raising the peak if exceeded
    ///
    /// Returns `true` if a new peak was reached.
    pub fn set_concurrent(&mut self, viewers: u32, now: DateTime<Utc>) -> bool {
        self.current_concurrent_viewers = viewers;
        self.last_update = now;

        if viewers > self.peak_concurrent_viewers {
            self.peak_concurrent_viewers = viewers;
            true
        } else {
            false
        }
    }

    pub fn set_unique(&mut self, viewers: u32, now: DateTime<Utc>) {
        self.total_unique_viewers = viewers;
        self.last_update = now;
    }

    /// Merge a persisted copy loaded after in-memory updates already happened
    pub(crate) fn absorb(&mut self, persisted: &EventMetrics) {
        self.peak_concurrent_viewers = self
            .peak_concurrent_viewers
            .max(persisted.peak_concurrent_viewers);
        if self.total_unique_viewers == 0 {
            self.total_unique_viewers = persisted.total_unique_viewers;
        }
    }

    /// Payload published to the broadcast channel
    pub fn update(&self) -> MetricsUpdate {
        MetricsUpdate {
            event_id: self.event_id.clone(),
            current_concurrent_viewers: self.current_concurrent_viewers,
            peak_concurrent_viewers: self.peak_concurrent_viewers,
            total_unique_viewers: self.total_unique_viewers,
        }
    }
}

/// Published metrics payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub event_id: EventId,
    pub current_concurrent_viewers: u32,
    pub peak_concurrent_viewers: u32,
    pub total_unique_viewers: u32,
}

impl MetricsUpdate {
    /// Render as JSON for wire-level broadcasters
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Publish(e.to_string()))
    }
}

/// Pipeline-wide counters
///
/// Shared by the tracker, aggregator and reaper. Dropped signals and
/// degraded collaborator calls are counted here rather than failing a pass.
#[derive(Debug, Default)]
pub struct PipelineStats {
    presence_passes: AtomicU64,
    dropped_signals: AtomicU64,
    status_failures: AtomicU64,
    persistence_failures: AtomicU64,
    publish_failures: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_reaped: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    /// Presence passes processed
    pub presence_passes: u64,
    /// Devices skipped because no viewer identity resolved
    pub dropped_signals: u64,
    /// Event status lookups that failed (treated as not live)
    pub status_failures: u64,
    /// Session or metrics writes/reads that failed after retry
    pub persistence_failures: u64,
    /// Metrics publishes that failed after retry
    pub publish_failures: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_reaped: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_pass(&self) {
        self.presence_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_signal(&self) {
        self.dropped_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_status_failure(&self) {
        self.status_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reaped(&self, count: u64) {
        self.sessions_reaped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            presence_passes: self.presence_passes.load(Ordering::Relaxed),
            dropped_signals: self.dropped_signals.load(Ordering::Relaxed),
            status_failures: self.status_failures.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
        }
    }
}
