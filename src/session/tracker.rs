//! Viewing session tracking
//!
//! Maintains one session per (event, viewer, device) from the active-device
//! sets produced by the presence watcher, then hands the resolved viewers to
//! the aggregator for concurrency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::ids::{DeviceId, EventId, ViewerId};
use crate::presence::ActiveDevice;
use crate::provider::{EventStatusProvider, ViewerIdentityResolver};
use crate::resilience::bounded;
use crate::stats::{EventMetrics, MetricsAggregator, MetricsSink, PipelineStats};

use super::lanes::EventLanes;
use super::reaper::StaleSessionReaper;
use super::state::{DeviceSession, Heartbeat, SessionKey};
use super::store::SessionStore;

/// Turns active-device sets into per-device viewing sessions
pub struct ViewingSessionTracker {
    status: Arc<dyn EventStatusProvider>,
    identity: Arc<dyn ViewerIdentityResolver>,
    sessions: Arc<dyn SessionStore>,
    aggregator: Arc<MetricsAggregator>,
    stats: Arc<PipelineStats>,
    lanes: Arc<EventLanes>,
    config: TrackerConfig,
}

impl ViewingSessionTracker {
    pub fn new(
        status: Arc<dyn EventStatusProvider>,
        identity: Arc<dyn ViewerIdentityResolver>,
        sessions: Arc<dyn SessionStore>,
        aggregator: Arc<MetricsAggregator>,
        stats: Arc<PipelineStats>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            status,
            identity,
            sessions,
            aggregator,
            stats,
            lanes: Arc::new(EventLanes::new()),
            config,
        }
    }

    /// A reaper that shares this tracker's store and per-event locking
    pub fn reaper(&self) -> StaleSessionReaper {
        StaleSessionReaper::with_lanes(
            Arc::clone(&self.sessions),
            Arc::clone(&self.stats),
            Arc::clone(&self.lanes),
            self.config.clone(),
        )
    }

    /// Process one active-device set observed at `now`
    ///
    /// Opens sessions for newly seen devices, extends open ones, closes
    /// sessions of devices that are no longer observed, then recomputes
    /// concurrency.
    pub async fn apply_presence(
        &self,
        event_id: &EventId,
        active_devices: &[ActiveDevice],
        now: DateTime<Utc>,
    ) -> EventMetrics {
        let _lane = self.lanes.acquire(event_id).await;
        self.stats.record_pass();

        let is_live = self.is_live(event_id).await;
        let gap = self.config.gap_tolerance_chrono();

        let mut resolved: HashMap<DeviceId, ViewerId> = HashMap::new();
        let mut opened = 0usize;
        let mut extended = 0usize;

        for device in active_devices {
            let Some(viewer_id) = self.resolve(event_id, &device.device_id).await else {
                continue;
            };
            resolved.insert(device.device_id.clone(), viewer_id.clone());

            let key = SessionKey::new(event_id.clone(), viewer_id, device.device_id.clone());
            let existing = bounded(
                "session lookup",
                self.config.io_timeout,
                self.config.io_retries,
                || self.sessions.open_session(&key),
            )
            .await;

            match existing {
                Ok(Some(mut session)) => {
                    if session.heartbeat(now, is_live, gap) == Heartbeat::Gap {
                        tracing::debug!(
                            session = %key,
                            last_seen = %device.last_seen,
                            "Heartbeat gap exceeded tolerance, nothing credited"
                        );
                    }
                    if self.save(&session).await {
                        extended += 1;
                    }
                }
                Ok(None) => {
                    let session = DeviceSession::open(key, now, is_live);
                    if self.save(&session).await {
                        opened += 1;
                        self.stats.record_opened();
                        tracing::debug!(
                            event = %event_id,
                            viewer = %session.viewer_id,
                            device = %session.device_id,
                            last_seen = %device.last_seen,
                            live = is_live,
                            "Session opened"
                        );
                    }
                }
                Err(e) => {
                    self.stats.record_persistence_failure();
                    tracing::warn!(
                        session = %key,
                        error = %e,
                        "Session lookup failed, skipping device this pass"
                    );
                }
            }
        }

        let closed = self
            .close_unobserved(event_id, active_devices, &resolved, now, is_live)
            .await;

        tracing::debug!(
            event = %event_id,
            live = is_live,
            active = active_devices.len(),
            opened = opened,
            extended = extended,
            closed = closed,
            "Sessions updated"
        );

        let device_ids: Vec<DeviceId> = active_devices
            .iter()
            .map(|d| d.device_id.clone())
            .collect();
        let viewers: HashSet<ViewerId> = resolved.into_values().collect();

        self.aggregator
            .apply_concurrent(event_id, &device_ids, &viewers)
            .await
    }

    /// Explicitly end the open session(s) of a device
    ///
    /// Applies the heartbeat rule once more, closes at `now`, then
    /// recomputes concurrency without the device.
    pub async fn end_session(
        &self,
        event_id: &EventId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<EventMetrics> {
        let _lane = self.lanes.acquire(event_id).await;

        let open = bounded(
            "session lookup",
            self.config.io_timeout,
            self.config.io_retries,
            || self.sessions.open_sessions_for_device(event_id, device_id),
        )
        .await?;

        if open.is_empty() {
            return Err(Error::SessionNotFound {
                event: event_id.clone(),
                device: device_id.clone(),
            });
        }

        let is_live = self.is_live(event_id).await;
        let gap = self.config.gap_tolerance_chrono();

        for mut session in open {
            session.finish(now, is_live, gap);
            if self.save(&session).await {
                self.stats.record_closed();
                tracing::info!(
                    event = %event_id,
                    viewer = %session.viewer_id,
                    device = %device_id,
                    watch_secs = session.total_watch_seconds,
                    live_secs = session.live_watch_seconds,
                    "Session ended"
                );
            }
        }

        Ok(self.aggregator.recompute_excluding(event_id, device_id).await)
    }

    /// Close every open session of an event and zero its concurrency
    ///
    /// Returns the number of sessions closed.
    pub async fn close_event(&self, event_id: &EventId, now: DateTime<Utc>) -> usize {
        let _lane = self.lanes.acquire(event_id).await;
        let is_live = self.is_live(event_id).await;

        let closed = self
            .close_unobserved(event_id, &[], &HashMap::new(), now, is_live)
            .await;

        self.aggregator
            .apply_concurrent(event_id, &[], &HashSet::new())
            .await;

        closed
    }

    /// Close open sessions whose device is no longer active, or whose device
    /// now resolves to a different viewer
    async fn close_unobserved(
        &self,
        event_id: &EventId,
        active_devices: &[ActiveDevice],
        resolved: &HashMap<DeviceId, ViewerId>,
        now: DateTime<Utc>,
        is_live: bool,
    ) -> usize {
        let open = bounded(
            "session scan",
            self.config.io_timeout,
            self.config.io_retries,
            || self.sessions.open_sessions_for_event(event_id),
        )
        .await;

        let open = match open {
            Ok(open) => open,
            Err(e) => {
                self.stats.record_persistence_failure();
                tracing::warn!(
                    event = %event_id,
                    error = %e,
                    "Open session scan failed, unobserved sessions stay open"
                );
                return 0;
            }
        };

        let active: HashSet<&DeviceId> = active_devices.iter().map(|d| &d.device_id).collect();
        let gap = self.config.gap_tolerance_chrono();
        let mut closed = 0;

        for mut session in open {
            let observed = active.contains(&session.device_id)
                && resolved
                    .get(&session.device_id)
                    .map_or(true, |viewer| *viewer == session.viewer_id);
            if observed {
                continue;
            }

            session.finish(now, is_live, gap);
            if self.save(&session).await {
                closed += 1;
                self.stats.record_closed();
                tracing::debug!(
                    event = %event_id,
                    viewer = %session.viewer_id,
                    device = %session.device_id,
                    "Session closed, device no longer observed"
                );
            }
        }

        closed
    }

    /// Event liveness; any failure counts as not live
    async fn is_live(&self, event_id: &EventId) -> bool {
        let live = bounded("status lookup", self.config.io_timeout, 0, || {
            self.status.is_live(event_id)
        })
        .await;

        match live {
            Ok(live) => live,
            Err(e) => {
                self.stats.record_status_failure();
                tracing::warn!(
                    event = %event_id,
                    error = %e,
                    "Event status lookup failed, treating as not live"
                );
                false
            }
        }
    }

    /// Viewer of a device; `None` is a dropped signal
    async fn resolve(&self, event_id: &EventId, device_id: &DeviceId) -> Option<ViewerId> {
        let viewer = bounded("identity resolve", self.config.io_timeout, 0, || {
            self.identity.resolve(event_id, device_id)
        })
        .await;

        match viewer {
            Ok(Some(viewer)) => Some(viewer),
            Ok(None) => {
                self.stats.record_dropped_signal();
                tracing::debug!(
                    event = %event_id,
                    device = %device_id,
                    "No viewer for device, skipping"
                );
                None
            }
            Err(e) => {
                self.stats.record_dropped_signal();
                tracing::warn!(
                    event = %event_id,
                    device = %device_id,
                    error = %e,
                    "Identity resolution failed, skipping device"
                );
                None
            }
        }
    }

    async fn save(&self, session: &DeviceSession) -> bool {
        let saved = bounded(
            "session upsert",
            self.config.io_timeout,
            self.config.io_retries,
            || self.sessions.upsert(session),
        )
        .await;

        match saved {
            Ok(()) => true,
            Err(e) => {
                self.stats.record_persistence_failure();
                tracing::warn!(
                    session = %session.key(),
                    error = %e,
                    "Session write failed, will retry next cycle"
                );
                false
            }
        }
    }
}

#[async_trait]
impl MetricsSink for ViewingSessionTracker {
    async fn on_presence_change(
        &self,
        event_id: &EventId,
        active_devices: Vec<ActiveDevice>,
        now: DateTime<Utc>,
    ) {
        self.apply_presence(event_id, &active_devices, now).await;
    }
}
