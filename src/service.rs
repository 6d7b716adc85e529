//! Service facade
//!
//! Wires the watcher, tracker, aggregator and reaper over one set of
//! collaborators and exposes the public operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::ids::{DeviceId, EventId};
use crate::presence::{MemoryPresenceSource, PresenceSnapshot, PresenceSource, PresenceWatcher};
use crate::provider::{
    EventStatusProvider, MemoryIdentityResolver, StaticEventStatus, ViewerIdentityResolver,
};
use crate::session::{MemorySessionStore, SessionStore, StaleSessionReaper, ViewingSessionTracker};
use crate::stats::{
    ChannelBroadcast, EventMetrics, MemoryMetricsStore, MetricsAggregator, MetricsBroadcast,
    MetricsSink, MetricsStore, MetricsUpdate, PipelineStats, PipelineStatsSnapshot,
};

/// External systems the service depends on
#[derive(Clone)]
pub struct Collaborators {
    pub presence: Arc<dyn PresenceSource>,
    pub status: Arc<dyn EventStatusProvider>,
    pub identity: Arc<dyn ViewerIdentityResolver>,
    pub sessions: Arc<dyn SessionStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub broadcast: Arc<dyn MetricsBroadcast>,
}

/// Concrete in-memory collaborators, kept typed so callers can drive them
#[derive(Clone)]
pub struct MemoryBackends {
    pub presence: Arc<MemoryPresenceSource>,
    pub status: Arc<StaticEventStatus>,
    pub identity: Arc<MemoryIdentityResolver>,
    pub sessions: Arc<MemorySessionStore>,
    pub metrics: Arc<MemoryMetricsStore>,
    pub broadcast: Arc<ChannelBroadcast>,
}

impl MemoryBackends {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            presence: Arc::new(MemoryPresenceSource::with_capacity(config.channel_capacity)),
            status: Arc::new(StaticEventStatus::new()),
            identity: Arc::new(MemoryIdentityResolver::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            metrics: Arc::new(MemoryMetricsStore::new()),
            broadcast: Arc::new(ChannelBroadcast::new(config.channel_capacity)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            presence: self.presence.clone(),
            status: self.status.clone(),
            identity: self.identity.clone(),
            sessions: self.sessions.clone(),
            metrics: self.metrics.clone(),
            broadcast: self.broadcast.clone(),
        }
    }
}

/// Result of a stale session sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cleaned: usize,
}

/// Live viewer metrics service
pub struct ViewerMetricsService {
    config: TrackerConfig,
    watcher: PresenceWatcher,
    tracker: Arc<ViewingSessionTracker>,
    aggregator: Arc<MetricsAggregator>,
    reaper: Arc<StaleSessionReaper>,
    stats: Arc<PipelineStats>,
    channel: Option<Arc<ChannelBroadcast>>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl ViewerMetricsService {
    /// Build a service over arbitrary collaborators
    pub fn new(collaborators: Collaborators, config: TrackerConfig) -> Self {
        let stats = Arc::new(PipelineStats::new());

        let aggregator = Arc::new(MetricsAggregator::new(
            Arc::clone(&collaborators.identity),
            Arc::clone(&collaborators.sessions),
            collaborators.metrics,
            collaborators.broadcast,
            Arc::clone(&stats),
            config.clone(),
        ));

        let tracker = Arc::new(ViewingSessionTracker::new(
            collaborators.status,
            collaborators.identity,
            collaborators.sessions,
            Arc::clone(&aggregator),
            Arc::clone(&stats),
            config.clone(),
        ));

        let sink: Arc<dyn MetricsSink> = tracker.clone();
        let watcher = PresenceWatcher::new(collaborators.presence, sink, config.clone());
        let reaper = Arc::new(tracker.reaper());

        Self {
            config,
            watcher,
            tracker,
            aggregator,
            reaper,
            stats,
            channel: None,
            reaper_task: Mutex::new(None),
        }
    }

    /// Build a service over fresh in-memory collaborators
    pub fn in_memory(config: TrackerConfig) -> (Self, MemoryBackends) {
        let backends = MemoryBackends::new(&config);
        let mut service = Self::new(backends.collaborators(), config);
        service.channel = Some(Arc::clone(&backends.broadcast));
        (service, backends)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start tracking an event; `false` if it was already watched
    pub async fn watch(&self, event_id: &EventId) -> bool {
        self.watcher.watch(event_id).await
    }

    /// Stop tracking an event; safe if it was never watched
    pub async fn unwatch(&self, event_id: &EventId) -> bool {
        self.watcher.unwatch(event_id).await
    }

    pub async fn is_watching(&self, event_id: &EventId) -> bool {
        self.watcher.is_watching(event_id).await
    }

    /// Process a presence snapshot directly, bypassing the subscription
    pub async fn on_presence_change(
        &self,
        event_id: &EventId,
        snapshot: &PresenceSnapshot,
        now: DateTime<Utc>,
    ) -> EventMetrics {
        let active = snapshot.active_devices(now, self.config.active_window_chrono());
        self.tracker.apply_presence(event_id, &active, now).await
    }

    /// Explicitly end a device's session
    pub async fn end_session(
        &self,
        event_id: &EventId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<EventMetrics> {
        self.tracker.end_session(event_id, device_id, now).await
    }

    /// Current metrics; creates an empty record on first call
    pub async fn get_metrics(&self, event_id: &EventId) -> EventMetrics {
        self.aggregator.get_metrics(event_id).await
    }

    /// Recount unique viewers from session history
    pub async fn recalculate(&self, event_id: &EventId) -> EventMetrics {
        self.aggregator.finalize_unique_viewers(event_id).await
    }

    pub async fn cleanup_stale_sessions(&self, cutoff: Duration) -> CleanupReport {
        self.cleanup_stale_sessions_at(Utc::now(), cutoff).await
    }

    pub async fn cleanup_stale_sessions_at(
        &self,
        now: DateTime<Utc>,
        cutoff: Duration,
    ) -> CleanupReport {
        CleanupReport {
            cleaned: self.reaper.sweep_at(now, cutoff).await,
        }
    }

    /// Stop watching, close every open session, then finalize unique viewers
    ///
    /// Waits for an in-flight presence pass so it cannot reopen sessions
    /// after the event is closed.
    pub async fn end_event(&self, event_id: &EventId, now: DateTime<Utc>) -> EventMetrics {
        self.watcher.unwatch_and_wait(event_id).await;
        let closed = self.tracker.close_event(event_id, now).await;
        let metrics = self.aggregator.finalize_unique_viewers(event_id).await;

        tracing::info!(
            event = %event_id,
            closed = closed,
            peak = metrics.peak_concurrent_viewers,
            unique = metrics.total_unique_viewers,
            "Event ended"
        );

        metrics
    }

    /// Start a fresh metrics lifecycle for an event
    pub async fn reset_metrics(&self, event_id: &EventId) -> EventMetrics {
        self.aggregator.reset(event_id).await
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Receive every published update; `None` unless built in memory
    pub fn subscribe_metrics(&self) -> Option<broadcast::Receiver<MetricsUpdate>> {
        self.channel.as_ref().map(|channel| channel.subscribe())
    }

    /// Start the periodic reaper with the configured interval and cutoff
    ///
    /// Returns `false` if it is already running.
    pub async fn start_reaper(&self) -> bool {
        let mut task = self.reaper_task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        *task = Some(
            self.reaper
                .spawn(self.config.reaper_interval, self.config.stale_session_cutoff),
        );
        tracing::info!(
            interval_secs = self.config.reaper_interval.as_secs(),
            cutoff_secs = self.config.stale_session_cutoff.as_secs(),
            "Stale session reaper started"
        );
        true
    }

    /// Stop the reaper and every watch task
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper_task.lock().await.take() {
            handle.abort();
        }
        self.watcher.shutdown().await;
        tracing::info!("Viewer metrics service stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ids::ViewerId;
    use crate::presence::{PresenceRecord, PresenceSubscription};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct Harness {
        event: EventId,
        service: ViewerMetricsService,
        backends: MemoryBackends,
    }

    impl Harness {
        async fn live() -> Self {
            let (service, backends) = ViewerMetricsService::in_memory(TrackerConfig::default());
            let event = EventId::new("e1");
            backends.status.set_live(&event, true).await;
            Self {
                event,
                service,
                backends,
            }
        }

        async fn bind(&self, device: &str, viewer: &str) {
            self.backends
                .identity
                .register(&self.event, &DeviceId::new(device), &ViewerId::new(viewer))
                .await;
        }

        fn snapshot(devices: &[&str], at: DateTime<Utc>) -> PresenceSnapshot {
            devices
                .iter()
                .map(|d| (DeviceId::new(*d), PresenceRecord::online(at)))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_heartbeats_credit_watch_time() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;

        for secs in [0, 30, 60] {
            let snap = Harness::snapshot(&["d1"], t(secs));
            h.service.on_presence_change(&h.event, &snap, t(secs)).await;
        }
        tokio_test::assert_ok!(
            h.service
                .end_session(&h.event, &DeviceId::new("d1"), t(60))
                .await
        );

        let sessions = h.backends.sessions.sessions_for_event(&h.event).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].total_watch_seconds, 60);
        assert_eq!(sessions[0].live_watch_seconds, 60);
        assert!(sessions[0].was_live_during_session);
        assert_eq!(sessions[0].ended_at, Some(t(60)));
    }

    #[tokio::test]
    async fn test_two_devices_one_viewer() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;
        h.bind("d2", "v1").await;

        let snap = Harness::snapshot(&["d1", "d2"], t(0));
        let metrics = h.service.on_presence_change(&h.event, &snap, t(0)).await;

        assert_eq!(metrics.current_concurrent_viewers, 1);
    }

    #[tokio::test]
    async fn test_empty_snapshot_zeroes_concurrency() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;
        h.bind("d2", "v2").await;

        let snap = Harness::snapshot(&["d1", "d2"], t(0));
        assert_eq!(
            h.service.on_presence_change(&h.event, &snap, t(0)).await.current_concurrent_viewers,
            2
        );

        let metrics = h
            .service
            .on_presence_change(&h.event, &PresenceSnapshot::new(), t(10))
            .await;
        assert_eq!(metrics.current_concurrent_viewers, 0);
        assert_eq!(metrics.peak_concurrent_viewers, 2);
    }

    #[tokio::test]
    async fn test_stale_presence_records_not_counted() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;
        h.bind("d2", "v2").await;

        let mut snap = Harness::snapshot(&["d1"], t(100));
        snap.insert(DeviceId::new("d2"), PresenceRecord::online(t(0)));
        snap.insert(DeviceId::new("d3"), PresenceRecord::offline(t(100)));

        let metrics = h.service.on_presence_change(&h.event, &snap, t(100)).await;
        assert_eq!(metrics.current_concurrent_viewers, 1);
    }

    #[tokio::test]
    async fn test_cleanup_reports_reaped_sessions() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;

        let snap = Harness::snapshot(&["d1"], t(0));
        h.service.on_presence_change(&h.event, &snap, t(0)).await;

        let report = h
            .service
            .cleanup_stale_sessions_at(t(3 * 3600), Duration::from_secs(7200))
            .await;
        assert_eq!(report, CleanupReport { cleaned: 1 });

        let sessions = h.backends.sessions.sessions_for_event(&h.event).await.unwrap();
        assert_eq!(sessions[0].ended_at, Some(t(0)));
        assert_eq!(h.service.stats().sessions_reaped, 1);
    }

    #[tokio::test]
    async fn test_end_event_finalizes_unique_viewers() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;
        h.bind("d2", "v1").await;
        h.bind("d3", "v2").await;

        let snap = Harness::snapshot(&["d1", "d2", "d3"], t(0));
        h.service.on_presence_change(&h.event, &snap, t(0)).await;

        let metrics = h.service.end_event(&h.event, t(30)).await;
        assert_eq!(metrics.current_concurrent_viewers, 0);
        assert_eq!(metrics.peak_concurrent_viewers, 2);
        assert_eq!(metrics.total_unique_viewers, 2);

        let sessions = h.backends.sessions.open_sessions_for_event(&h.event).await.unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_recalculate_ignores_never_live_viewers() {
        let h = Harness::live().await;
        h.backends.status.set_live(&h.event, false).await;
        h.bind("d1", "v1").await;

        let snap = Harness::snapshot(&["d1"], t(0));
        h.service.on_presence_change(&h.event, &snap, t(0)).await;

        assert_eq!(h.service.recalculate(&h.event).await.total_unique_viewers, 0);
    }

    #[tokio::test]
    async fn test_get_metrics_creates_empty_record() {
        let h = Harness::live().await;
        let metrics = h.service.get_metrics(&EventId::new("unknown")).await;

        assert_eq!(metrics.current_concurrent_viewers, 0);
        assert_eq!(metrics.peak_concurrent_viewers, 0);
        assert_eq!(metrics.total_unique_viewers, 0);
    }

    #[tokio::test]
    async fn test_reset_metrics_clears_peak() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;

        let snap = Harness::snapshot(&["d1"], t(0));
        h.service.on_presence_change(&h.event, &snap, t(0)).await;
        assert_eq!(h.service.get_metrics(&h.event).await.peak_concurrent_viewers, 1);

        let metrics = h.service.reset_metrics(&h.event).await;
        assert_eq!(metrics.peak_concurrent_viewers, 0);
    }

    #[tokio::test]
    async fn test_watch_publishes_updates() {
        let h = Harness::live().await;
        h.bind("d1", "v1").await;
        let mut updates = h.service.subscribe_metrics().unwrap();

        assert!(h.service.watch(&h.event).await);
        assert!(!h.service.watch(&h.event).await);

        h.backends
            .presence
            .set_online(&h.event, &DeviceId::new("d1"), Utc::now())
            .await;

        let update = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let update = updates.recv().await.unwrap();
                if update.current_concurrent_viewers == 1 {
                    return update;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(update.event_id, h.event);
        assert_eq!(update.peak_concurrent_viewers, 1);

        h.service.shutdown().await;
        assert!(!h.service.is_watching(&h.event).await);
    }

    #[tokio::test]
    async fn test_reaper_start_is_idempotent() {
        let h = Harness::live().await;

        assert!(h.service.start_reaper().await);
        assert!(!h.service.start_reaper().await);

        h.service.shutdown().await;
        assert!(h.service.start_reaper().await);
        h.service.shutdown().await;
    }

    /// Presence source whose snapshot reads take a while
    struct SlowSnapshots {
        inner: Arc<MemoryPresenceSource>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl PresenceSource for SlowSnapshots {
        async fn subscribe(&self, event_id: &EventId) -> Result<PresenceSubscription> {
            self.inner.subscribe(event_id).await
        }

        async fn snapshot(&self, event_id: &EventId) -> Result<PresenceSnapshot> {
            tokio::time::sleep(self.delay).await;
            self.inner.snapshot(event_id).await
        }
    }

    #[tokio::test]
    async fn test_end_event_waits_for_in_flight_pass() {
        let config = TrackerConfig::default();
        let backends = MemoryBackends::new(&config);
        let mut collaborators = backends.collaborators();
        collaborators.presence = Arc::new(SlowSnapshots {
            inner: Arc::clone(&backends.presence),
            delay: Duration::from_millis(200),
        });
        let service = ViewerMetricsService::new(collaborators, config);

        let event = EventId::new("e1");
        backends.status.set_live(&event, true).await;
        backends
            .identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;
        backends
            .presence
            .set_online(&event, &DeviceId::new("d1"), Utc::now())
            .await;

        service.watch(&event).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ended = service.end_event(&event, Utc::now()).await;
        assert_eq!(ended.current_concurrent_viewers, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(service.get_metrics(&event).await.current_concurrent_viewers, 0);
        let open = backends.sessions.open_sessions_for_event(&event).await.unwrap();
        assert!(open.is_empty());
        assert!(!service.is_watching(&event).await);
    }
}
