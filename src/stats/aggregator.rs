//! Viewer metrics aggregation
//!
//! Consolidates active devices into distinct viewers, keeps current and peak
//! concurrency, and finalizes total unique viewers on demand. Each event's
//! record sits behind its own mutex so recomputations for one event are
//! serialized while different events proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::TrackerConfig;
use crate::ids::{DeviceId, EventId, ViewerId};
use crate::provider::ViewerIdentityResolver;
use crate::resilience::bounded;
use crate::session::SessionStore;

use super::broadcast::MetricsBroadcast;
use super::metrics::{EventMetrics, PipelineStats};
use super::store::MetricsStore;

struct MetricsEntry {
    metrics: EventMetrics,
    /// Last active-device set applied to this record
    active_devices: Vec<DeviceId>,
    /// Whether the persisted copy has been merged in
    loaded: bool,
    /// Whether this process has changed the record since it was created
    dirty: bool,
}

/// Maintains one [`EventMetrics`] record per event
pub struct MetricsAggregator {
    identity: Arc<dyn ViewerIdentityResolver>,
    sessions: Arc<dyn SessionStore>,
    store: Arc<dyn MetricsStore>,
    broadcast: Arc<dyn MetricsBroadcast>,
    stats: Arc<PipelineStats>,
    config: TrackerConfig,
    records: RwLock<HashMap<EventId, Arc<Mutex<MetricsEntry>>>>,
}

impl MetricsAggregator {
    pub fn new(
        identity: Arc<dyn ViewerIdentityResolver>,
        sessions: Arc<dyn SessionStore>,
        store: Arc<dyn MetricsStore>,
        broadcast: Arc<dyn MetricsBroadcast>,
        stats: Arc<PipelineStats>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            identity,
            sessions,
            store,
            broadcast,
            stats,
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Recompute concurrency from an explicit active-device set
    ///
    /// An empty set is authoritative: concurrency becomes 0.
    pub async fn recompute_concurrent(
        &self,
        event_id: &EventId,
        active_device_ids: &[DeviceId],
    ) -> EventMetrics {
        let mut viewers = HashSet::new();

        for device_id in active_device_ids {
            let resolved = bounded("identity resolve", self.config.io_timeout, 0, || {
                self.identity.resolve(event_id, device_id)
            })
            .await;

            match resolved {
                Ok(Some(viewer_id)) => {
                    viewers.insert(viewer_id);
                }
                Ok(None) => {
                    self.stats.record_dropped_signal();
                    tracing::debug!(
                        event = %event_id,
                        device = %device_id,
                        "No viewer for device, skipping"
                    );
                }
                Err(e) => {
                    self.stats.record_dropped_signal();
                    tracing::warn!(
                        event = %event_id,
                        device = %device_id,
                        error = %e,
                        "Identity resolution failed during recompute, skipping device"
                    );
                }
            }
        }

        self.apply_concurrent(event_id, active_device_ids, &viewers)
            .await
    }

    /// Apply concurrency from devices already resolved to viewers
    pub(crate) async fn apply_concurrent(
        &self,
        event_id: &EventId,
        active_device_ids: &[DeviceId],
        viewers: &HashSet<ViewerId>,
    ) -> EventMetrics {
        let mut entry = self.lock_loaded(event_id).await;
        let concurrent = viewers.len() as u32;

        entry.active_devices = active_device_ids.to_vec();
        entry.dirty = true;
        if entry.metrics.set_concurrent(concurrent, Utc::now()) {
            tracing::debug!(
                event = %event_id,
                peak = concurrent,
                "New peak concurrency"
            );
        }

        let metrics = entry.metrics.clone();
        self.persist_and_publish(&metrics).await;
        metrics
    }

    /// Recompute from the last known active set minus one device
    pub async fn recompute_excluding(
        &self,
        event_id: &EventId,
        device_id: &DeviceId,
    ) -> EventMetrics {
        let remaining: Vec<DeviceId> = {
            let entry = self.lock_loaded(event_id).await;
            entry
                .active_devices
                .iter()
                .filter(|d| *d != device_id)
                .cloned()
                .collect()
        };

        self.recompute_concurrent(event_id, &remaining).await
    }

    /// Set total unique viewers from sessions that overlapped live time
    ///
    /// Viewers are counted once regardless of how many devices they used.
    /// If sessions cannot be read the previous total is kept.
    pub async fn finalize_unique_viewers(&self, event_id: &EventId) -> EventMetrics {
        let sessions = bounded(
            "session scan",
            self.config.io_timeout,
            self.config.io_retries,
            || self.sessions.sessions_for_event(event_id),
        )
        .await;

        let mut entry = self.lock_loaded(event_id).await;

        match sessions {
            Ok(sessions) => {
                let unique: HashSet<&ViewerId> = sessions
                    .iter()
                    .filter(|s| s.was_live_during_session)
                    .map(|s| &s.viewer_id)
                    .collect();

                entry.metrics.set_unique(unique.len() as u32, Utc::now());
                entry.dirty = true;
                tracing::info!(
                    event = %event_id,
                    unique_viewers = unique.len(),
                    sessions = sessions.len(),
                    "Unique viewers finalized"
                );
            }
            Err(e) => {
                self.stats.record_persistence_failure();
                tracing::warn!(
                    event = %event_id,
                    error = %e,
                    "Session scan failed, keeping previous unique viewer count"
                );
            }
        }

        let metrics = entry.metrics.clone();
        self.persist_and_publish(&metrics).await;
        metrics
    }

    /// Current metrics, creating an empty record on first call
    pub async fn get_metrics(&self, event_id: &EventId) -> EventMetrics {
        self.lock_loaded(event_id).await.metrics.clone()
    }

    /// Replace the record for a new event lifecycle
    ///
    /// This is the only way peak concurrency can go down.
    pub async fn reset(&self, event_id: &EventId) -> EventMetrics {
        let mut entry = self.lock_loaded(event_id).await;

        entry.metrics = EventMetrics::new(event_id.clone(), Utc::now());
        entry.active_devices.clear();
        entry.loaded = true;
        entry.dirty = true;
        tracing::info!(event = %event_id, "Metrics record recreated");

        let metrics = entry.metrics.clone();
        self.persist_and_publish(&metrics).await;
        metrics
    }

    /// Per-event record, created empty on first touch
    async fn entry(&self, event_id: &EventId) -> Arc<Mutex<MetricsEntry>> {
        if let Some(entry) = self.records.read().await.get(event_id) {
            return Arc::clone(entry);
        }

        let mut records = self.records.write().await;
        let entry = records.entry(event_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(MetricsEntry {
                metrics: EventMetrics::new(event_id.clone(), Utc::now()),
                active_devices: Vec::new(),
                loaded: false,
                dirty: false,
            }))
        });
        Arc::clone(entry)
    }

    /// Lock an event's record, merging the persisted copy on first access
    ///
    /// An untouched record adopts the persisted copy as-is, so concurrency
    /// stays at its last known value across restarts. A failed load leaves
    /// the in-memory record in use and is retried on the next access; once
    /// it succeeds only the higher peak is carried over.
    async fn lock_loaded(&self, event_id: &EventId) -> OwnedMutexGuard<MetricsEntry> {
        let mut entry = self.entry(event_id).await.lock_owned().await;

        if !entry.loaded {
            let loaded = bounded("metrics load", self.config.io_timeout, 0, || {
                self.store.load(event_id)
            })
            .await;

            match loaded {
                Ok(Some(persisted)) => {
                    if entry.dirty {
                        entry.metrics.absorb(&persisted);
                    } else {
                        entry.metrics = persisted;
                    }
                    entry.loaded = true;
                }
                Ok(None) => {
                    entry.loaded = true;
                    tracing::debug!(event = %event_id, "Metrics record created");
                    let metrics = entry.metrics.clone();
                    self.persist(&metrics).await;
                }
                Err(e) => {
                    self.stats.record_persistence_failure();
                    tracing::warn!(
                        event = %event_id,
                        error = %e,
                        "Metrics load failed, using in-memory record"
                    );
                }
            }
        }

        entry
    }

    async fn persist(&self, metrics: &EventMetrics) {
        let saved = bounded(
            "metrics save",
            self.config.io_timeout,
            self.config.io_retries,
            || self.store.save(metrics),
        )
        .await;

        if let Err(e) = saved {
            self.stats.record_persistence_failure();
            tracing::warn!(
                event = %metrics.event_id,
                error = %e,
                "Metrics save failed, will retry next cycle"
            );
        }
    }

    async fn persist_and_publish(&self, metrics: &EventMetrics) {
        self.persist(metrics).await;

        let update = metrics.update();
        let published = bounded(
            "metrics publish",
            self.config.io_timeout,
            self.config.io_retries,
            || self.broadcast.publish(&metrics.event_id, &update),
        )
        .await;

        if let Err(e) = published {
            self.stats.record_publish_failure();
            tracing::warn!(
                event = %metrics.event_id,
                error = %e,
                "Metrics publish failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::{Error, Result};
    use crate::provider::MemoryIdentityResolver;
    use crate::session::{DeviceSession, MemorySessionStore, SessionKey};
    use crate::stats::{ChannelBroadcast, MemoryMetricsStore, MetricsUpdate};

    struct Fixture {
        identity: Arc<MemoryIdentityResolver>,
        sessions: Arc<MemorySessionStore>,
        store: Arc<MemoryMetricsStore>,
        broadcast: Arc<ChannelBroadcast>,
        stats: Arc<PipelineStats>,
        aggregator: MetricsAggregator,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(MemoryIdentityResolver::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let store = Arc::new(MemoryMetricsStore::new());
        let broadcast = Arc::new(ChannelBroadcast::default());
        let stats = Arc::new(PipelineStats::new());
        let aggregator = MetricsAggregator::new(
            identity.clone(),
            sessions.clone(),
            store.clone(),
            broadcast.clone(),
            stats.clone(),
            TrackerConfig::default(),
        );

        Fixture {
            identity,
            sessions,
            store,
            broadcast,
            stats,
            aggregator,
        }
    }

    fn ids(devices: &[&str]) -> Vec<DeviceId> {
        devices.iter().map(|d| DeviceId::new(*d)).collect()
    }

    #[tokio::test]
    async fn test_devices_deduplicated_into_viewers() {
        let f = fixture();
        let event = EventId::new("e1");
        let v1 = ViewerId::new("v1");
        f.identity.register(&event, &DeviceId::new("d1"), &v1).await;
        f.identity.register(&event, &DeviceId::new("d2"), &v1).await;

        let metrics = f
            .aggregator
            .recompute_concurrent(&event, &ids(&["d1", "d2"]))
            .await;

        assert_eq!(metrics.current_concurrent_viewers, 1);
        assert_eq!(metrics.peak_concurrent_viewers, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_devices_skipped() {
        let f = fixture();
        let event = EventId::new("e1");
        f.identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;

        let metrics = f
            .aggregator
            .recompute_concurrent(&event, &ids(&["d1", "ghost"]))
            .await;

        assert_eq!(metrics.current_concurrent_viewers, 1);
        assert_eq!(f.stats.snapshot().dropped_signals, 1);
    }

    #[tokio::test]
    async fn test_empty_set_is_authoritative_zero() {
        let f = fixture();
        let event = EventId::new("e1");
        f.identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;
        f.sessions
            .upsert(&DeviceSession::open(
                SessionKey::new(event.clone(), ViewerId::new("v1"), DeviceId::new("d1")),
                Utc::now(),
                true,
            ))
            .await
            .unwrap();

        f.aggregator.recompute_concurrent(&event, &ids(&["d1"])).await;
        let metrics = f.aggregator.recompute_concurrent(&event, &[]).await;

        assert_eq!(metrics.current_concurrent_viewers, 0);
        assert_eq!(metrics.peak_concurrent_viewers, 1);
    }

    #[tokio::test]
    async fn test_recompute_excluding_device() {
        let f = fixture();
        let event = EventId::new("e1");
        for (d, v) in [("d1", "v1"), ("d2", "v2")] {
            f.identity
                .register(&event, &DeviceId::new(d), &ViewerId::new(v))
                .await;
        }

        f.aggregator
            .recompute_concurrent(&event, &ids(&["d1", "d2"]))
            .await;
        let metrics = f
            .aggregator
            .recompute_excluding(&event, &DeviceId::new("d1"))
            .await;

        assert_eq!(metrics.current_concurrent_viewers, 1);
        assert_eq!(metrics.peak_concurrent_viewers, 2);
    }

    #[tokio::test]
    async fn test_get_metrics_creates_and_persists_empty_record() {
        let f = fixture();
        let event = EventId::new("fresh");

        let metrics = f.aggregator.get_metrics(&event).await;

        assert_eq!(metrics.current_concurrent_viewers, 0);
        assert_eq!(f.store.load(&event).await.unwrap(), Some(metrics));
    }

    #[tokio::test]
    async fn test_persisted_peak_survives_restart() {
        let f = fixture();
        let event = EventId::new("e1");
        let mut persisted = EventMetrics::new(event.clone(), Utc::now());
        persisted.peak_concurrent_viewers = 40;
        f.store.save(&persisted).await.unwrap();

        let metrics = f.aggregator.recompute_concurrent(&event, &[]).await;

        assert_eq!(metrics.current_concurrent_viewers, 0);
        assert_eq!(metrics.peak_concurrent_viewers, 40);
    }

    #[tokio::test]
    async fn test_restart_adopts_persisted_record() {
        let f = fixture();
        let event = EventId::new("e1");
        let earlier = Utc::now() - chrono::Duration::minutes(3);
        let mut persisted = EventMetrics::new(event.clone(), earlier);
        persisted.current_concurrent_viewers = 5;
        persisted.peak_concurrent_viewers = 9;
        persisted.total_unique_viewers = 12;
        f.store.save(&persisted).await.unwrap();

        let metrics = f.aggregator.get_metrics(&event).await;

        assert_eq!(metrics, persisted);
    }

    #[tokio::test]
    async fn test_excluding_counts_unresolvable_as_dropped() {
        let f = fixture();
        let event = EventId::new("e1");
        f.identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;
        f.identity
            .register(&event, &DeviceId::new("d2"), &ViewerId::new("v2"))
            .await;
        f.aggregator
            .recompute_concurrent(&event, &ids(&["d1", "d2"]))
            .await;

        f.identity.forget(&event, &DeviceId::new("d2")).await;
        let metrics = f
            .aggregator
            .recompute_excluding(&event, &DeviceId::new("d1"))
            .await;

        assert_eq!(metrics.current_concurrent_viewers, 0);
        assert_eq!(f.stats.snapshot().dropped_signals, 1);
    }

    #[tokio::test]
    async fn test_finalize_counts_live_viewers_once() {
        let f = fixture();
        let event = EventId::new("e1");
        let now = Utc::now();

        let sessions = [
            ("v1", "d1", true),
            ("v1", "d2", true),
            ("v2", "d3", true),
            ("v3", "d4", false),
        ];
        for (viewer, device, live) in sessions {
            let key = SessionKey::new(event.clone(), ViewerId::new(viewer), DeviceId::new(device));
            f.sessions
                .upsert(&DeviceSession::open(key, now, live))
                .await
                .unwrap();
        }

        let metrics = f.aggregator.finalize_unique_viewers(&event).await;
        assert_eq!(metrics.total_unique_viewers, 2);
    }

    #[tokio::test]
    async fn test_updates_published() {
        let f = fixture();
        let mut rx = f.broadcast.subscribe();
        let event = EventId::new("e1");
        f.identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;

        f.aggregator.recompute_concurrent(&event, &ids(&["d1"])).await;

        let update: MetricsUpdate = rx.recv().await.unwrap();
        assert_eq!(update.event_id, event);
        assert_eq!(update.current_concurrent_viewers, 1);
    }

    #[tokio::test]
    async fn test_reset_recreates_record() {
        let f = fixture();
        let event = EventId::new("e1");
        f.identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;
        f.aggregator.recompute_concurrent(&event, &ids(&["d1"])).await;

        let metrics = f.aggregator.reset(&event).await;

        assert_eq!(metrics.peak_concurrent_viewers, 0);
        assert_eq!(f.aggregator.get_metrics(&event).await.peak_concurrent_viewers, 0);
    }

    struct FailingBroadcast;

    #[async_trait]
    impl MetricsBroadcast for FailingBroadcast {
        async fn publish(&self, _event_id: &EventId, _update: &MetricsUpdate) -> Result<()> {
            Err(Error::Publish("socket closed".into()))
        }
    }

    /// Fails saves while `down` is set, loads while `load_down` is set
    struct FlakyStore {
        inner: MemoryMetricsStore,
        down: AtomicBool,
        load_down: AtomicBool,
    }

    #[async_trait]
    impl MetricsStore for FlakyStore {
        async fn load(&self, event_id: &EventId) -> Result<Option<EventMetrics>> {
            if self.load_down.load(Ordering::SeqCst) {
                return Err(Error::Store("connection reset".into()));
            }
            self.inner.load(event_id).await
        }

        async fn save(&self, metrics: &EventMetrics) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::Store("disk full".into()));
            }
            self.inner.save(metrics).await
        }
    }

    #[tokio::test]
    async fn test_publish_failure_is_non_fatal() {
        let identity = Arc::new(MemoryIdentityResolver::new());
        let stats = Arc::new(PipelineStats::new());
        let aggregator = MetricsAggregator::new(
            identity.clone(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryMetricsStore::new()),
            Arc::new(FailingBroadcast),
            stats.clone(),
            TrackerConfig::default(),
        );
        let event = EventId::new("e1");
        identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;

        aggregator.recompute_concurrent(&event, &ids(&["d1"])).await;

        assert_eq!(aggregator.get_metrics(&event).await.current_concurrent_viewers, 1);
        // One failed publish per update, each after a retry
        assert_eq!(stats.snapshot().publish_failures, 1);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_in_memory_value() {
        let identity = Arc::new(MemoryIdentityResolver::new());
        let stats = Arc::new(PipelineStats::new());
        let store = Arc::new(FlakyStore {
            inner: MemoryMetricsStore::new(),
            down: AtomicBool::new(true),
            load_down: AtomicBool::new(false),
        });
        let aggregator = MetricsAggregator::new(
            identity.clone(),
            Arc::new(MemorySessionStore::new()),
            store.clone(),
            Arc::new(ChannelBroadcast::default()),
            stats.clone(),
            TrackerConfig::default(),
        );
        let event = EventId::new("e1");
        identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;

        aggregator.recompute_concurrent(&event, &ids(&["d1"])).await;
        assert_eq!(aggregator.get_metrics(&event).await.current_concurrent_viewers, 1);
        assert!(store.inner.load(&event).await.unwrap().is_none());
        assert!(stats.snapshot().persistence_failures >= 1);

        store.down.store(false, Ordering::SeqCst);
        aggregator.recompute_concurrent(&event, &ids(&["d1"])).await;
        let saved = store.inner.load(&event).await.unwrap().unwrap();
        assert_eq!(saved.current_concurrent_viewers, 1);
    }

    #[tokio::test]
    async fn test_delayed_load_keeps_newer_concurrency_and_higher_peak() {
        let identity = Arc::new(MemoryIdentityResolver::new());
        let store = Arc::new(FlakyStore {
            inner: MemoryMetricsStore::new(),
            down: AtomicBool::new(true),
            load_down: AtomicBool::new(true),
        });
        let event = EventId::new("e1");
        let mut persisted = EventMetrics::new(event.clone(), Utc::now());
        persisted.current_concurrent_viewers = 5;
        persisted.peak_concurrent_viewers = 9;
        store.inner.save(&persisted).await.unwrap();

        let aggregator = MetricsAggregator::new(
            identity.clone(),
            Arc::new(MemorySessionStore::new()),
            store.clone(),
            Arc::new(ChannelBroadcast::default()),
            Arc::new(PipelineStats::new()),
            TrackerConfig::default(),
        );
        identity
            .register(&event, &DeviceId::new("d1"), &ViewerId::new("v1"))
            .await;

        let metrics = aggregator.recompute_concurrent(&event, &ids(&["d1"])).await;
        assert_eq!(metrics.current_concurrent_viewers, 1);
        assert_eq!(metrics.peak_concurrent_viewers, 1);

        store.down.store(false, Ordering::SeqCst);
        store.load_down.store(false, Ordering::SeqCst);

        let metrics = aggregator.get_metrics(&event).await;
        assert_eq!(metrics.current_concurrent_viewers, 1);
        assert_eq!(metrics.peak_concurrent_viewers, 9);
    }
}
