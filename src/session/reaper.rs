//! Stale session reaper
//!
//! Closes sessions that were never explicitly ended, for example when a
//! presence subscription died or the process restarted. Abandoned sessions
//! end at their last heartbeat so the dead interval is never credited.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{to_chrono, TrackerConfig};
use crate::resilience::bounded;
use crate::stats::PipelineStats;

use super::lanes::EventLanes;
use super::store::SessionStore;

/// Periodic sweeper for abandoned sessions
pub struct StaleSessionReaper {
    sessions: Arc<dyn SessionStore>,
    stats: Arc<PipelineStats>,
    lanes: Arc<EventLanes>,
    config: TrackerConfig,
}

impl StaleSessionReaper {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        stats: Arc<PipelineStats>,
        config: TrackerConfig,
    ) -> Self {
        Self::with_lanes(sessions, stats, Arc::new(EventLanes::new()), config)
    }

    pub(crate) fn with_lanes(
        sessions: Arc<dyn SessionStore>,
        stats: Arc<PipelineStats>,
        lanes: Arc<EventLanes>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            sessions,
            stats,
            lanes,
            config,
        }
    }

    /// Close open sessions idle longer than `cutoff`; returns the count cleaned
    pub async fn sweep(&self, cutoff: Duration) -> usize {
        self.sweep_at(Utc::now(), cutoff).await
    }

    /// Sweep relative to an explicit `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>, cutoff: Duration) -> usize {
        let threshold = now - to_chrono(cutoff);

        let candidates = bounded(
            "stale session scan",
            self.config.io_timeout,
            self.config.io_retries,
            || self.sessions.open_sessions_idle_since(threshold),
        )
        .await;

        let candidates = match candidates {
            Ok(candidates) => candidates,
            Err(e) => {
                self.stats.record_persistence_failure();
                tracing::warn!(error = %e, "Stale session scan failed");
                return 0;
            }
        };

        let mut cleaned = 0;

        for candidate in candidates {
            let _lane = self.lanes.acquire(&candidate.event_id).await;
            let key = candidate.key();

            // Re-read under the event lock: a presence pass may have
            // extended or closed it since the scan
            let current = bounded(
                "session lookup",
                self.config.io_timeout,
                self.config.io_retries,
                || self.sessions.open_session(&key),
            )
            .await;

            let mut session = match current {
                Ok(Some(session))
                    if session.id == candidate.id && session.last_heartbeat < threshold =>
                {
                    session
                }
                Ok(_) => continue,
                Err(e) => {
                    self.stats.record_persistence_failure();
                    tracing::warn!(session = %key, error = %e, "Stale session re-read failed");
                    continue;
                }
            };

            session.abandon();

            let saved = bounded(
                "session upsert",
                self.config.io_timeout,
                self.config.io_retries,
                || self.sessions.upsert(&session),
            )
            .await;

            match saved {
                Ok(()) => {
                    cleaned += 1;
                    tracing::debug!(
                        session = %key,
                        ended_at = %session.last_heartbeat,
                        "Stale session closed"
                    );
                }
                Err(e) => {
                    self.stats.record_persistence_failure();
                    tracing::warn!(session = %key, error = %e, "Stale session close failed");
                }
            }
        }

        if cleaned > 0 {
            self.stats.record_reaped(cleaned as u64);
            tracing::info!(
                cleaned = cleaned,
                cutoff_secs = cutoff.as_secs(),
                "Stale sessions reaped"
            );
        }

        cleaned
    }

    /// Spawn a background sweep every `interval`
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        cutoff: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let reaper = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                reaper.sweep(cutoff).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ids::{DeviceId, EventId, ViewerId};
    use crate::session::{DeviceSession, MemorySessionStore, SessionKey};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn key(event: &str, device: &str) -> SessionKey {
        SessionKey::new(EventId::new(event), ViewerId::new("v1"), DeviceId::new(device))
    }

    fn reaper(store: &Arc<MemorySessionStore>) -> (StaleSessionReaper, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let reaper =
            StaleSessionReaper::new(store.clone(), stats.clone(), TrackerConfig::default());
        (reaper, stats)
    }

    #[tokio::test]
    async fn test_three_hour_old_session_closed_at_last_heartbeat() {
        let store = Arc::new(MemorySessionStore::new());
        let now = t(20_000);
        let last = now - chrono::Duration::hours(3);

        let opened = last - chrono::Duration::seconds(60);
        let mut session = DeviceSession::open(key("e1", "d1"), opened, true);
        session.heartbeat(last, true, chrono::Duration::seconds(120));
        store.upsert(&session).await.unwrap();

        let (reaper, stats) = reaper(&store);
        let cleaned = reaper.sweep_at(now, Duration::from_secs(7200)).await;

        assert_eq!(cleaned, 1);
        let closed = store.get(session.id).await.unwrap();
        assert_eq!(closed.ended_at, Some(last));
        assert_eq!(closed.total_watch_seconds, 60);
        assert_eq!(stats.snapshot().sessions_reaped, 1);
    }

    #[tokio::test]
    async fn test_recent_and_closed_sessions_untouched() {
        let store = Arc::new(MemorySessionStore::new());
        let now = t(20_000);

        let recent =
            DeviceSession::open(key("e1", "fresh"), now - chrono::Duration::minutes(30), true);
        let mut closed =
            DeviceSession::open(key("e1", "done"), now - chrono::Duration::hours(5), true);
        closed.close(now - chrono::Duration::hours(4));
        store.upsert(&recent).await.unwrap();
        store.upsert(&closed).await.unwrap();

        let (reaper, _) = reaper(&store);
        assert_eq!(reaper.sweep_at(now, Duration::from_secs(7200)).await, 0);

        assert!(store.get(recent.id).await.unwrap().is_active());
        assert_eq!(
            store.get(closed.id).await.unwrap().ended_at,
            Some(now - chrono::Duration::hours(4))
        );
    }

    #[tokio::test]
    async fn test_sweeps_across_events() {
        let store = Arc::new(MemorySessionStore::new());
        let now = t(20_000);
        let old = now - chrono::Duration::hours(3);

        store.upsert(&DeviceSession::open(key("e1", "d1"), old, false)).await.unwrap();
        store.upsert(&DeviceSession::open(key("e2", "d1"), old, false)).await.unwrap();

        let (reaper, _) = reaper(&store);
        assert_eq!(reaper.sweep_at(now, Duration::from_secs(7200)).await, 2);
        assert_eq!(reaper.sweep_at(now, Duration::from_secs(7200)).await, 0);
    }

    #[tokio::test]
    async fn test_spawned_task_sweeps() {
        let store = Arc::new(MemorySessionStore::new());
        let opened = Utc::now() - chrono::Duration::hours(3);
        let session = DeviceSession::open(key("e1", "d1"), opened, false);
        store.upsert(&session).await.unwrap();

        let stats = Arc::new(PipelineStats::new());
        let reaper = Arc::new(StaleSessionReaper::new(
            store.clone(),
            stats,
            TrackerConfig::default(),
        ));

        let handle = reaper.spawn(Duration::from_millis(10), Duration::from_secs(7200));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(!store.get(session.id).await.unwrap().is_active());
    }
}
