//! Per-event presence subscriptions
//!
//! The watcher keeps at most one subscription task per event. Each task
//! attaches to the presence source (retrying with backoff), runs one full
//! pass over the current snapshot, then re-reads and re-filters the snapshot
//! on every pushed delta.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::TrackerConfig;
use crate::ids::EventId;
use crate::resilience::{bounded, Backoff};
use crate::stats::MetricsSink;

use super::source::PresenceSource;

struct WatchHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Subscription manager for event presence
pub struct PresenceWatcher {
    source: Arc<dyn PresenceSource>,
    sink: Arc<dyn MetricsSink>,
    config: TrackerConfig,
    /// The only global mutable state; every mutation happens under this lock
    watches: Mutex<HashMap<EventId, WatchHandle>>,
}

impl PresenceWatcher {
    pub fn new(
        source: Arc<dyn PresenceSource>,
        sink: Arc<dyn MetricsSink>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching an event
    ///
    /// Returns `false` if the event is already watched.
    pub async fn watch(&self, event_id: &EventId) -> bool {
        let mut watches = self.watches.lock().await;

        if let Some(handle) = watches.get(event_id) {
            if !handle.task.is_finished() {
                return false;
            }
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = WatchTask {
            event_id: event_id.clone(),
            source: Arc::clone(&self.source),
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
        };
        let task = tokio::spawn(task.run(shutdown_rx));

        watches.insert(event_id.clone(), WatchHandle { shutdown, task });
        tracing::info!(event = %event_id, "Watching event presence");

        true
    }

    /// Stop watching an event
    ///
    /// An in-flight pass is allowed to finish. Returns `false` if the event
    /// was not watched.
    pub async fn unwatch(&self, event_id: &EventId) -> bool {
        let handle = self.watches.lock().await.remove(event_id);

        match handle {
            Some(handle) => {
                let _ = handle.shutdown.send(());
                tracing::info!(event = %event_id, "Stopped watching event presence");
                true
            }
            None => false,
        }
    }

    /// Stop watching an event and wait for its task to exit
    ///
    /// Any pass already in flight completes before this returns, so no
    /// further presence updates reach the sink for the event afterwards.
    pub async fn unwatch_and_wait(&self, event_id: &EventId) -> bool {
        let handle = self.watches.lock().await.remove(event_id);

        let Some(handle) = handle else {
            return false;
        };

        let _ = handle.shutdown.send(());
        if let Err(e) = handle.task.await {
            tracing::warn!(event = %event_id, error = %e, "Watch task ended abnormally");
        }
        tracing::info!(event = %event_id, "Stopped watching event presence");
        true
    }

    /// Whether an event currently has a watch registration
    pub async fn is_watching(&self, event_id: &EventId) -> bool {
        self.watches.lock().await.contains_key(event_id)
    }

    /// Events with a watch registration
    pub async fn watched_events(&self) -> Vec<EventId> {
        let mut events: Vec<EventId> = self.watches.lock().await.keys().cloned().collect();
        events.sort();
        events
    }

    /// Detach every subscription and wait for the tasks to exit
    pub async fn shutdown(&self) {
        let handles: Vec<(EventId, WatchHandle)> = self.watches.lock().await.drain().collect();

        for (event_id, handle) in handles {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                tracing::warn!(event = %event_id, error = %e, "Watch task ended abnormally");
            }
        }

        tracing::info!("Presence watcher shut down");
    }
}

struct WatchTask {
    event_id: EventId,
    source: Arc<dyn PresenceSource>,
    sink: Arc<dyn MetricsSink>,
    config: TrackerConfig,
}

impl WatchTask {
    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut backoff = Backoff::new(
            self.config.attach_backoff_initial,
            self.config.attach_backoff_max,
        );

        loop {
            let attached = tokio::select! {
                _ = &mut shutdown => return,
                result = bounded("presence subscribe", self.config.io_timeout, 0, || {
                    self.source.subscribe(&self.event_id)
                }) => result,
            };

            let mut subscription = match attached {
                Ok(subscription) => {
                    backoff.reset();
                    subscription
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        event = %self.event_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Presence subscription failed, metrics frozen until attached"
                    );
                    tokio::select! {
                        _ = &mut shutdown => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            tracing::debug!(event = %self.event_id, "Presence subscription attached");
            self.process().await;

            loop {
                let delta = tokio::select! {
                    _ = &mut shutdown => return,
                    delta = subscription.next() => delta,
                };

                match delta {
                    Some(delta) => {
                        tracing::trace!(event = %self.event_id, delta = ?delta, "Presence delta");
                        self.process().await;
                    }
                    None => {
                        tracing::warn!(
                            event = %self.event_id,
                            "Presence subscription closed, reattaching"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Re-read the full snapshot and forward the active set
    async fn process(&self) {
        let snapshot = bounded(
            "presence snapshot",
            self.config.io_timeout,
            self.config.io_retries,
            || self.source.snapshot(&self.event_id),
        )
        .await;

        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    event = %self.event_id,
                    error = %e,
                    "Presence snapshot unavailable, skipping pass"
                );
                return;
            }
        };

        let now = Utc::now();
        let active = snapshot.active_devices(now, self.config.active_window_chrono());

        tracing::debug!(
            event = %self.event_id,
            devices = snapshot.len(),
            active = active.len(),
            "Presence pass"
        );

        self.sink.on_presence_change(&self.event_id, active, now).await;
    }
}
