//! Presence source abstraction
//!
//! A presence source delivers change notifications for an event and serves
//! the full current snapshot on demand. The contract is push-then-pull:
//! every notification only signals that something changed, and receivers
//! re-read the snapshot. Any transport (websockets, long-poll, native
//! pub/sub) can sit behind this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::error::Result;
use crate::ids::{DeviceId, EventId};

use super::snapshot::{PresenceDelta, PresenceRecord, PresenceSnapshot};

/// Source of device presence for events
#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// Attach to change notifications for an event
    ///
    /// Dropping the returned subscription detaches it.
    async fn subscribe(&self, event_id: &EventId) -> Result<PresenceSubscription>;

    /// Current presence of every device attached to the event
    async fn snapshot(&self, event_id: &EventId) -> Result<PresenceSnapshot>;
}

/// Stream of presence deltas for one event
pub struct PresenceSubscription {
    rx: broadcast::Receiver<PresenceDelta>,
}

impl PresenceSubscription {
    pub fn new(rx: broadcast::Receiver<PresenceDelta>) -> Self {
        Self { rx }
    }

    /// Wait for the next delta
    ///
    /// Returns `None` once the source closes the channel. If the receiver
    /// fell behind, a single [`PresenceDelta::Resync`] stands in for the
    /// dropped notifications.
    pub async fn next(&mut self) -> Option<PresenceDelta> {
        match self.rx.recv().await {
            Ok(delta) => Some(delta),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped = skipped, "Presence subscription lagged");
                Some(PresenceDelta::Resync)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

struct EventPresence {
    snapshot: PresenceSnapshot,
    tx: broadcast::Sender<PresenceDelta>,
}

/// In-memory presence source
///
/// Every write pushes a delta to subscribers of the event.
pub struct MemoryPresenceSource {
    events: RwLock<HashMap<EventId, EventPresence>>,
    capacity: usize,
}

impl MemoryPresenceSource {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a source whose per-event channels hold `capacity` deltas
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a heartbeat from a device
    pub async fn set_online(&self, event_id: &EventId, device_id: &DeviceId, at: DateTime<Utc>) {
        self.put(event_id, device_id, PresenceRecord::online(at)).await;
    }

    /// Record an explicit disconnect
    pub async fn set_offline(&self, event_id: &EventId, device_id: &DeviceId, at: DateTime<Utc>) {
        self.put(event_id, device_id, PresenceRecord::offline(at)).await;
    }

    /// Store a raw record, including partially written ones
    pub async fn put(&self, event_id: &EventId, device_id: &DeviceId, record: PresenceRecord) {
        let mut events = self.events.write().await;
        let entry = Self::entry(&mut events, event_id, self.capacity);

        let delta = match entry.snapshot.insert(device_id.clone(), record) {
            Some(_) => PresenceDelta::Changed(device_id.clone()),
            None => PresenceDelta::Added(device_id.clone()),
        };
        let _ = entry.tx.send(delta);
    }

    /// Remove a device entirely
    pub async fn remove(&self, event_id: &EventId, device_id: &DeviceId) {
        let mut events = self.events.write().await;

        if let Some(entry) = events.get_mut(event_id) {
            if entry.snapshot.remove(device_id).is_some() {
                let _ = entry.tx.send(PresenceDelta::Removed(device_id.clone()));
            }
        }
    }

    /// Housekeeping: purge raw entries not refreshed within `max_age`
    ///
    /// Runs independently of any watcher. Returns the number of purged entries.
    pub async fn purge_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let mut events = self.events.write().await;
        let mut purged = 0;

        for (event_id, entry) in events.iter_mut() {
            let removed = entry.snapshot.retain_since(cutoff);
            if !removed.is_empty() {
                tracing::debug!(
                    event = %event_id,
                    purged = removed.len(),
                    "Purged stale presence entries"
                );
            }
            purged += removed.len();
            for device_id in removed {
                let _ = entry.tx.send(PresenceDelta::Removed(device_id));
            }
        }

        purged
    }

    /// Number of live subscriptions for an event
    pub async fn subscriber_count(&self, event_id: &EventId) -> usize {
        self.events
            .read()
            .await
            .get(event_id)
            .map(|e| e.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop an event and close its channel
    pub async fn close(&self, event_id: &EventId) {
        self.events.write().await.remove(event_id);
    }

    fn entry<'a>(
        events: &'a mut HashMap<EventId, EventPresence>,
        event_id: &EventId,
        capacity: usize,
    ) -> &'a mut EventPresence {
        events.entry(event_id.clone()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(capacity);
            EventPresence {
                snapshot: PresenceSnapshot::new(),
                tx,
            }
        })
    }
}

impl Default for MemoryPresenceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceSource for MemoryPresenceSource {
    async fn subscribe(&self, event_id: &EventId) -> Result<PresenceSubscription> {
        let mut events = self.events.write().await;
        let entry = Self::entry(&mut events, event_id, self.capacity);
        Ok(PresenceSubscription::new(entry.tx.subscribe()))
    }

    async fn snapshot(&self, event_id: &EventId) -> Result<PresenceSnapshot> {
        Ok(self
            .events
            .read()
            .await
            .get(event_id)
            .map(|e| e.snapshot.clone())
            .unwrap_or_default())
    }
}
