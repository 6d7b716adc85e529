//! Presence snapshot types
//!
//! A snapshot is the presence source's current view of every device attached
//! to an event. It is ephemeral: only the tolerance-filtered active set flows
//! further into the pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// Raw presence state of one device
///
/// Both fields are optional because presence sources may hold partially
/// written entries. Missing data never counts as online.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub online: Option<bool>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn online(at: DateTime<Utc>) -> Self {
        Self {
            online: Some(true),
            timestamp: Some(at),
        }
    }

    pub fn offline(at: DateTime<Utc>) -> Self {
        Self {
            online: Some(false),
            timestamp: Some(at),
        }
    }

    /// Timestamp of an explicitly-online record seen within `window` of `now`
    ///
    /// Timestamps ahead of `now` (client clock skew) count as fresh.
    pub fn active_at(&self, now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
        match (self.online, self.timestamp) {
            (Some(true), Some(ts)) if now.signed_duration_since(ts) <= window => Some(ts),
            _ => None,
        }
    }
}

/// A device that passed the tolerance filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDevice {
    pub device_id: DeviceId,
    /// Presence timestamp reported by the source
    pub last_seen: DateTime<Utc>,
}

/// Map of device id to raw presence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    entries: HashMap<DeviceId, PresenceRecord>,
}

impl PresenceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        device_id: DeviceId,
        record: PresenceRecord,
    ) -> Option<PresenceRecord> {
        self.entries.insert(device_id, record)
    }

    pub fn remove(&mut self, device_id: &DeviceId) -> Option<PresenceRecord> {
        self.entries.remove(device_id)
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&PresenceRecord> {
        self.entries.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &PresenceRecord)> {
        self.entries.iter()
    }

    /// Drop entries whose timestamp is missing or older than `cutoff`
    ///
    /// Returns the removed device ids.
    pub fn retain_since(&mut self, cutoff: DateTime<Utc>) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .entries
            .iter()
            .filter(|(_, record)| record.timestamp.map_or(true, |ts| ts < cutoff))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }

        stale
    }

    /// Devices explicitly online with a timestamp inside the window
    ///
    /// Sorted by device id so downstream processing is deterministic.
    pub fn active_devices(&self, now: DateTime<Utc>, window: Duration) -> Vec<ActiveDevice> {
        let mut active: Vec<ActiveDevice> = self
            .entries
            .iter()
            .filter_map(|(id, record)| {
                record.active_at(now, window).map(|ts| ActiveDevice {
                    device_id: id.clone(),
                    last_seen: ts,
                })
            })
            .collect();

        active.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        active
    }
}

impl FromIterator<(DeviceId, PresenceRecord)> for PresenceSnapshot {
    fn from_iter<I: IntoIterator<Item = (DeviceId, PresenceRecord)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Change notification pushed by a presence source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceDelta {
    Added(DeviceId),
    Changed(DeviceId),
    Removed(DeviceId),
    /// Notifications were lost; the receiver must re-read the snapshot
    Resync,
}

impl PresenceDelta {
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            PresenceDelta::Added(id) | PresenceDelta::Changed(id) | PresenceDelta::Removed(id) => {
                Some(id)
            }
            PresenceDelta::Resync => None,
        }
    }
}
