//! Event status and viewer identity collaborators
//!
//! This crate does not decide whether an event is live, nor does it resolve
//! viewer identity from raw credentials. Both facts are consumed through the
//! traits below.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::ids::{DeviceId, EventId, ViewerId};

/// Answers whether an event is currently live
#[async_trait]
pub trait EventStatusProvider: Send + Sync {
    /// Errors are treated by callers as "not live"
    async fn is_live(&self, event_id: &EventId) -> Result<bool>;
}

/// Maps a device to the viewer registration it belongs to
#[async_trait]
pub trait ViewerIdentityResolver: Send + Sync {
    /// `Ok(None)` means the device is unknown for this event
    async fn resolve(&self, event_id: &EventId, device_id: &DeviceId) -> Result<Option<ViewerId>>;
}

/// Settable in-memory live flags
#[derive(Default)]
pub struct StaticEventStatus {
    live: RwLock<HashSet<EventId>>,
}

impl StaticEventStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an event live or not live
    pub async fn set_live(&self, event_id: &EventId, live: bool) {
        let mut set = self.live.write().await;
        if live {
            set.insert(event_id.clone());
        } else {
            set.remove(event_id);
        }
    }
}

#[async_trait]
impl EventStatusProvider for StaticEventStatus {
    async fn is_live(&self, event_id: &EventId) -> Result<bool> {
        Ok(self.live.read().await.contains(event_id))
    }
}

/// In-memory device to viewer mapping, scoped per event
#[derive(Default)]
pub struct MemoryIdentityResolver {
    devices: RwLock<HashMap<(EventId, DeviceId), ViewerId>>,
}

impl MemoryIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a device to a viewer for one event
    pub async fn register(&self, event_id: &EventId, device_id: &DeviceId, viewer_id: &ViewerId) {
        self.devices
            .write()
            .await
            .insert((event_id.clone(), device_id.clone()), viewer_id.clone());
    }

    /// Remove a device binding
    pub async fn forget(&self, event_id: &EventId, device_id: &DeviceId) {
        self.devices
            .write()
            .await
            .remove(&(event_id.clone(), device_id.clone()));
    }
}

#[async_trait]
impl ViewerIdentityResolver for MemoryIdentityResolver {
    async fn resolve(&self, event_id: &EventId, device_id: &DeviceId) -> Result<Option<ViewerId>> {
        Ok(self
            .devices
            .read()
            .await
            .get(&(event_id.clone(), device_id.clone()))
            .cloned())
    }
}
