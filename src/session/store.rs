//! Session persistence
//!
//! The tracker and reaper only talk to sessions through [`SessionStore`].
//! Every call is wrapped in a bounded timeout by the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::ids::{DeviceId, EventId};

use super::state::{DeviceSession, SessionKey};

/// Persistence backend for device sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The open session for a slot, if any
    async fn open_session(&self, key: &SessionKey) -> Result<Option<DeviceSession>>;

    /// Open sessions of one device in an event, across viewers
    async fn open_sessions_for_device(
        &self,
        event_id: &EventId,
        device_id: &DeviceId,
    ) -> Result<Vec<DeviceSession>>;

    /// Every open session of an event
    async fn open_sessions_for_event(&self, event_id: &EventId) -> Result<Vec<DeviceSession>>;

    /// Every session of an event, open or closed
    async fn sessions_for_event(&self, event_id: &EventId) -> Result<Vec<DeviceSession>>;

    /// Open sessions whose last heartbeat is before `cutoff`, across events
    async fn open_sessions_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeviceSession>>;

    /// Insert or replace a session by id
    async fn upsert(&self, session: &DeviceSession) -> Result<()>;
}

/// In-memory session store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, DeviceSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions, open and closed
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn get(&self, id: Uuid) -> Option<DeviceSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<DeviceSession>
    where
        F: Fn(&DeviceSession) -> bool,
    {
        let mut found: Vec<DeviceSession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect();

        found.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        found
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn open_session(&self, key: &SessionKey) -> Result<Option<DeviceSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.is_active() && s.key() == *key)
            .cloned())
    }

    async fn open_sessions_for_device(
        &self,
        event_id: &EventId,
        device_id: &DeviceId,
    ) -> Result<Vec<DeviceSession>> {
        Ok(self
            .filtered(|s| s.is_active() && s.event_id == *event_id && s.device_id == *device_id)
            .await)
    }

    async fn open_sessions_for_event(&self, event_id: &EventId) -> Result<Vec<DeviceSession>> {
        Ok(self
            .filtered(|s| s.is_active() && s.event_id == *event_id)
            .await)
    }

    async fn sessions_for_event(&self, event_id: &EventId) -> Result<Vec<DeviceSession>> {
        Ok(self.filtered(|s| s.event_id == *event_id).await)
    }

    async fn open_sessions_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeviceSession>> {
        Ok(self
            .filtered(|s| s.is_active() && s.last_heartbeat < cutoff)
            .await)
    }

    async fn upsert(&self, session: &DeviceSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }
}
