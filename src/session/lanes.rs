//! Per-event serialization
//!
//! Presence passes, explicit session ends and reaper closes for the same
//! event run one at a time; different events never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::ids::EventId;

#[derive(Default)]
pub(crate) struct EventLanes {
    lanes: RwLock<HashMap<EventId, Arc<Mutex<()>>>>,
}

impl EventLanes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an event
    pub(crate) async fn acquire(&self, event_id: &EventId) -> OwnedMutexGuard<()> {
        let lane = {
            let lanes = self.lanes.read().await;
            lanes.get(event_id).cloned()
        };

        let lane = match lane {
            Some(lane) => lane,
            None => {
                let mut lanes = self.lanes.write().await;
                Arc::clone(lanes.entry(event_id.clone()).or_default())
            }
        };

        lane.lock_owned().await
    }
}
