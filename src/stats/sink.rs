//! Narrow interface between the presence watcher and the metrics pipeline

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ids::EventId;
use crate::presence::ActiveDevice;

/// Receives tolerance-filtered active-device sets
///
/// Injected into the watcher at construction; implementors own all
/// downstream session and metrics handling. Failures are handled inside the
/// sink and never propagate back into the watcher.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn on_presence_change(
        &self,
        event_id: &EventId,
        active_devices: Vec<ActiveDevice>,
        now: DateTime<Utc>,
    );
}
