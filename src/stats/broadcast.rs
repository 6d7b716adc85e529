//! Metrics fan-out
//!
//! Publishing is best-effort: metrics stay retrievable by pull even when a
//! publish fails.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::ids::EventId;

use super::metrics::MetricsUpdate;

/// Pushes metrics updates to interested clients
#[async_trait]
pub trait MetricsBroadcast: Send + Sync {
    async fn publish(&self, event_id: &EventId, update: &MetricsUpdate) -> Result<()>;
}

/// Broadcast-channel publisher
///
/// Subscribers receive every update for every event; having no subscribers
/// is not an error.
pub struct ChannelBroadcast {
    tx: broadcast::Sender<MetricsUpdate>,
}

impl ChannelBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsUpdate> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcast {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MetricsBroadcast for ChannelBroadcast {
    async fn publish(&self, event_id: &EventId, update: &MetricsUpdate) -> Result<()> {
        let receivers = self.tx.send(update.clone()).unwrap_or(0);
        tracing::trace!(event = %event_id, receivers = receivers, "Metrics published");
        Ok(())
    }
}
