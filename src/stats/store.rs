//! Metrics persistence

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::ids::EventId;

use super::metrics::EventMetrics;

/// Persistence backend for event metrics records
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn load(&self, event_id: &EventId) -> Result<Option<EventMetrics>>;

    async fn save(&self, metrics: &EventMetrics) -> Result<()>;
}

/// In-memory metrics store
#[derive(Default)]
pub struct MemoryMetricsStore {
    records: RwLock<HashMap<EventId, EventMetrics>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn load(&self, event_id: &EventId) -> Result<Option<EventMetrics>> {
        Ok(self.records.read().await.get(event_id).cloned())
    }

    async fn save(&self, metrics: &EventMetrics) -> Result<()> {
        self.records
            .write()
            .await
            .insert(metrics.event_id.clone(), metrics.clone());
        Ok(())
    }
}
