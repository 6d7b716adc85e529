//! Viewer metrics: records, aggregation, persistence and fan-out

pub mod aggregator;
pub mod broadcast;
pub mod metrics;
pub mod sink;
pub mod store;

pub use aggregator::MetricsAggregator;
pub use broadcast::{ChannelBroadcast, MetricsBroadcast};
pub use metrics::{EventMetrics, MetricsUpdate, PipelineStats, PipelineStatsSnapshot};
pub use sink::MetricsSink;
pub use store::{MemoryMetricsStore, MetricsStore};
