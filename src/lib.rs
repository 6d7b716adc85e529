//! Live viewer metrics
//!
//! Tracks who is watching a live event in real time and publishes three
//! aggregate numbers: current concurrent viewers, peak concurrency and the
//! total count of distinct viewers present while the event was live.
//!
//! # Architecture
//!
//! ```text
//!   PresenceSource ──delta──► PresenceWatcher ──active devices──► ViewingSessionTracker
//!                                                                      │
//!                                        SessionStore ◄── sessions ────┤
//!                                                                      ▼
//!                             MetricsBroadcast ◄── EventMetrics ── MetricsAggregator
//!
//!   StaleSessionReaper ── closes abandoned sessions in SessionStore (independent)
//! ```
//!
//! All collaborators (presence, event status, identity, persistence,
//! broadcast) sit behind async traits and ship with in-memory
//! implementations. [`ViewerMetricsService`] wires them together.

pub mod config;
pub mod error;
pub mod ids;
pub mod presence;
pub mod provider;
pub mod resilience;
pub mod service;
pub mod session;
pub mod stats;

pub use config::TrackerConfig;
pub use error::{Error, Result};
pub use ids::{DeviceId, EventId, ViewerId};
pub use presence::{
    ActiveDevice, MemoryPresenceSource, PresenceDelta, PresenceRecord, PresenceSnapshot,
    PresenceSource, PresenceWatcher,
};
pub use provider::{
    EventStatusProvider, MemoryIdentityResolver, StaticEventStatus, ViewerIdentityResolver,
};
pub use service::{CleanupReport, Collaborators, MemoryBackends, ViewerMetricsService};
pub use session::{
    DeviceSession, MemorySessionStore, SessionKey, SessionStatus, SessionStore,
    StaleSessionReaper, ViewingSessionTracker,
};
pub use stats::{
    ChannelBroadcast, EventMetrics, MemoryMetricsStore, MetricsAggregator, MetricsBroadcast,
    MetricsSink, MetricsStore, MetricsUpdate, PipelineStats, PipelineStatsSnapshot,
};
