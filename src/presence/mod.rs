//! Presence observation
//!
//! Turns raw device presence from an external source into a clean,
//! tolerance-filtered active-device set per event.
//!
//! ```text
//!   PresenceSource ──subscribe──► WatchTask (one per event)
//!        │                            │ on attach + every delta
//!        └────────── snapshot ◄───────┤
//!                                     ▼
//!                       active_devices(now, window)
//!                                     │
//!                                     ▼
//!                              MetricsSink
//! ```

pub mod snapshot;
pub mod source;
pub mod watcher;

pub use snapshot::{ActiveDevice, PresenceDelta, PresenceRecord, PresenceSnapshot};
pub use source::{MemoryPresenceSource, PresenceSource, PresenceSubscription};
pub use watcher::PresenceWatcher;
