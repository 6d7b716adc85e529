//! Per-device viewing sessions
//!
//! ```text
//!            first seen online            heartbeat (<= gap: credit, > gap: reset clock)
//!   (none) ─────────────────────► Active ◄──────┐
//!                                    │ └────────┘
//!                                    │ explicit end / no longer observed / reaper
//!                                    ▼
//!                                 Closed (terminal; device returns => new session)
//! ```

mod lanes;
pub mod reaper;
pub mod state;
pub mod store;
pub mod tracker;

pub use reaper::StaleSessionReaper;
pub use state::{DeviceSession, Heartbeat, SessionKey, SessionStatus};
pub use store::{MemorySessionStore, SessionStore};
pub use tracker::ViewingSessionTracker;
