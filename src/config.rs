//! Tracker configuration

use std::time::Duration;

/// Default presence tolerance window (roughly 2x the client heartbeat interval)
pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(30);

/// Default maximum heartbeat delta credited as watch time
pub const DEFAULT_GAP_TOLERANCE: Duration = Duration::from_secs(120);

/// Default age after which an open session is considered abandoned
pub const DEFAULT_STALE_SESSION_CUTOFF: Duration = Duration::from_secs(7200);

/// Configuration shared by the watcher, tracker, aggregator and reaper
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// A device is active only if its presence timestamp is within this window
    pub active_window: Duration,

    /// Heartbeat deltas above this are treated as connectivity gaps
    pub gap_tolerance: Duration,

    /// Default cutoff used by the stale session reaper
    pub stale_session_cutoff: Duration,

    /// How often the background reaper sweeps
    pub reaper_interval: Duration,

    /// Timeout applied to every collaborator call attempt
    pub io_timeout: Duration,

    /// Retries after a failed persistence or publish attempt
    pub io_retries: u32,

    /// First delay before retrying a failed presence subscription
    pub attach_backoff_initial: Duration,

    /// Upper bound for the subscription retry delay
    pub attach_backoff_max: Duration,

    /// Capacity of broadcast channels created by in-memory collaborators
    pub channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            active_window: DEFAULT_ACTIVE_WINDOW,
            gap_tolerance: DEFAULT_GAP_TOLERANCE,
            stale_session_cutoff: DEFAULT_STALE_SESSION_CUTOFF,
            reaper_interval: Duration::from_secs(300),
            io_timeout: Duration::from_secs(5),
            io_retries: 1,
            attach_backoff_initial: Duration::from_millis(500),
            attach_backoff_max: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

impl TrackerConfig {
    /// Set the presence tolerance window
    pub fn active_window(mut self, window: Duration) -> Self {
        self.active_window = window;
        self
    }

    /// Set the heartbeat gap tolerance
    pub fn gap_tolerance(mut self, tolerance: Duration) -> Self {
        self.gap_tolerance = tolerance;
        self
    }

    /// Set the default stale session cutoff
    pub fn stale_session_cutoff(mut self, cutoff: Duration) -> Self {
        self.stale_session_cutoff = cutoff;
        self
    }

    /// Set the background reaper period
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the per-attempt collaborator timeout
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the number of retries for persistence and publish
    pub fn io_retries(mut self, retries: u32) -> Self {
        self.io_retries = retries;
        self
    }

    /// Set the subscription retry backoff bounds
    pub fn attach_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.attach_backoff_initial = initial;
        self.attach_backoff_max = max.max(initial);
        self
    }

    /// Set the broadcast channel capacity
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub(crate) fn active_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.active_window)
    }

    pub(crate) fn gap_tolerance_chrono(&self) -> chrono::Duration {
        to_chrono(self.gap_tolerance)
    }
}

/// Convert a std duration, saturating instead of failing on overflow
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
