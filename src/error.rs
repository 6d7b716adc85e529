//! Error types
//!
//! A single error enum covers every collaborator seam. Most pipeline paths
//! treat these as non-fatal: they are logged and the pass continues.

use std::time::Duration;

use thiserror::Error;

use crate::ids::{DeviceId, EventId};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for viewer metrics operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An external collaborator returned an error
    #[error("{operation} failed: {message}")]
    Collaborator {
        operation: &'static str,
        message: String,
    },

    /// A bounded call did not complete in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The presence source refused or dropped a subscription
    #[error("presence subscription failed for event {0}: {1}")]
    Subscribe(EventId, String),

    /// A persistence backend failed
    #[error("store error: {0}")]
    Store(String),

    /// Metrics could not be published
    #[error("publish failed: {0}")]
    Publish(String),

    /// No open session exists for the device
    #[error("no open session for device {device} in event {event}")]
    SessionNotFound { event: EventId, device: DeviceId },
}

impl Error {
    /// Build a collaborator error from any displayable cause
    pub fn collaborator(operation: &'static str, cause: impl std::fmt::Display) -> Self {
        Error::Collaborator {
            operation,
            message: cause.to_string(),
        }
    }

    /// Whether the error came from a timeout rather than an explicit failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::collaborator("status lookup", "connection refused");
        assert_eq!(err.to_string(), "status lookup failed: connection refused");
        assert!(!err.is_timeout());

        let err = Error::Timeout {
            operation: "identity resolve",
            after: Duration::from_secs(5),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "identity resolve timed out after 5s");
    }

    #[test]
    fn test_session_not_found_display() {
        let err = Error::SessionNotFound {
            event: EventId::new("launch"),
            device: DeviceId::new("tab-1"),
        };
        assert_eq!(
            err.to_string(),
            "no open session for device tab-1 in event launch"
        );
    }
}
