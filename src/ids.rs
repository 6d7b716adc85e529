//! Identifier newtypes
//!
//! Events, viewers and devices are all identified by opaque strings supplied
//! by external systems. Wrapping them keeps the three from being mixed up.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a live event
    EventId
);

string_id!(
    /// One registration of a person to one event, independent of device
    ViewerId
);

string_id!(
    /// One connected client instance (tab or device)
    DeviceId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_conversions() {
        let event = EventId::from("keynote");
        assert_eq!(event.to_string(), "keynote");
        assert_eq!(event.as_str(), "keynote");
        assert_eq!(DeviceId::from(String::from("d1")), DeviceId::new("d1"));
    }

    #[test]
    fn test_serializes_transparently() {
        let viewer = ViewerId::new("v-42");
        assert_eq!(serde_json::to_string(&viewer).unwrap(), "\"v-42\"");
    }
}
