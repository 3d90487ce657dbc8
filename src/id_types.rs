use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Declares a strongly typed string identifier.
///
/// Each id wraps an `Arc<str>` for cheap cloning across registries, tasks
/// and event payloads. Ids serialize as plain strings on the wire.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Arc<str>);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(Arc::from(s))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(Arc::from(s))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok($name::from(s))
            }
        }
    };
}

string_id! {
    /// A strongly typed identifier for a Room.
    RoomId
}

string_id! {
    /// A strongly typed identifier for a Participant within a room.
    ParticipantId
}

string_id! {
    /// A strongly typed identifier for the external user identity behind
    /// one or more participants.
    UserId
}

string_id! {
    /// A strongly typed identifier for a media track.
    TrackId
}

impl RoomId {
    /// Generates a fresh random room id.
    pub fn generate() -> Self {
        RoomId::from(uuid::Uuid::new_v4().to_string())
    }
}
