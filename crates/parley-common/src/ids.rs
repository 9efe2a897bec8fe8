//! Opaque identifiers.
//!
//! Participant ids are handed to us by the authentication layer; server and
//! channel ids by the membership layer. We never parse them, we only compare
//! and route on them.

use serde::{Deserialize, Serialize};
use std::fmt;

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

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id! {
    /// A connected, authenticated principal. The addressing key for every
    /// signaling message.
    ParticipantId
}

string_id! {
    /// A community server (guild) that owns voice channels.
    ServerId
}

string_id! {
    ChannelId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ParticipantId::new("alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alice\"");

        let back: ParticipantId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_order_lexicographically() {
        assert!(ParticipantId::from("a") < ParticipantId::from("b"));
        assert_eq!(ChannelId::from("voice-1").to_string(), "voice-1");
    }
}
