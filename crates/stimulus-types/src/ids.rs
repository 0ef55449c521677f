//! Type-safe identifier wrappers.
//!
//! Agents carry a UUID v7 identifier. Worlds, event types, and event
//! instances are named by producers with free-form strings, so those are
//! sanitized string newtypes. Distinct types keep a world name from being
//! passed where an event id is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a sanitized string identifier.
pub const MAX_KEY_LEN: usize = 128;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

/// Generates a newtype wrapper around a sanitized, non-empty [`String`].
macro_rules! define_key {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Build the key from raw producer input.
            ///
            /// Returns `None` when nothing survives sanitization.
            pub fn parse(raw: &str) -> Option<Self> {
                let clean = sanitize(raw);
                if clean.is_empty() {
                    None
                } else {
                    Some(Self(clean))
                }
            }

            /// Return the key as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_id! {
    /// Unique identifier for an agent that perceives stimuli.
    AgentId
}

define_key! {
    /// Name of a world (dimension) that events and agents live in.
    WorldId
}

define_key! {
    /// Identifier of a stimulus event type, e.g. `block.break`.
    EventTypeId
}

define_key! {
    /// Identifier of an emitted stimulus event.
    ///
    /// Derived from the event type plus optional producer metadata, or
    /// given explicitly by the producer.
    EventId
}

impl EventId {
    /// Derive an event id from its type and optional producer metadata.
    ///
    /// Metadata is sanitized and appended after a `#` so that two producers
    /// emitting the same type in one step get distinct ids.
    pub fn derive(type_id: &EventTypeId, metadata: Option<&str>) -> Self {
        let meta = metadata.map(sanitize).filter(|m| !m.is_empty());
        let mut id = match meta {
            Some(meta) => format!("{}#{meta}", type_id.as_str()),
            None => type_id.as_str().to_owned(),
        };
        truncate_on_char_boundary(&mut id, MAX_KEY_LEN);
        Self(id)
    }
}

/// Lowercase `raw` and replace anything outside `[a-z0-9_.:/-]` with `_`.
///
/// Leading and trailing whitespace is dropped before mapping and the result
/// is capped at [`MAX_KEY_LEN`] characters.
pub fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .take(MAX_KEY_LEN)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut = cut.saturating_sub(1);
        }
        s.truncate(cut);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_display_matches_uuid() {
        let id = AgentId::new();
        assert_eq!(id.to_string(), id.into_inner().to_string());
    }

    #[test]
    fn keys_are_sanitized() {
        let world = WorldId::parse("  Minecraft:Overworld ");
        assert_eq!(world.as_ref().map(WorldId::as_str), Some("minecraft:overworld"));

        let ty = EventTypeId::parse("Block Break!");
        assert_eq!(ty.as_ref().map(EventTypeId::as_str), Some("block_break_"));
    }

    #[test]
    fn blank_key_is_rejected() {
        assert!(WorldId::parse("   ").is_none());
        assert!(EventTypeId::parse("").is_none());
    }

    #[test]
    fn derived_event_id_includes_metadata() {
        let ty = EventTypeId::parse("footstep").unwrap();
        assert_eq!(EventId::derive(&ty, None).as_str(), "footstep");
        assert_eq!(
            EventId::derive(&ty, Some("Zombie 12")).as_str(),
            "footstep#zombie_12"
        );
        assert_eq!(EventId::derive(&ty, Some("  ")).as_str(), "footstep");
    }

    #[test]
    fn derived_event_id_is_capped() {
        let long = "a".repeat(MAX_KEY_LEN);
        let ty = EventTypeId::parse(&long).unwrap();
        let id = EventId::derive(&ty, Some("producer"));
        assert_eq!(id.as_str().len(), MAX_KEY_LEN);
    }
}
