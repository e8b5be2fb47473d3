//! Participant identity
//!
//! Chat participants are identified by the opaque string ids the hosting chat
//! system assigns. Signaling only ever compares them for equality and orders
//! them when deriving call ids.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identifier of one chat participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a participant id from the chat system's identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id carries no characters once trimmed
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Return both ids in a stable order, independent of who called whom
    pub fn sorted_pair<'a>(a: &'a Self, b: &'a Self) -> (&'a Self, &'a Self) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<str> for ParticipantId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_pair_is_order_independent() {
        let alice = ParticipantId::new("alice");
        let bob = ParticipantId::new("bob");
        assert_eq!(
            ParticipantId::sorted_pair(&alice, &bob),
            ParticipantId::sorted_pair(&bob, &alice)
        );
        assert_eq!(ParticipantId::sorted_pair(&bob, &alice).0, &alice);
    }

    #[test]
    fn test_blank_ids() {
        assert!(ParticipantId::new("  ").is_blank());
        assert!(!ParticipantId::new("u-42").is_blank());
    }

    #[test]
    fn test_participant_id_serializes_as_plain_string() {
        let id = ParticipantId::new("user-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"user-7\"");
        let back: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
