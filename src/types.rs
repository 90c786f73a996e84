//! Core identifier and call classification types.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Identity of a user on the realtime platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Correlates all signaling messages belonging to one call attempt
/// between two parties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a room id for a call attempt between two users.
    ///
    /// The sorted pair keeps the prefix stable regardless of which side
    /// derives it; the creation timestamp and a random suffix make each
    /// attempt globally unique.
    pub fn derive(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a.as_str() <= b.as_str() {
            (a, b)
        } else {
            (b, a)
        };
        let ts = Utc::now().timestamp_millis();
        let salt: u16 = rand::random();
        Self(format!("{lo}_{hi}_{ts}{salt:04x}"))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a call carries video in addition to audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voice => f.write_str("voice"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Local media track kinds that can be toggled without renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Counterparty identity snapshot taken at call-start time. Not
/// live-updated while the call is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl PeerProfile {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_prefix_is_order_independent() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let from_alice = RoomId::derive(&alice, &bob);
        let from_bob = RoomId::derive(&bob, &alice);

        assert!(from_alice.as_str().starts_with("alice_bob_"));
        assert!(from_bob.as_str().starts_with("alice_bob_"));
    }

    #[test]
    fn test_room_id_unique_per_attempt() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let first = RoomId::derive(&alice, &bob);
        let second = RoomId::derive(&alice, &bob);
        assert_ne!(first, second);
    }

    #[test]
    fn test_call_type_serde_lowercase() {
        assert_eq!(serde_json::to_string(&CallType::Voice).unwrap(), "\"voice\"");
        assert_eq!(serde_json::to_string(&CallType::Video).unwrap(), "\"video\"");
    }

    #[test]
    fn test_peer_profile_builder() {
        let peer = PeerProfile::new("u1", "Alice").with_avatar("https://cdn/a.png");
        assert_eq!(peer.user_id.as_str(), "u1");
        assert_eq!(peer.avatar.as_deref(), Some("https://cdn/a.png"));
    }
}
