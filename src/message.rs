//! Signaling message types exchanged over the pub/sub inbox.
//!
//! Four message kinds carry the whole call-control protocol: offer,
//! answer, ICE candidate, and state-event. Messages are ephemeral JSON
//! payloads delivered at-least-once by the broker; they are never
//! persisted, and receivers validate every message against the active
//! room before acting on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::CallError;
use crate::types::{CallType, RoomId, UserId};

/// Which side of the negotiation a session description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// The negotiated media-capability description exchanged between two
/// peer-connection endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network path proposed for establishing the peer-to-peer
/// media connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}

/// Initial call offer delivered to the receiver's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOffer {
    pub caller_id: UserId,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_avatar: Option<String>,
    pub call_type: CallType,
    pub offer: SessionDescription,
    pub room_id: RoomId,
}

/// Answer returned by the receiver after accepting an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub answer: SessionDescription,
    pub room_id: RoomId,
}

/// One ICE candidate relayed to the counterparty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceSignal {
    pub candidate: IceCandidate,
    pub sender_id: UserId,
    pub room_id: RoomId,
}

/// Lifecycle notifications carried as state-events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateEventKind {
    Rejected,
    Ended,
    Busy,
    Timeout,
}

impl fmt::Display for StateEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => f.write_str("rejected"),
            Self::Ended => f.write_str("ended"),
            Self::Busy => f.write_str("busy"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// Call lifecycle event sent by the counterparty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStateEvent {
    pub event: StateEventKind,
    pub room_id: RoomId,
    pub sender_id: UserId,
}

/// The four message kinds carried by the signaling channel.
///
/// On the wire the kind travels as the pub/sub event name and the
/// variant payload as the event body; [`SignalingMessage::event_name`]
/// and [`SignalingMessage::from_event`] are the two halves of that
/// mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer(CallOffer),
    Answer(CallAnswer),
    IceCandidate(IceSignal),
    StateEvent(CallStateEvent),
}

impl SignalingMessage {
    /// Event name used on the pub/sub channel.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Offer(_) => "call_offer",
            Self::Answer(_) => "call_answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::StateEvent(_) => "call_state",
        }
    }

    /// Room this message belongs to.
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Offer(m) => &m.room_id,
            Self::Answer(m) => &m.room_id,
            Self::IceCandidate(m) => &m.room_id,
            Self::StateEvent(m) => &m.room_id,
        }
    }

    /// Serialize the variant payload for delivery under
    /// [`Self::event_name`].
    pub fn payload(&self) -> Result<Value, CallError> {
        let value = match self {
            Self::Offer(m) => serde_json::to_value(m),
            Self::Answer(m) => serde_json::to_value(m),
            Self::IceCandidate(m) => serde_json::to_value(m),
            Self::StateEvent(m) => serde_json::to_value(m),
        };
        value.map_err(|e| CallError::Parse(e.to_string()))
    }

    /// Decode a message received from the pub/sub channel.
    pub fn from_event(event: &str, payload: Value) -> Result<Self, CallError> {
        let parse_err = |e: serde_json::Error| CallError::Parse(e.to_string());
        let msg = match event {
            "call_offer" => Self::Offer(serde_json::from_value(payload).map_err(parse_err)?),
            "call_answer" => Self::Answer(serde_json::from_value(payload).map_err(parse_err)?),
            "ice_candidate" => {
                Self::IceCandidate(serde_json::from_value(payload).map_err(parse_err)?)
            }
            "call_state" => Self::StateEvent(serde_json::from_value(payload).map_err(parse_err)?),
            other => {
                return Err(CallError::Parse(format!(
                    "unknown signaling event: {other}"
                )));
            }
        };
        Ok(msg)
    }
}

/// Name of a user's signaling inbox channel on the broker.
pub fn inbox_channel(user: &UserId) -> String {
    format!("calls:{user}")
}
