//! Call session state model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::call_log::CallLogId;
use crate::types::{CallType, PeerProfile, RoomId};

/// Single authoritative lifecycle state per local party.
///
/// Terminal states auto-return to [`CallPhase::Idle`] after a short
/// grace delay so the UI can show the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    #[default]
    Idle,
    /// Offer sent, waiting for the peer to answer.
    OutgoingCalling,
    /// Offer received, ringing locally.
    IncomingRinging,
    /// Both sides agreed; transport connection in progress.
    Connecting,
    /// Transport connected, media flowing.
    InCall,
    CallEnded,
    CallFailed,
    Rejected,
    Missed,
}

impl CallPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CallEnded | Self::CallFailed | Self::Rejected | Self::Missed
        )
    }

    /// A call attempt is live in this phase.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::OutgoingCalling | Self::IncomingRinging | Self::Connecting | Self::InCall
        )
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::IncomingRinging)
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::IncomingRinging)
    }

    /// Hanging up covers the active call and the caller cancelling
    /// before the peer answers.
    pub fn can_hang_up(&self) -> bool {
        matches!(self, Self::OutgoingCalling | Self::Connecting | Self::InCall)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::OutgoingCalling => "outgoing_calling",
            Self::IncomingRinging => "incoming_ringing",
            Self::Connecting => "connecting",
            Self::InCall => "in_call",
            Self::CallEnded => "call_ended",
            Self::CallFailed => "call_failed",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
        };
        f.write_str(name)
    }
}

/// The one call attempt currently owned by the session manager.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub room_id: RoomId,
    pub peer: PeerProfile,
    pub call_type: CallType,
    pub is_outgoing: bool,
    /// Set the instant the transport reaches a connected state; absence
    /// means the call never connected.
    pub start_time: Option<DateTime<Utc>>,
    /// Persisted call-log handle, present only for outgoing calls.
    pub call_log_id: Option<CallLogId>,
}

impl ActiveCall {
    pub fn new_outgoing(room_id: RoomId, peer: PeerProfile, call_type: CallType) -> Self {
        Self {
            room_id,
            peer,
            call_type,
            is_outgoing: true,
            start_time: None,
            call_log_id: None,
        }
    }

    pub fn new_incoming(room_id: RoomId, peer: PeerProfile, call_type: CallType) -> Self {
        Self {
            room_id,
            peer,
            call_type,
            is_outgoing: false,
            start_time: None,
            call_log_id: None,
        }
    }

    /// Seconds since the transport connected; `None` if it never did.
    pub fn elapsed_secs(&self) -> Option<u64> {
        self.start_time
            .map(|t| Utc::now().signed_duration_since(t).num_seconds().max(0) as u64)
    }
}

/// Reactive snapshot of the call session, consumed by the UI layer.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub call: Option<ActiveCall>,
    pub error_message: Option<String>,
    pub duration_secs: u64,
    pub audio_muted: bool,
    pub camera_off: bool,
}

/// Attempted operation that the current phase does not allow.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: CallPhase,
    pub attempted: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} while {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}
