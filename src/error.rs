//! Call-related error types.

use thiserror::Error;

use crate::state::InvalidTransition;
use crate::types::CallType;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access denied for {call_type} call")]
    MediaAccessDenied { call_type: CallType },

    #[error("no usable media device for {call_type} call")]
    MediaUnavailable { call_type: CallType },

    #[error("peer connection not ready")]
    ConnectionNotReady,

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl CallError {
    /// Message suitable for showing to the user. Media failures carry a
    /// distinct message for voice and video calls.
    pub fn user_message(&self) -> String {
        match self {
            Self::MediaAccessDenied {
                call_type: CallType::Video,
            } => "Camera and microphone access denied. Allow access to make video calls.".into(),
            Self::MediaAccessDenied { .. } => {
                "Microphone access denied. Allow access to make voice calls.".into()
            }
            Self::MediaUnavailable {
                call_type: CallType::Video,
            } => "No camera or microphone available.".into(),
            Self::MediaUnavailable { .. } => "No microphone available.".into(),
            Self::Transport(_) => "Connection lost".into(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_messages_distinguish_voice_and_video() {
        let voice = CallError::MediaAccessDenied {
            call_type: CallType::Voice,
        };
        let video = CallError::MediaAccessDenied {
            call_type: CallType::Video,
        };
        assert!(voice.user_message().contains("Microphone"));
        assert!(video.user_message().contains("Camera"));
        assert_ne!(voice.user_message(), video.user_message());
    }

    #[test]
    fn test_unavailable_messages_distinguish_voice_and_video() {
        let voice = CallError::MediaUnavailable {
            call_type: CallType::Voice,
        };
        let video = CallError::MediaUnavailable {
            call_type: CallType::Video,
        };
        assert_ne!(voice.user_message(), video.user_message());
    }
}
