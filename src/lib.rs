//! Peer-to-peer call engine for a consumer chat application.
//!
//! Three layers, leaves first:
//!
//! - [`MediaSession`]: call-direction-independent adapter over the
//!   platform peer-connection primitive ([`MediaEngine`]).
//! - [`SignalingChannel`]: delivery of the four [`SignalingMessage`]
//!   kinds over per-user pub/sub inboxes ([`RealtimeBroker`]).
//! - [`CallManager`]: the session state machine owning [`CallPhase`]
//!   and [`ActiveCall`]; the only component that mutates call state.
//!
//! Control flow: the UI calls into [`CallManager`] (`start_call`,
//! `accept_call`, `reject_call`, `end_call`, the toggles); the manager
//! drives the adapter and the channel; inbound signaling and transport
//! events feed back into the manager, which publishes one authoritative
//! [`CallSnapshot`] over a watch channel.

pub mod call_log;
pub mod error;
pub mod manager;
pub mod media;
pub mod message;
pub mod notify;
pub mod signaling;
pub mod state;
pub mod types;

pub use call_log::{
    CallLogId, CallLogRecord, CallLogStatus, CallLogStore, InMemoryCallLog, NewCallLog,
};
pub use error::CallError;
pub use manager::{CallManager, CallManagerConfig, LocalIdentity};
pub use media::{
    LocalMedia, MediaAcquireError, MediaEngine, MediaSession, PeerConnection,
    PeerConnectionState, PeerEvent,
};
pub use message::{
    CallAnswer, CallOffer, CallStateEvent, IceCandidate, IceSignal, SdpKind, SessionDescription,
    SignalingMessage, StateEventKind, inbox_channel,
};
pub use notify::{CallNotifier, NoopNotifier};
pub use signaling::{BroadcastChannel, InMemoryBroker, RealtimeBroker, SignalingChannel};
pub use state::{ActiveCall, CallPhase, CallSnapshot, InvalidTransition};
pub use types::{CallType, PeerProfile, RoomId, TrackKind, UserId};
