//! Media/transport adapter over the platform peer-connection primitive.
//!
//! [`MediaSession`] wraps an external [`MediaEngine`] behind an interface
//! that is independent of call direction. The adapter owns at most one
//! live connection and one local media stream at a time;
//! `create_connection` defensively tears down any prior connection, and
//! `release` is safe to call repeatedly.
//!
//! Candidate discovery and connection-state changes are delivered as
//! [`PeerEvent`]s on the channel handed to `create_connection`; the
//! session manager consumes them and owns the pre-remote-description
//! candidate queue.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::error::CallError;
use crate::message::{IceCandidate, SessionDescription};
use crate::types::{CallType, TrackKind};

/// Media acquisition failure reported by the engine.
#[derive(Debug, Error)]
pub enum MediaAcquireError {
    #[error("permission denied")]
    AccessDenied,
    #[error("no usable device: {0}")]
    Unavailable(String),
}

/// Handle to the acquired local media tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub has_audio: bool,
    pub has_video: bool,
}

/// Connection-level state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events surfaced by a live peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    CandidateDiscovered(IceCandidate),
    StateChanged(PeerConnectionState),
}

/// The platform peer-connection primitive (external boundary).
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Request the microphone, and the camera for video calls.
    async fn acquire_media(&self, call_type: CallType) -> Result<LocalMedia, MediaAcquireError>;

    /// Create a fresh connection. Discovered candidates and state
    /// changes are delivered on `events` for the connection's lifetime.
    async fn create_connection(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error>;
}

/// One peer connection created by the engine.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_tracks(&self, media: &LocalMedia) -> Result<(), anyhow::Error>;

    /// Local description requesting both audio and video reception
    /// capability regardless of call type.
    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error>;

    /// Apply the remote offer, then create and apply the local answer.
    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, anyhow::Error>;

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), anyhow::Error>;

    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), anyhow::Error>;

    async fn has_remote_description(&self) -> bool;

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool);

    /// Stop all tracks and close. Must be safe to call repeatedly.
    async fn close(&self);
}

/// Call-direction-independent adapter owning at most one live connection
/// and one local stream.
pub struct MediaSession {
    engine: Arc<dyn MediaEngine>,
    connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    local: Mutex<Option<LocalMedia>>,
}

impl MediaSession {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            connection: Mutex::new(None),
            local: Mutex::new(None),
        }
    }

    /// Acquire local media for the given call type.
    pub async fn acquire_local_media(&self, call_type: CallType) -> Result<LocalMedia, CallError> {
        let media = self
            .engine
            .acquire_media(call_type)
            .await
            .map_err(|e| match e {
                MediaAcquireError::AccessDenied => CallError::MediaAccessDenied { call_type },
                MediaAcquireError::Unavailable(cause) => {
                    warn!("media unavailable: {cause}");
                    CallError::MediaUnavailable { call_type }
                }
            })?;
        *self.local.lock().await = Some(media.clone());
        Ok(media)
    }

    /// Create a connection, tearing down any prior one first.
    pub async fn create_connection(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<(), CallError> {
        let mut slot = self.connection.lock().await;
        if let Some(old) = slot.take() {
            debug!("replacing live peer connection");
            old.close().await;
        }
        let conn = self
            .engine
            .create_connection(events)
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        *slot = Some(conn);
        Ok(())
    }

    pub async fn attach_local_tracks(&self) -> Result<(), CallError> {
        let conn = self.connection().await?;
        let local = self
            .local
            .lock()
            .await
            .clone()
            .ok_or_else(|| CallError::Negotiation("local media not acquired".into()))?;
        conn.attach_tracks(&local)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let conn = self.connection().await?;
        conn.create_offer()
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))
    }

    pub async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        let conn = self.connection().await?;
        conn.accept_offer(offer)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))
    }

    pub async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), CallError> {
        let conn = self.connection().await?;
        conn.apply_answer(answer)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))
    }

    pub async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let conn = self.connection().await?;
        conn.apply_candidate(candidate)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))
    }

    /// Whether the remote description has been applied. Candidates may
    /// only be applied directly once this returns true; before that the
    /// caller is responsible for queuing them.
    pub async fn remote_description_set(&self) -> bool {
        match &*self.connection.lock().await {
            Some(conn) => conn.has_remote_description().await,
            None => false,
        }
    }

    /// Toggle the local audio track without renegotiation.
    pub async fn set_audio_enabled(&self, enabled: bool) {
        if let Some(conn) = &*self.connection.lock().await {
            conn.set_track_enabled(TrackKind::Audio, enabled).await;
        }
    }

    /// Toggle the local video track without renegotiation.
    pub async fn set_video_enabled(&self, enabled: bool) {
        if let Some(conn) = &*self.connection.lock().await {
            conn.set_track_enabled(TrackKind::Video, enabled).await;
        }
    }

    /// Stop all tracks, close the connection, and return to the
    /// unattached state. Idempotent.
    pub async fn release(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close().await;
        }
        *self.local.lock().await = None;
    }

    async fn connection(&self) -> Result<Arc<dyn PeerConnection>, CallError> {
        self.connection
            .lock()
            .await
            .clone()
            .ok_or(CallError::ConnectionNotReady)
    }
}

/// Scriptable in-process engine for tests and local experiments.
pub mod fake {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::message::SdpKind;

    #[derive(Default)]
    pub struct FakeMediaEngine {
        deny_media: AtomicBool,
        no_devices: AtomicBool,
        connections: StdMutex<Vec<Arc<FakeConnection>>>,
    }

    impl FakeMediaEngine {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make `acquire_media` fail as permission-denied.
        pub fn deny_media(&self) {
            self.deny_media.store(true, Ordering::SeqCst);
        }

        /// Make `acquire_media` fail as no-devices.
        pub fn remove_devices(&self) {
            self.no_devices.store(true, Ordering::SeqCst);
        }

        /// Most recently created connection.
        pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
            self.connections.lock().unwrap().last().cloned()
        }

        pub fn connection_count(&self) -> usize {
            self.connections.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MediaEngine for FakeMediaEngine {
        async fn acquire_media(
            &self,
            call_type: CallType,
        ) -> Result<LocalMedia, MediaAcquireError> {
            if self.deny_media.load(Ordering::SeqCst) {
                return Err(MediaAcquireError::AccessDenied);
            }
            if self.no_devices.load(Ordering::SeqCst) {
                return Err(MediaAcquireError::Unavailable("no capture devices".into()));
            }
            Ok(LocalMedia {
                has_audio: true,
                has_video: call_type.is_video(),
            })
        }

        async fn create_connection(
            &self,
            events: mpsc::Sender<PeerEvent>,
        ) -> Result<Arc<dyn PeerConnection>, anyhow::Error> {
            let conn = Arc::new(FakeConnection::new(events));
            self.connections.lock().unwrap().push(conn.clone());
            Ok(conn)
        }
    }

    pub struct FakeConnection {
        events: mpsc::Sender<PeerEvent>,
        remote_set: AtomicBool,
        closed: AtomicBool,
        applied: StdMutex<Vec<IceCandidate>>,
        track_changes: StdMutex<Vec<(TrackKind, bool)>>,
        attached: StdMutex<Option<LocalMedia>>,
    }

    impl FakeConnection {
        fn new(events: mpsc::Sender<PeerEvent>) -> Self {
            Self {
                events,
                remote_set: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                applied: StdMutex::new(Vec::new()),
                track_changes: StdMutex::new(Vec::new()),
                attached: StdMutex::new(None),
            }
        }

        /// Drive a connection-state change as the platform would.
        pub async fn emit_state(&self, state: PeerConnectionState) {
            let _ = self.events.send(PeerEvent::StateChanged(state)).await;
        }

        /// Surface a locally discovered candidate.
        pub async fn emit_candidate(&self, candidate: IceCandidate) {
            let _ = self
                .events
                .send(PeerEvent::CandidateDiscovered(candidate))
                .await;
        }

        /// Candidates applied so far, in application order.
        pub fn applied_candidates(&self) -> Vec<IceCandidate> {
            self.applied.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn track_changes(&self) -> Vec<(TrackKind, bool)> {
            self.track_changes.lock().unwrap().clone()
        }

        pub fn attached_media(&self) -> Option<LocalMedia> {
            self.attached.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn attach_tracks(&self, media: &LocalMedia) -> Result<(), anyhow::Error> {
            *self.attached.lock().unwrap() = Some(media.clone());
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error> {
            Ok(SessionDescription::offer("v=0 fake-offer"))
        }

        async fn accept_offer(
            &self,
            offer: &SessionDescription,
        ) -> Result<SessionDescription, anyhow::Error> {
            if offer.kind != SdpKind::Offer {
                anyhow::bail!("expected an offer description");
            }
            self.remote_set.store(true, Ordering::SeqCst);
            Ok(SessionDescription::answer("v=0 fake-answer"))
        }

        async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), anyhow::Error> {
            if answer.kind != SdpKind::Answer {
                anyhow::bail!("expected an answer description");
            }
            self.remote_set.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), anyhow::Error> {
            self.applied.lock().unwrap().push(candidate.clone());
            Ok(())
        }

        async fn has_remote_description(&self) -> bool {
            self.remote_set.load(Ordering::SeqCst)
        }

        async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
            self.track_changes.lock().unwrap().push((kind, enabled));
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
