//! Call session manager: the single source of truth for call lifecycle.
//!
//! [`CallManager`] owns the one [`ActiveCall`] and its [`CallPhase`], and
//! is the only component allowed to mutate them. The UI calls into it
//! (`start_call`, `accept_call`, `reject_call`, `end_call`, the
//! toggles); it drives the media adapter and the signaling channel, and
//! reconciles inbound signaling messages, transport events, and timer
//! firings into one authoritative [`CallSnapshot`] published over a
//! watch channel.
//!
//! All mutable session state lives in one lock-guarded record so illegal
//! combinations (an idle phase with a live call, two outstanding
//! timers) cannot be observed. Everything that can outlive a call
//! attempt (timers, the transport event pump) carries the session
//! epoch and is ignored once a reset has moved the session on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::call_log::{CallLogStatus, CallLogStore, NewCallLog};
use crate::error::CallError;
use crate::media::{MediaEngine, MediaSession, PeerConnectionState, PeerEvent};
use crate::message::{
    CallAnswer, CallOffer, CallStateEvent, IceCandidate, IceSignal, SignalingMessage,
    StateEventKind,
};
use crate::notify::CallNotifier;
use crate::signaling::{RealtimeBroker, SignalingChannel};
use crate::state::{ActiveCall, CallPhase, CallSnapshot, InvalidTransition};
use crate::types::{CallType, PeerProfile, RoomId, UserId};

/// Timeouts and grace windows governing the session state machine.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// How long an outgoing call waits for an answer.
    pub setup_timeout: Duration,
    /// How long an incoming call rings before it counts as missed.
    pub missed_call_timeout: Duration,
    /// Pause between a terminal state and the automatic return to idle,
    /// giving the UI time to display the outcome.
    pub reset_grace: Duration,
    /// Grace window before transient outbound signaling channels close.
    pub signaling_grace: Duration,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(60),
            missed_call_timeout: Duration::from_secs(60),
            reset_grace: Duration::from_millis(2500),
            signaling_grace: Duration::from_secs(1),
        }
    }
}

/// Local party identity, immutable for the manager's lifetime. The
/// surrounding app constructs a fresh manager on identity change.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: display_name.into(),
            avatar: None,
        }
    }
}

/// All mutable session state, guarded by one lock.
#[derive(Default)]
struct CallSession {
    /// Bumped on every reset; stale timers and transport events carry
    /// the epoch they were armed under and are dropped on mismatch.
    epoch: u64,
    phase: CallPhase,
    call: Option<ActiveCall>,
    error_message: Option<String>,
    audio_muted: bool,
    camera_off: bool,
    duration_secs: u64,
    /// Offer held while ringing, consumed by `accept_call`.
    pending_offer: Option<CallOffer>,
    /// Candidates that arrived before the remote description was set,
    /// in arrival order.
    ice_queue: Vec<IceCandidate>,
    setup_timer: Option<JoinHandle<()>>,
    missed_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
    duration_ticker: Option<JoinHandle<()>>,
    peer_pump: Option<JoinHandle<()>>,
}

impl CallSession {
    fn cancel_timers(&mut self) {
        for timer in [
            self.setup_timer.take(),
            self.missed_timer.take(),
            self.grace_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.duration_ticker.take() {
            ticker.abort();
        }
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.peer_pump.take() {
            pump.abort();
        }
    }

    fn room_matches(&self, room_id: &RoomId) -> bool {
        self.call.as_ref().is_some_and(|c| &c.room_id == room_id)
    }
}

/// Orchestrates call lifecycle and state for one local party.
pub struct CallManager {
    identity: LocalIdentity,
    config: CallManagerConfig,
    media: MediaSession,
    signaling: SignalingChannel,
    call_log: Arc<dyn CallLogStore>,
    notifier: Arc<dyn CallNotifier>,
    session: Mutex<CallSession>,
    snapshot: watch::Sender<CallSnapshot>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    pub fn new(
        identity: LocalIdentity,
        config: CallManagerConfig,
        engine: Arc<dyn MediaEngine>,
        broker: Arc<dyn RealtimeBroker>,
        call_log: Arc<dyn CallLogStore>,
        notifier: Arc<dyn CallNotifier>,
    ) -> Arc<Self> {
        let signaling =
            SignalingChannel::new(broker, identity.user_id.clone(), config.signaling_grace);
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        Arc::new(Self {
            identity,
            config,
            media: MediaSession::new(engine),
            signaling,
            call_log,
            notifier,
            session: Mutex::new(CallSession::default()),
            snapshot,
            dispatch: Mutex::new(None),
        })
    }

    /// Open the signaling inbox and start dispatching inbound messages.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CallError> {
        let (tx, mut rx) = mpsc::channel::<SignalingMessage>(64);
        self.signaling.subscribe(tx).await?;

        let mgr = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                mgr.handle_signaling(msg).await;
            }
        });
        if let Some(prev) = self.dispatch.lock().await.replace(task) {
            prev.abort();
        }
        Ok(())
    }

    /// Reactive view of the call state for the UI layer.
    pub fn state(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Start an outgoing call. Rejected outright while another call is
    /// in progress; a pending terminal grace window is cut short.
    pub async fn start_call(
        self: &Arc<Self>,
        peer: PeerProfile,
        call_type: CallType,
    ) -> Result<RoomId, CallError> {
        let mut session = self.session.lock().await;
        if session.phase.is_terminal() {
            self.reset_locked(&mut session).await;
        }
        if !session.phase.is_idle() {
            return Err(CallError::CallInProgress);
        }

        let room_id = RoomId::derive(&self.identity.user_id, &peer.user_id);
        info!(
            "starting {call_type} call to {} (room {room_id})",
            peer.user_id
        );

        let mut call = ActiveCall::new_outgoing(room_id.clone(), peer.clone(), call_type);
        match self
            .call_log
            .create(NewCallLog {
                caller_id: self.identity.user_id.clone(),
                receiver_id: peer.user_id.clone(),
                call_type,
                room_id: room_id.clone(),
            })
            .await
        {
            Ok(log_id) => call.call_log_id = Some(log_id),
            Err(e) => warn!("call log create failed: {e}"),
        }

        session.phase = CallPhase::OutgoingCalling;
        session.call = Some(call);
        self.publish(&session);

        if let Err(e) = self.dial(&mut session, call_type, &peer, &room_id).await {
            warn!("outgoing call setup failed: {e}");
            self.enter_terminal(
                &mut session,
                CallPhase::CallFailed,
                Some(e.user_message()),
                Some(CallLogStatus::Failed),
            )
            .await;
            return Err(e);
        }

        self.arm_setup_timer(&mut session, room_id.clone());
        Ok(room_id)
    }

    /// Media and offer sequence for the caller side.
    async fn dial(
        self: &Arc<Self>,
        session: &mut CallSession,
        call_type: CallType,
        peer: &PeerProfile,
        room_id: &RoomId,
    ) -> Result<(), CallError> {
        self.media.acquire_local_media(call_type).await?;
        let events = self.build_connection().await?;
        self.spawn_peer_pump(session, events);
        self.media.attach_local_tracks().await?;
        let offer = self.media.create_offer().await?;
        self.signaling
            .send_offer(
                &peer.user_id,
                offer,
                call_type,
                &self.identity.display_name,
                self.identity.avatar.clone(),
                Some(room_id.clone()),
            )
            .await?;
        Ok(())
    }

    /// Accept the currently ringing incoming call.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if !session.phase.can_accept() {
            return Err(InvalidTransition {
                current_phase: session.phase,
                attempted: "accept",
            }
            .into());
        }
        let offer = session
            .pending_offer
            .take()
            .ok_or_else(|| CallError::Signaling("no pending offer".into()))?;

        if let Some(timer) = session.missed_timer.take() {
            timer.abort();
        }
        info!("accepting call from {} (room {})", offer.caller_id, offer.room_id);
        session.phase = CallPhase::Connecting;
        self.publish(&session);
        self.notifier.clear().await;

        if let Err(e) = self.answer(&mut session, &offer).await {
            warn!("accepting call failed: {e}");
            self.enter_terminal(
                &mut session,
                CallPhase::CallFailed,
                Some(e.user_message()),
                None,
            )
            .await;
            return Err(e);
        }
        Ok(())
    }

    /// Media and answer sequence for the receiver side.
    async fn answer(
        self: &Arc<Self>,
        session: &mut CallSession,
        offer: &CallOffer,
    ) -> Result<(), CallError> {
        self.media.acquire_local_media(offer.call_type).await?;
        let events = self.build_connection().await?;
        self.spawn_peer_pump(session, events);
        self.media.attach_local_tracks().await?;
        let answer = self.media.accept_offer(&offer.offer).await?;
        self.signaling
            .send_answer(&offer.caller_id, answer, offer.room_id.clone())
            .await?;
        self.flush_ice_queue(session).await;
        Ok(())
    }

    /// Decline the currently ringing incoming call and return to idle.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if !session.phase.can_reject() {
            return Err(InvalidTransition {
                current_phase: session.phase,
                attempted: "reject",
            }
            .into());
        }
        let (peer, room_id) = match &session.call {
            Some(call) => (call.peer.user_id.clone(), call.room_id.clone()),
            None => {
                return Err(InvalidTransition {
                    current_phase: session.phase,
                    attempted: "reject",
                }
                .into());
            }
        };
        info!("rejecting call {room_id}");
        if let Err(e) = self
            .signaling
            .send_call_state(&peer, StateEventKind::Rejected, room_id)
            .await
        {
            warn!("failed to send rejected event: {e}");
        }
        self.reset_locked(&mut session).await;
        Ok(())
    }

    /// Hang up: ends the active call, or cancels one still being set up.
    pub async fn end_call(self: &Arc<Self>) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if !session.phase.can_hang_up() {
            return Err(InvalidTransition {
                current_phase: session.phase,
                attempted: "hang up",
            }
            .into());
        }
        let (peer, room_id, connected) = match &session.call {
            Some(call) => (
                call.peer.user_id.clone(),
                call.room_id.clone(),
                call.start_time.is_some(),
            ),
            None => {
                return Err(InvalidTransition {
                    current_phase: session.phase,
                    attempted: "hang up",
                }
                .into());
            }
        };
        info!("ending call {room_id}");
        if let Err(e) = self
            .signaling
            .send_call_state(&peer, StateEventKind::Ended, room_id)
            .await
        {
            warn!("failed to send ended event: {e}");
        }
        let status = if connected {
            CallLogStatus::Completed
        } else {
            CallLogStatus::Cancelled
        };
        self.enter_terminal(&mut session, CallPhase::CallEnded, None, Some(status))
            .await;
        Ok(())
    }

    /// Flip the microphone mute flag. Does not change the call phase.
    pub async fn toggle_mute(&self) -> bool {
        let mut session = self.session.lock().await;
        session.audio_muted = !session.audio_muted;
        self.media.set_audio_enabled(!session.audio_muted).await;
        self.publish(&session);
        session.audio_muted
    }

    /// Flip the camera-off flag. Does not change the call phase.
    pub async fn toggle_camera(&self) -> bool {
        let mut session = self.session.lock().await;
        session.camera_off = !session.camera_off;
        self.media.set_video_enabled(!session.camera_off).await;
        self.publish(&session);
        session.camera_off
    }

    /// Tear down everything and return to idle: the single authoritative
    /// cleanup path. Callable from any state, repeatedly.
    pub async fn reset_call(&self) {
        let mut session = self.session.lock().await;
        self.reset_locked(&mut session).await;
    }

    /// Reset any live call and close the signaling inbox.
    pub async fn shutdown(&self) {
        self.reset_call().await;
        if let Some(task) = self.dispatch.lock().await.take() {
            task.abort();
        }
        self.signaling.cleanup().await;
    }

    async fn reset_locked(&self, session: &mut CallSession) {
        debug!("resetting call session");
        session.cancel_timers();
        session.stop_ticker();
        session.stop_pump();
        session.epoch += 1;
        session.call = None;
        session.pending_offer = None;
        session.ice_queue.clear();
        session.error_message = None;
        session.duration_secs = 0;
        session.audio_muted = false;
        session.camera_off = false;
        session.phase = CallPhase::Idle;
        self.media.release().await;
        self.notifier.clear().await;
        self.publish(session);
    }

    // ---- inbound signaling ----

    async fn handle_signaling(self: &Arc<Self>, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Offer(offer) => self.on_offer(offer).await,
            SignalingMessage::Answer(answer) => self.on_answer(answer).await,
            SignalingMessage::IceCandidate(signal) => self.on_ice_candidate(signal).await,
            SignalingMessage::StateEvent(event) => self.on_state_event(event).await,
        }
    }

    async fn on_offer(self: &Arc<Self>, offer: CallOffer) {
        let mut session = self.session.lock().await;
        if !session.phase.is_idle() {
            // never interrupt the existing call; the new offer is
            // answered with busy and dropped, not queued
            info!(
                "busy: declining offer from {} (room {})",
                offer.caller_id, offer.room_id
            );
            if let Err(e) = self
                .signaling
                .send_call_state(&offer.caller_id, StateEventKind::Busy, offer.room_id.clone())
                .await
            {
                warn!("failed to send busy reply: {e}");
            }
            return;
        }

        info!(
            "incoming {} call from {} (room {})",
            offer.call_type, offer.caller_id, offer.room_id
        );
        let peer = PeerProfile {
            user_id: offer.caller_id.clone(),
            display_name: offer.caller_name.clone(),
            avatar: offer.caller_avatar.clone(),
        };
        let room_id = offer.room_id.clone();
        session.call = Some(ActiveCall::new_incoming(
            room_id.clone(),
            peer,
            offer.call_type,
        ));
        session.phase = CallPhase::IncomingRinging;
        self.notifier
            .incoming_call(&offer.caller_name, offer.call_type)
            .await;
        session.pending_offer = Some(offer);
        self.arm_missed_timer(&mut session, room_id);
        self.publish(&session);
    }

    async fn on_answer(self: &Arc<Self>, answer: CallAnswer) {
        let mut session = self.session.lock().await;
        if !session.room_matches(&answer.room_id) {
            debug!("ignoring answer for stale room {}", answer.room_id);
            return;
        }
        if session.phase != CallPhase::OutgoingCalling {
            debug!("ignoring answer while {}", session.phase);
            return;
        }
        if let Some(timer) = session.setup_timer.take() {
            timer.abort();
        }
        info!("answer received for room {}", answer.room_id);
        session.phase = CallPhase::Connecting;
        self.publish(&session);

        if let Err(e) = self.media.apply_answer(&answer.answer).await {
            warn!("applying answer failed: {e}");
            self.enter_terminal(
                &mut session,
                CallPhase::CallFailed,
                Some(e.user_message()),
                Some(CallLogStatus::Failed),
            )
            .await;
            return;
        }
        self.flush_ice_queue(&mut session).await;
    }

    async fn on_ice_candidate(&self, signal: IceSignal) {
        let mut session = self.session.lock().await;
        if !session.room_matches(&signal.room_id) {
            debug!("ignoring candidate for stale room {}", signal.room_id);
            return;
        }
        if self.media.remote_description_set().await {
            // a single lost candidate does not abort the call
            if let Err(e) = self.media.apply_candidate(&signal.candidate).await {
                warn!("failed to apply ICE candidate: {e}");
            }
        } else {
            session.ice_queue.push(signal.candidate);
        }
    }

    async fn on_state_event(self: &Arc<Self>, event: CallStateEvent) {
        let mut session = self.session.lock().await;
        if !session.room_matches(&event.room_id) {
            debug!(
                "ignoring {} event for stale room {}",
                event.event, event.room_id
            );
            return;
        }
        if session.phase.is_terminal() {
            // at-least-once delivery: a repeated terminal event is a no-op
            debug!("ignoring duplicate {} event", event.event);
            return;
        }

        info!("peer sent {} for room {}", event.event, event.room_id);
        let connected = session
            .call
            .as_ref()
            .is_some_and(|c| c.start_time.is_some());
        match event.event {
            StateEventKind::Rejected => {
                self.enter_terminal(
                    &mut session,
                    CallPhase::Rejected,
                    None,
                    Some(CallLogStatus::Rejected),
                )
                .await;
            }
            StateEventKind::Ended => {
                let status = if connected {
                    CallLogStatus::Completed
                } else {
                    CallLogStatus::Cancelled
                };
                self.enter_terminal(&mut session, CallPhase::CallEnded, None, Some(status))
                    .await;
            }
            StateEventKind::Busy => {
                self.enter_terminal(
                    &mut session,
                    CallPhase::CallFailed,
                    Some("User is busy".into()),
                    Some(CallLogStatus::Failed),
                )
                .await;
            }
            StateEventKind::Timeout => {
                self.enter_terminal(
                    &mut session,
                    CallPhase::Missed,
                    None,
                    Some(CallLogStatus::NoAnswer),
                )
                .await;
            }
        }
    }

    // ---- transport events ----

    async fn handle_peer_event(self: &Arc<Self>, epoch: u64, event: PeerEvent) {
        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            debug!("dropping transport event from a previous call attempt");
            return;
        }
        match event {
            PeerEvent::CandidateDiscovered(candidate) => {
                if !session.phase.is_active() {
                    return;
                }
                let Some(call) = &session.call else { return };
                let (peer, room_id) = (call.peer.user_id.clone(), call.room_id.clone());
                if let Err(e) = self
                    .signaling
                    .send_ice_candidate(&peer, candidate, room_id)
                    .await
                {
                    warn!("failed to send ICE candidate: {e}");
                }
            }
            PeerEvent::StateChanged(state) => {
                self.on_connection_state(&mut session, state).await;
            }
        }
    }

    async fn on_connection_state(
        self: &Arc<Self>,
        session: &mut CallSession,
        state: PeerConnectionState,
    ) {
        match state {
            PeerConnectionState::Connected => {
                if session.phase != CallPhase::Connecting {
                    debug!("connected event while {}, ignoring", session.phase);
                    return;
                }
                session.cancel_timers();
                if let Some(call) = session.call.as_mut() {
                    call.start_time = Some(Utc::now());
                }
                session.phase = CallPhase::InCall;
                session.duration_secs = 0;
                self.start_duration_ticker(session);
                info!("call connected");
                self.publish(session);
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                if matches!(session.phase, CallPhase::Connecting | CallPhase::InCall) {
                    warn!("transport lost while {}", session.phase);
                    self.enter_terminal(
                        session,
                        CallPhase::CallFailed,
                        Some("Connection lost".into()),
                        Some(CallLogStatus::Failed),
                    )
                    .await;
                }
            }
            PeerConnectionState::Closed => {
                // a close is a normal end only if the call was connected
                let connected = session
                    .call
                    .as_ref()
                    .is_some_and(|c| c.start_time.is_some());
                if session.phase == CallPhase::InCall && connected {
                    self.enter_terminal(
                        session,
                        CallPhase::CallEnded,
                        None,
                        Some(CallLogStatus::Completed),
                    )
                    .await;
                }
            }
            PeerConnectionState::Connecting => {}
        }
    }

    // ---- internals ----

    /// Move to a terminal phase: stop timers and the media session,
    /// update the outgoing call log, and schedule the grace auto-reset.
    ///
    /// The transport event pump is left running: it may be the task
    /// calling this (aborting it here would cancel the transition
    /// midway), and phase guards already drop anything it delivers in a
    /// terminal phase. `reset_locked` tears it down.
    async fn enter_terminal(
        self: &Arc<Self>,
        session: &mut CallSession,
        phase: CallPhase,
        error_message: Option<String>,
        log_status: Option<CallLogStatus>,
    ) {
        session.cancel_timers();
        session.stop_ticker();
        self.media.release().await;
        self.notifier.clear().await;

        let log_update = match (&log_status, &session.call) {
            (Some(status), Some(call)) if call.is_outgoing => call
                .call_log_id
                .clone()
                .map(|id| (id, *status, call.elapsed_secs())),
            _ => None,
        };
        if let Some((log_id, status, duration)) = log_update {
            if let Err(e) = self.call_log.update(&log_id, status, duration).await {
                warn!("call log update failed: {e}");
            }
        }

        session.phase = phase;
        session.error_message = error_message;
        self.publish(session);
        self.arm_grace_reset(session);
    }

    async fn build_connection(&self) -> Result<mpsc::Receiver<PeerEvent>, CallError> {
        let (tx, rx) = mpsc::channel(32);
        self.media.create_connection(tx).await?;
        Ok(rx)
    }

    fn spawn_peer_pump(
        self: &Arc<Self>,
        session: &mut CallSession,
        mut events: mpsc::Receiver<PeerEvent>,
    ) {
        session.stop_pump();
        let mgr = Arc::clone(self);
        let epoch = session.epoch;
        session.peer_pump = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                mgr.handle_peer_event(epoch, event).await;
            }
        }));
    }

    fn arm_setup_timer(self: &Arc<Self>, session: &mut CallSession, room_id: RoomId) {
        if let Some(timer) = session.setup_timer.take() {
            timer.abort();
        }
        let mgr = Arc::clone(self);
        let epoch = session.epoch;
        let timeout = self.config.setup_timeout;
        session.setup_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            mgr.on_setup_timeout(epoch, room_id).await;
        }));
    }

    async fn on_setup_timeout(self: &Arc<Self>, epoch: u64, room_id: RoomId) {
        let mut session = self.session.lock().await;
        if session.epoch != epoch
            || session.phase != CallPhase::OutgoingCalling
            || !session.room_matches(&room_id)
        {
            return;
        }
        // this task IS the setup timer; drop the handle so the terminal
        // transition below does not abort it mid-flight
        session.setup_timer = None;
        info!("call {room_id} timed out with no answer");
        let peer = match &session.call {
            Some(call) => call.peer.user_id.clone(),
            None => return,
        };
        if let Err(e) = self
            .signaling
            .send_call_state(&peer, StateEventKind::Timeout, room_id)
            .await
        {
            warn!("failed to send timeout event: {e}");
        }
        self.enter_terminal(
            &mut session,
            CallPhase::CallFailed,
            Some("No answer".into()),
            Some(CallLogStatus::NoAnswer),
        )
        .await;
    }

    fn arm_missed_timer(self: &Arc<Self>, session: &mut CallSession, room_id: RoomId) {
        if let Some(timer) = session.missed_timer.take() {
            timer.abort();
        }
        let mgr = Arc::clone(self);
        let epoch = session.epoch;
        let timeout = self.config.missed_call_timeout;
        session.missed_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            mgr.on_missed_timeout(epoch, room_id).await;
        }));
    }

    async fn on_missed_timeout(self: &Arc<Self>, epoch: u64, room_id: RoomId) {
        let mut session = self.session.lock().await;
        if session.epoch != epoch
            || session.phase != CallPhase::IncomingRinging
            || !session.room_matches(&room_id)
        {
            return;
        }
        // this task IS the missed-call timer; see on_setup_timeout
        session.missed_timer = None;
        info!("incoming call {room_id} missed");
        let peer = match &session.call {
            Some(call) => call.peer.user_id.clone(),
            None => return,
        };
        if let Err(e) = self
            .signaling
            .send_call_state(&peer, StateEventKind::Timeout, room_id)
            .await
        {
            warn!("failed to send timeout event: {e}");
        }
        self.enter_terminal(&mut session, CallPhase::Missed, None, None)
            .await;
    }

    fn arm_grace_reset(self: &Arc<Self>, session: &mut CallSession) {
        if let Some(timer) = session.grace_timer.take() {
            timer.abort();
        }
        let mgr = Arc::clone(self);
        let epoch = session.epoch;
        let grace = self.config.reset_grace;
        session.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut session = mgr.session.lock().await;
            if session.epoch == epoch && session.phase.is_terminal() {
                // drop our own handle before reset aborts the timers
                session.grace_timer = None;
                mgr.reset_locked(&mut session).await;
            }
        }));
    }

    fn start_duration_ticker(self: &Arc<Self>, session: &mut CallSession) {
        session.stop_ticker();
        let mgr = Arc::clone(self);
        let epoch = session.epoch;
        session.duration_ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await; // first tick resolves immediately
            loop {
                interval.tick().await;
                let mut session = mgr.session.lock().await;
                if session.epoch != epoch || session.phase != CallPhase::InCall {
                    break;
                }
                session.duration_secs += 1;
                mgr.publish(&session);
            }
        }));
    }

    /// Apply queued candidates in arrival order, once the remote
    /// description is set.
    async fn flush_ice_queue(&self, session: &mut CallSession) {
        if session.ice_queue.is_empty() {
            return;
        }
        debug!("flushing {} queued ICE candidates", session.ice_queue.len());
        for candidate in std::mem::take(&mut session.ice_queue) {
            if let Err(e) = self.media.apply_candidate(&candidate).await {
                warn!("failed to apply queued ICE candidate: {e}");
            }
        }
    }

    fn publish(&self, session: &CallSession) {
        self.snapshot.send_replace(CallSnapshot {
            phase: session.phase,
            call: session.call.clone(),
            error_message: session.error_message.clone(),
            duration_secs: session.duration_secs,
            audio_muted: session.audio_muted,
            camera_off: session.camera_off,
        });
    }
}
