//! Signaling channel over per-user pub/sub inboxes.
//!
//! Delivers the four [`SignalingMessage`] kinds between exactly two
//! parties with no persistence and no ordering guarantee beyond the
//! broker's at-least-once delivery. Each outbound send opens its own
//! short-lived channel to the target's inbox rather than reusing a
//! bidirectional one; the channel is torn down after a short grace
//! window so an asynchronous broker acknowledgement is not cut off.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::CallError;
use crate::message::{
    CallAnswer, CallOffer, CallStateEvent, IceCandidate, IceSignal, SessionDescription,
    SignalingMessage, StateEventKind, inbox_channel,
};
use crate::types::{CallType, RoomId, UserId};

/// Managed realtime pub/sub service (external boundary).
#[async_trait]
pub trait RealtimeBroker: Send + Sync {
    async fn open_channel(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>, anyhow::Error>;
}

/// One named broadcast channel on the broker.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn send(&self, event: &str, payload: Value) -> Result<(), anyhow::Error>;

    /// Deliver every `(event, payload)` published to this channel on
    /// `tx` until the channel is closed.
    async fn subscribe(&self, tx: mpsc::Sender<(String, Value)>) -> Result<(), anyhow::Error>;

    /// Must be safe to call repeatedly.
    async fn close(&self);
}

struct Inbox {
    channel: Arc<dyn BroadcastChannel>,
    router: JoinHandle<()>,
}

struct PendingTeardown {
    channel: Arc<dyn BroadcastChannel>,
    timer: JoinHandle<()>,
}

/// Signaling endpoint for one local user.
pub struct SignalingChannel {
    broker: Arc<dyn RealtimeBroker>,
    local_user: UserId,
    grace: Duration,
    inbox: Mutex<Option<Inbox>>,
    teardowns: Arc<DashMap<u64, PendingTeardown>>,
    next_teardown: AtomicU64,
}

impl SignalingChannel {
    pub fn new(broker: Arc<dyn RealtimeBroker>, local_user: UserId, grace: Duration) -> Self {
        Self {
            broker,
            local_user,
            grace,
            inbox: Mutex::new(None),
            teardowns: Arc::new(DashMap::new()),
            next_teardown: AtomicU64::new(0),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Open the local inbox and route decoded messages to `handler`.
    /// Replaces any prior subscription; at most one inbox is live.
    pub async fn subscribe(
        &self,
        handler: mpsc::Sender<SignalingMessage>,
    ) -> Result<(), CallError> {
        let channel = self
            .broker
            .open_channel(&inbox_channel(&self.local_user))
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))?;

        let (raw_tx, mut raw_rx) = mpsc::channel::<(String, Value)>(64);
        channel
            .subscribe(raw_tx)
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))?;

        let user = self.local_user.clone();
        let router = tokio::spawn(async move {
            while let Some((event, payload)) = raw_rx.recv().await {
                match SignalingMessage::from_event(&event, payload) {
                    Ok(msg) => {
                        if handler.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{user}: dropping malformed signaling event: {e}"),
                }
            }
        });

        let mut slot = self.inbox.lock().await;
        if let Some(prev) = slot.take() {
            debug!("{}: replacing signaling inbox", self.local_user);
            prev.router.abort();
            prev.channel.close().await;
        }
        *slot = Some(Inbox { channel, router });
        Ok(())
    }

    /// Deliver a call offer to `receiver`, deriving the room id when one
    /// is not supplied. Returns the room id used.
    pub async fn send_offer(
        &self,
        receiver: &UserId,
        offer: SessionDescription,
        call_type: CallType,
        caller_name: &str,
        caller_avatar: Option<String>,
        room_id: Option<RoomId>,
    ) -> Result<RoomId, CallError> {
        let room_id = room_id.unwrap_or_else(|| RoomId::derive(&self.local_user, receiver));
        let msg = SignalingMessage::Offer(CallOffer {
            caller_id: self.local_user.clone(),
            caller_name: caller_name.to_string(),
            caller_avatar,
            call_type,
            offer,
            room_id: room_id.clone(),
        });
        self.send_to(receiver, &msg).await?;
        Ok(room_id)
    }

    pub async fn send_answer(
        &self,
        caller: &UserId,
        answer: SessionDescription,
        room_id: RoomId,
    ) -> Result<(), CallError> {
        let msg = SignalingMessage::Answer(CallAnswer { answer, room_id });
        self.send_to(caller, &msg).await
    }

    pub async fn send_ice_candidate(
        &self,
        target: &UserId,
        candidate: IceCandidate,
        room_id: RoomId,
    ) -> Result<(), CallError> {
        let msg = SignalingMessage::IceCandidate(IceSignal {
            candidate,
            sender_id: self.local_user.clone(),
            room_id,
        });
        self.send_to(target, &msg).await
    }

    pub async fn send_call_state(
        &self,
        target: &UserId,
        event: StateEventKind,
        room_id: RoomId,
    ) -> Result<(), CallError> {
        let msg = SignalingMessage::StateEvent(CallStateEvent {
            event,
            room_id,
            sender_id: self.local_user.clone(),
        });
        self.send_to(target, &msg).await
    }

    /// Open a transient channel to the target's inbox, deliver, and tear
    /// the channel down after the grace window.
    async fn send_to(&self, target: &UserId, message: &SignalingMessage) -> Result<(), CallError> {
        let payload = message.payload()?;
        let channel = self
            .broker
            .open_channel(&inbox_channel(target))
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))?;

        debug!(
            "{}: sending {} to {target}",
            self.local_user,
            message.event_name()
        );
        let result = channel.send(message.event_name(), payload).await;
        self.schedule_teardown(channel);
        result.map_err(|e| CallError::Signaling(e.to_string()))
    }

    fn schedule_teardown(&self, channel: Arc<dyn BroadcastChannel>) {
        let id = self.next_teardown.fetch_add(1, Ordering::Relaxed);
        let teardowns = Arc::clone(&self.teardowns);
        let grace = self.grace;
        let timer = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                tokio::time::sleep(grace).await;
                channel.close().await;
                teardowns.remove(&id);
            }
        });
        self.teardowns.insert(id, PendingTeardown { channel, timer });
    }

    /// Close the inbox and drop all pending teardowns. Idempotent.
    pub async fn cleanup(&self) {
        if let Some(inbox) = self.inbox.lock().await.take() {
            inbox.router.abort();
            inbox.channel.close().await;
        }
        let ids: Vec<u64> = self.teardowns.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.teardowns.remove(&id) {
                pending.timer.abort();
                pending.channel.close().await;
            }
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<(String, Value)>,
}

#[derive(Default)]
struct BrokerShared {
    topics: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Loopback broker routing events between channels by name, for tests
/// and single-process experiments.
#[derive(Default)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RealtimeBroker for InMemoryBroker {
    async fn open_channel(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>, anyhow::Error> {
        Ok(Arc::new(MemoryChannel {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            subscriptions: std::sync::Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryChannel {
    name: String,
    shared: Arc<BrokerShared>,
    subscriptions: std::sync::Mutex<Vec<u64>>,
}

#[async_trait]
impl BroadcastChannel for MemoryChannel {
    async fn send(&self, event: &str, payload: Value) -> Result<(), anyhow::Error> {
        let targets: Vec<mpsc::Sender<(String, Value)>> = self
            .shared
            .topics
            .get(&self.name)
            .map(|subs| subs.iter().map(|s| s.tx.clone()).collect())
            .unwrap_or_default();
        for tx in targets {
            let _ = tx.send((event.to_string(), payload.clone())).await;
        }
        Ok(())
    }

    async fn subscribe(&self, tx: mpsc::Sender<(String, Value)>) -> Result<(), anyhow::Error> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .topics
            .entry(self.name.clone())
            .or_default()
            .push(Subscriber { id, tx });
        self.subscriptions.lock().unwrap().push(id);
        Ok(())
    }

    async fn close(&self) {
        let ids: Vec<u64> = std::mem::take(&mut *self.subscriptions.lock().unwrap());
        if ids.is_empty() {
            return;
        }
        if let Some(mut subs) = self.shared.topics.get_mut(&self.name) {
            subs.retain(|s| !ids.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_channel(broker: &Arc<InMemoryBroker>, user: &str) -> SignalingChannel {
        SignalingChannel::new(
            broker.clone(),
            UserId::new(user),
            Duration::from_millis(20),
        )
    }

    async fn subscribe(channel: &SignalingChannel) -> mpsc::Receiver<SignalingMessage> {
        let (tx, rx) = mpsc::channel(16);
        channel.subscribe(tx).await.unwrap();
        rx
    }

    #[tokio::test]
    async fn test_offer_reaches_receiver_inbox() {
        let broker = InMemoryBroker::new();
        let alice = make_channel(&broker, "alice");
        let bob = make_channel(&broker, "bob");
        let mut bob_rx = subscribe(&bob).await;

        let room = alice
            .send_offer(
                &UserId::new("bob"),
                SessionDescription::offer("v=0"),
                CallType::Voice,
                "Alice",
                None,
                None,
            )
            .await
            .unwrap();

        let msg = bob_rx.recv().await.unwrap();
        match msg {
            SignalingMessage::Offer(offer) => {
                assert_eq!(offer.caller_id.as_str(), "alice");
                assert_eq!(offer.room_id, room);
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_prior_inbox() {
        let broker = InMemoryBroker::new();
        let alice = make_channel(&broker, "alice");
        let bob = make_channel(&broker, "bob");

        let mut first_rx = subscribe(&bob).await;
        let mut second_rx = subscribe(&bob).await;

        alice
            .send_call_state(&UserId::new("bob"), StateEventKind::Ended, RoomId::new("r"))
            .await
            .unwrap();

        let msg = second_rx.recv().await.unwrap();
        assert!(matches!(msg, SignalingMessage::StateEvent(_)));

        // old subscription was closed; its handler sees end-of-stream
        assert!(first_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped() {
        let broker = InMemoryBroker::new();
        let bob = make_channel(&broker, "bob");
        let mut bob_rx = subscribe(&bob).await;

        let raw = broker.open_channel("calls:bob").await.unwrap();
        raw.send("bogus_event", serde_json::json!({})).await.unwrap();
        raw.send("call_state", serde_json::json!({"unexpected": true}))
            .await
            .unwrap();

        let alice = make_channel(&broker, "alice");
        alice
            .send_call_state(&UserId::new("bob"), StateEventKind::Busy, RoomId::new("r"))
            .await
            .unwrap();

        // only the well-formed message comes through
        let msg = bob_rx.recv().await.unwrap();
        assert!(matches!(
            msg,
            SignalingMessage::StateEvent(CallStateEvent {
                event: StateEventKind::Busy,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_transient_channels_torn_down_after_grace() {
        let broker = InMemoryBroker::new();
        let alice = make_channel(&broker, "alice");

        alice
            .send_call_state(&UserId::new("bob"), StateEventKind::Ended, RoomId::new("r"))
            .await
            .unwrap();
        assert_eq!(alice.teardowns.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(alice.teardowns.len(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let broker = InMemoryBroker::new();
        let alice = make_channel(&broker, "alice");
        let _rx = subscribe(&alice).await;

        alice
            .send_call_state(&UserId::new("bob"), StateEventKind::Ended, RoomId::new("r"))
            .await
            .unwrap();

        alice.cleanup().await;
        alice.cleanup().await;
        assert_eq!(alice.teardowns.len(), 0);
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_best_effort() {
        let broker = InMemoryBroker::new();
        let alice = make_channel(&broker, "alice");

        // nobody listening on bob's inbox; delivery is a no-op, not an error
        alice
            .send_ice_candidate(
                &UserId::new("bob"),
                IceCandidate::new("candidate:1"),
                RoomId::new("r"),
            )
            .await
            .unwrap();
    }
}
