//! Two-party call flow tests over the loopback broker.
//!
//! Each test wires two managers to one in-memory broker and a fake
//! media engine per party, then drives the protocol end to end the way
//! the platform would.

use std::sync::Arc;
use std::time::Duration;

use peerwave::media::fake::FakeMediaEngine;
use peerwave::{
    CallLogStatus, CallManager, CallManagerConfig, CallPhase, CallSnapshot, CallType,
    InMemoryBroker, InMemoryCallLog, LocalIdentity, NoopNotifier, PeerConnectionState,
    PeerProfile,
};
use tokio::sync::watch;

fn test_config() -> CallManagerConfig {
    CallManagerConfig {
        setup_timeout: Duration::from_millis(300),
        missed_call_timeout: Duration::from_millis(300),
        reset_grace: Duration::from_millis(120),
        signaling_grace: Duration::from_millis(20),
    }
}

struct Party {
    manager: Arc<CallManager>,
    engine: Arc<FakeMediaEngine>,
    call_log: Arc<InMemoryCallLog>,
    state: watch::Receiver<CallSnapshot>,
}

async fn make_party(name: &str, broker: &Arc<InMemoryBroker>) -> Party {
    make_party_with_config(name, broker, test_config()).await
}

async fn make_party_with_config(
    name: &str,
    broker: &Arc<InMemoryBroker>,
    config: CallManagerConfig,
) -> Party {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = FakeMediaEngine::new();
    let call_log = InMemoryCallLog::new();
    let manager = CallManager::new(
        LocalIdentity::new(name, name.to_uppercase()),
        config,
        engine.clone(),
        broker.clone(),
        call_log.clone(),
        Arc::new(NoopNotifier),
    );
    manager.connect().await.unwrap();
    let state = manager.state();
    Party {
        manager,
        engine,
        call_log,
        state,
    }
}

async fn wait_for_phase(state: &mut watch::Receiver<CallSnapshot>, phase: CallPhase) {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if state.borrow().phase == phase {
                return;
            }
            state.changed().await.expect("manager dropped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for phase {phase}"));
}

#[tokio::test]
async fn test_voice_call_happy_path() {
    let broker = InMemoryBroker::new();
    let mut alice = make_party("alice", &broker).await;
    let mut bob = make_party("bob", &broker).await;

    let room = alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    assert_eq!(alice.state.borrow().phase, CallPhase::OutgoingCalling);

    // bob's side rings with the caller snapshot from the offer
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;
    {
        let snapshot = bob.state.borrow().clone();
        let call = snapshot.call.unwrap();
        assert_eq!(call.room_id, room);
        assert_eq!(call.peer.display_name, "ALICE");
        assert!(!call.is_outgoing);
    }

    bob.manager.accept_call().await.unwrap();
    wait_for_phase(&mut bob.state, CallPhase::Connecting).await;
    wait_for_phase(&mut alice.state, CallPhase::Connecting).await;

    // the platform reports both transports connected
    alice
        .engine
        .last_connection()
        .unwrap()
        .emit_state(PeerConnectionState::Connected)
        .await;
    bob.engine
        .last_connection()
        .unwrap()
        .emit_state(PeerConnectionState::Connected)
        .await;

    wait_for_phase(&mut alice.state, CallPhase::InCall).await;
    wait_for_phase(&mut bob.state, CallPhase::InCall).await;
    assert!(alice.state.borrow().call.as_ref().unwrap().start_time.is_some());
    assert!(bob.state.borrow().call.as_ref().unwrap().start_time.is_some());

    // the duration counter runs while in call
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if alice.state.borrow().duration_secs >= 1 {
                return;
            }
            alice.state.changed().await.unwrap();
        }
    })
    .await
    .expect("duration counter never ticked");

    alice.manager.end_call().await.unwrap();
    wait_for_phase(&mut alice.state, CallPhase::CallEnded).await;
    wait_for_phase(&mut bob.state, CallPhase::CallEnded).await;

    // both sides auto-return to idle after the grace delay
    wait_for_phase(&mut alice.state, CallPhase::Idle).await;
    wait_for_phase(&mut bob.state, CallPhase::Idle).await;

    // only the caller kept a log, finalized with a duration
    let alice_records = alice.call_log.records().await;
    assert_eq!(alice_records.len(), 1);
    assert_eq!(alice_records[0].status, Some(CallLogStatus::Completed));
    assert!(alice_records[0].duration_secs.is_some());
    assert!(bob.call_log.records().await.is_empty());
}

#[tokio::test]
async fn test_reject_flow() {
    let broker = InMemoryBroker::new();
    let mut alice = make_party("alice", &broker).await;
    let mut bob = make_party("bob", &broker).await;

    alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Video)
        .await
        .unwrap();
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;

    bob.manager.reject_call().await.unwrap();

    // receiver resets straight to idle, caller shows rejected then idles
    wait_for_phase(&mut bob.state, CallPhase::Idle).await;
    wait_for_phase(&mut alice.state, CallPhase::Rejected).await;
    wait_for_phase(&mut alice.state, CallPhase::Idle).await;

    let records = alice.call_log.records().await;
    assert_eq!(records[0].status, Some(CallLogStatus::Rejected));
}

#[tokio::test]
async fn test_busy_when_receiver_already_ringing() {
    let broker = InMemoryBroker::new();
    let mut alice = make_party("alice", &broker).await;
    let mut bob = make_party("bob", &broker).await;
    let mut carol = make_party("carol", &broker).await;

    alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;

    carol
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();

    // carol is turned away, bob keeps ringing for alice
    wait_for_phase(&mut carol.state, CallPhase::CallFailed).await;
    assert_eq!(
        carol.state.borrow().error_message.as_deref(),
        Some("User is busy")
    );
    assert_eq!(bob.state.borrow().phase, CallPhase::IncomingRinging);
    assert_eq!(
        bob.state.borrow().call.as_ref().unwrap().peer.display_name,
        "ALICE"
    );
}

#[tokio::test]
async fn test_unanswered_call_times_out_on_both_sides() {
    let broker = InMemoryBroker::new();
    // the caller's setup timer fires well before the receiver's
    // missed-call timer, so the receiver learns about the timeout from
    // the caller's state-event
    let mut alice = make_party_with_config(
        "alice",
        &broker,
        CallManagerConfig {
            setup_timeout: Duration::from_millis(200),
            ..test_config()
        },
    )
    .await;
    let mut bob = make_party_with_config(
        "bob",
        &broker,
        CallManagerConfig {
            missed_call_timeout: Duration::from_millis(1500),
            ..test_config()
        },
    )
    .await;

    alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;

    // nobody accepts; the caller times out and its state-event moves the
    // receiver to missed before the receiver's own timer fires
    wait_for_phase(&mut alice.state, CallPhase::CallFailed).await;
    wait_for_phase(&mut bob.state, CallPhase::Missed).await;

    wait_for_phase(&mut alice.state, CallPhase::Idle).await;
    wait_for_phase(&mut bob.state, CallPhase::Idle).await;
}

#[tokio::test]
async fn test_candidates_relayed_between_parties() {
    let broker = InMemoryBroker::new();
    let mut alice = make_party("alice", &broker).await;
    let mut bob = make_party("bob", &broker).await;

    alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;
    bob.manager.accept_call().await.unwrap();
    wait_for_phase(&mut alice.state, CallPhase::Connecting).await;

    // candidates discovered on bob's side land on alice's connection
    let bob_conn = bob.engine.last_connection().unwrap();
    bob_conn
        .emit_candidate(peerwave::IceCandidate::new("candidate:bob-1"))
        .await;
    bob_conn
        .emit_candidate(peerwave::IceCandidate::new("candidate:bob-2"))
        .await;

    let alice_conn = alice.engine.last_connection().unwrap();
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let applied = alice_conn.applied_candidates();
            if applied.len() >= 2 {
                assert_eq!(applied[0].candidate, "candidate:bob-1");
                assert_eq!(applied[1].candidate, "candidate:bob-2");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("candidates never reached the caller");
}

#[tokio::test]
async fn test_transport_failure_surfaces_connection_lost() {
    let broker = InMemoryBroker::new();
    let mut alice = make_party("alice", &broker).await;
    let mut bob = make_party("bob", &broker).await;

    alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;
    bob.manager.accept_call().await.unwrap();
    wait_for_phase(&mut alice.state, CallPhase::Connecting).await;

    alice
        .engine
        .last_connection()
        .unwrap()
        .emit_state(PeerConnectionState::Failed)
        .await;

    wait_for_phase(&mut alice.state, CallPhase::CallFailed).await;
    assert_eq!(
        alice.state.borrow().error_message.as_deref(),
        Some("Connection lost")
    );
}

#[tokio::test]
async fn test_caller_cancel_before_answer() {
    let broker = InMemoryBroker::new();
    let mut alice = make_party("alice", &broker).await;
    let mut bob = make_party("bob", &broker).await;

    alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;

    alice.manager.end_call().await.unwrap();
    wait_for_phase(&mut alice.state, CallPhase::CallEnded).await;
    // the receiver sees the cancelled attempt end too
    wait_for_phase(&mut bob.state, CallPhase::CallEnded).await;

    let records = alice.call_log.records().await;
    assert_eq!(records[0].status, Some(CallLogStatus::Cancelled));
}

#[tokio::test]
async fn test_fresh_start_call_cuts_grace_window_short() {
    let broker = InMemoryBroker::new();
    let mut alice = make_party("alice", &broker).await;
    let mut bob = make_party("bob", &broker).await;

    alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    wait_for_phase(&mut bob.state, CallPhase::IncomingRinging).await;
    bob.manager.reject_call().await.unwrap();
    wait_for_phase(&mut alice.state, CallPhase::Rejected).await;

    // immediately redial without waiting out the grace delay
    let room = alice
        .manager
        .start_call(PeerProfile::new("bob", "BOB"), CallType::Voice)
        .await
        .unwrap();
    let snapshot = alice.state.borrow().clone();
    assert_eq!(snapshot.phase, CallPhase::OutgoingCalling);
    assert_eq!(snapshot.call.unwrap().room_id, room);
}
