//! End-to-end call flow scenarios: two controllers sharing one store.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use unitynets_core::{
    CallController, CallPhase, CallSnapshot, CallStatus, CallType, ChatStore, ErrorReporter,
    MediaSource, Notice, RealtimeClient, RtcConfig, SignalChannel, SignalStore, SqliteStore,
    StaticIdentity, StaticMediaSource, UserProfile,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

async fn seeded_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for (id, name) in [("alice", "Alice"), ("bob", "Bob")] {
        store
            .upsert_user(UserProfile {
                user_id: id.to_string(),
                display_name: Some(name.to_string()),
                avatar_url: None,
                trust_score: Some(0.9),
            })
            .await
            .unwrap();
    }
    store
}

fn identity(current: &str) -> Arc<StaticIdentity> {
    let identity = StaticIdentity::new(current);
    for (id, name) in [("alice", "Alice"), ("bob", "Bob")] {
        identity.insert(UserProfile {
            user_id: id.to_string(),
            display_name: Some(name.to_string()),
            avatar_url: None,
            trust_score: Some(0.9),
        });
    }
    Arc::new(identity)
}

fn controller(
    user: &str,
    store: &Arc<SqliteStore>,
    media: Arc<dyn MediaSource>,
    ring_timeout_secs: Option<u64>,
) -> (CallController, mpsc::UnboundedReceiver<Notice>) {
    let signals: Arc<dyn SignalStore> = store.clone();
    let (reporter, notices) = ErrorReporter::channel();
    let config = RtcConfig {
        ring_timeout_secs,
        ..RtcConfig::default()
    };
    let controller = CallController::spawn(
        config,
        SignalChannel::new(signals),
        identity(user),
        media,
        reporter,
    );
    (controller, notices)
}

async fn wait_phase(rx: &mut watch::Receiver<CallSnapshot>, phase: CallPhase) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if rx.borrow().phase == phase {
                return;
            }
            rx.changed().await.expect("controller stopped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {phase:?}"));
}

async fn wait_outcome(rx: &mut watch::Receiver<CallSnapshot>, outcome: CallStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let snap = rx.borrow();
                if snap.phase == CallPhase::Idle && snap.last_outcome == Some(outcome) {
                    return;
                }
            }
            rx.changed().await.expect("controller stopped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never settled on {outcome:?}"));
}

/// Media source that counts how often devices were acquired.
struct CountingMedia {
    captures: AtomicUsize,
}

impl CountingMedia {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            captures: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MediaSource for CountingMedia {
    async fn capture(
        &self,
        call_type: CallType,
    ) -> unitynets_core::Result<Vec<Arc<TrackLocalStaticSample>>> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        StaticMediaSource.capture(call_type).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn video_call_connects_on_both_sides() {
    let store = seeded_store().await;
    let conversation = store.get_or_create_direct("alice", "bob").await.unwrap();

    let (alice, _an) = controller("alice", &store, Arc::new(StaticMediaSource), None);
    let (bob, _bn) = controller("bob", &store, Arc::new(StaticMediaSource), None);
    let mut alice_snap = alice.snapshot();
    let mut bob_snap = bob.snapshot();

    alice.start_call(&conversation, "bob", CallType::Video);
    wait_phase(&mut alice_snap, CallPhase::Calling).await;
    wait_phase(&mut bob_snap, CallPhase::Ringing).await;

    // The ringing side sees who is calling before any media is touched.
    let (signal_id, caller_name) = {
        let snap = bob_snap.borrow();
        let call = snap.call.as_ref().expect("ringing without call info");
        assert!(!call.outgoing);
        assert_eq!(call.call_type, CallType::Video);
        (
            call.signal_id.clone(),
            call.peer.display_name.clone(),
        )
    };
    assert_eq!(caller_name.as_deref(), Some("Alice"));

    bob.accept();
    wait_phase(&mut bob_snap, CallPhase::Connected).await;
    wait_phase(&mut alice_snap, CallPhase::Connected).await;

    let signals: Arc<dyn SignalStore> = store.clone();
    let row = signals.get_signal(&signal_id).await.unwrap();
    assert_eq!(row.status, CallStatus::Accepted);
    assert!(row.started_at.is_some());
    assert!(row.signal_data.offer.is_some());
    assert!(row.signal_data.answer.is_some());

    {
        let snap = alice_snap.borrow();
        let call = snap.call.as_ref().unwrap();
        assert!(call.outgoing);
        assert_eq!(call.signal_id, signal_id);
    }

    alice.hang_up();
    wait_outcome(&mut alice_snap, CallStatus::Ended).await;
    wait_outcome(&mut bob_snap, CallStatus::Ended).await;

    let row = signals.get_signal(&signal_id).await.unwrap();
    assert_eq!(row.status, CallStatus::Ended);
    assert!(row.ended_at.is_some());
    // started_at was stamped exactly once, on accept.
    assert!(row.started_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_call_never_acquires_callee_media() {
    let store = seeded_store().await;
    let conversation = store.get_or_create_direct("alice", "bob").await.unwrap();

    let bob_media = CountingMedia::new();
    let (alice, _an) = controller("alice", &store, Arc::new(StaticMediaSource), None);
    let (bob, _bn) = controller("bob", &store, bob_media.clone(), None);
    let mut alice_snap = alice.snapshot();
    let mut bob_snap = bob.snapshot();

    alice.start_call(&conversation, "bob", CallType::Voice);
    wait_phase(&mut bob_snap, CallPhase::Ringing).await;
    let signal_id = bob_snap.borrow().call.as_ref().unwrap().signal_id.clone();

    bob.reject();
    wait_outcome(&mut bob_snap, CallStatus::Rejected).await;
    wait_outcome(&mut alice_snap, CallStatus::Rejected).await;

    assert_eq!(bob_media.captures.load(Ordering::SeqCst), 0);

    let signals: Arc<dyn SignalStore> = store.clone();
    let row = signals.get_signal(&signal_id).await.unwrap();
    assert_eq!(row.status, CallStatus::Rejected);
    assert!(row.started_at.is_none());
    assert!(row.ended_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_cancel_resolves_as_missed() {
    let store = seeded_store().await;
    let conversation = store.get_or_create_direct("alice", "bob").await.unwrap();

    let (alice, _an) = controller("alice", &store, Arc::new(StaticMediaSource), None);
    let (bob, _bn) = controller("bob", &store, Arc::new(StaticMediaSource), None);
    let mut alice_snap = alice.snapshot();
    let mut bob_snap = bob.snapshot();

    alice.start_call(&conversation, "bob", CallType::Voice);
    wait_phase(&mut bob_snap, CallPhase::Ringing).await;

    alice.hang_up();
    wait_outcome(&mut alice_snap, CallStatus::Missed).await;
    wait_outcome(&mut bob_snap, CallStatus::Missed).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_while_busy_is_rejected() {
    let store = seeded_store().await;
    let conversation = store.get_or_create_direct("alice", "bob").await.unwrap();

    let (alice, mut alice_notices) = controller("alice", &store, Arc::new(StaticMediaSource), None);
    let mut alice_snap = alice.snapshot();

    alice.start_call(&conversation, "bob", CallType::Voice);
    wait_phase(&mut alice_snap, CallPhase::Calling).await;

    alice.start_call(&conversation, "bob", CallType::Voice);
    let notice = tokio::time::timeout(Duration::from_secs(5), alice_notices.recv())
        .await
        .expect("no busy notice")
        .unwrap();
    assert!(notice.message.contains("already in progress"));

    // The original attempt is unaffected.
    assert_eq!(alice_snap.borrow().phase, CallPhase::Calling);
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_call_times_out_as_missed() {
    let store = seeded_store().await;
    let conversation = store.get_or_create_direct("alice", "bob").await.unwrap();

    let (alice, _an) = controller("alice", &store, Arc::new(StaticMediaSource), Some(1));
    let (bob, _bn) = controller("bob", &store, Arc::new(StaticMediaSource), Some(30));
    let mut alice_snap = alice.snapshot();
    let mut bob_snap = bob.snapshot();

    alice.start_call(&conversation, "bob", CallType::Voice);
    wait_phase(&mut bob_snap, CallPhase::Ringing).await;

    // Nobody answers; the caller's timeout resolves the call as missed and
    // the callee observes the terminal update.
    wait_outcome(&mut alice_snap, CallStatus::Missed).await;
    wait_outcome(&mut bob_snap, CallStatus::Missed).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn realtime_client_wires_chat_and_calls_together() {
    let store = seeded_store().await;
    let signal_store: Arc<dyn SignalStore> = store.clone();
    let chat_store: Arc<dyn ChatStore> = store.clone();

    let (client, _notices) = RealtimeClient::new(
        RtcConfig::default(),
        signal_store,
        chat_store,
        identity("alice"),
        Arc::new(StaticMediaSource),
    );

    let conversation = client
        .conversations()
        .get_or_create_direct("bob")
        .await
        .unwrap();
    let stream = client.open_messages(&conversation).await.unwrap();

    let sent = stream
        .send(
            unitynets_core::MessageKind::Text,
            Some("hello bob".into()),
            serde_json::Value::Null,
            None,
        )
        .await
        .unwrap();
    assert_eq!(stream.messages().len(), 1);
    assert_eq!(stream.messages()[0].id, sent.id);

    let mut list = client.conversations().watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = list.borrow();
                if current
                    .first()
                    .map(|c| c.last_message.is_some())
                    .unwrap_or(false)
                {
                    return;
                }
            }
            list.changed().await.unwrap();
        }
    })
    .await
    .expect("conversation list never caught up");
}
