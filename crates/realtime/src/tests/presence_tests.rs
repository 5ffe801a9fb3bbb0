use super::*;
use shared::{
    domain::{ConnectionId, ConversationKind, ParticipantRole},
    protocol::ServerEvent,
};
use storage::direct_key;
use tokio::sync::mpsc;

struct Harness {
    storage: Storage,
    registry: Arc<SessionRegistry>,
    tracker: PresenceTracker,
    alice: UserId,
    bob: UserId,
}

async fn harness(debounce: Duration) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("alice").user_id;
    let bob = storage.create_user("bob").await.expect("bob").user_id;
    let key = direct_key(alice, bob);
    storage
        .create_conversation(
            ConversationKind::Direct,
            None,
            Some(&key),
            &[
                (alice, ParticipantRole::Owner),
                (bob, ParticipantRole::Member),
            ],
        )
        .await
        .expect("conversation");

    let cache = EphemeralCache::with_defaults();
    let registry = Arc::new(SessionRegistry::new());
    let dispatcher = Dispatcher::new(registry.clone(), storage.clone(), cache.clone());
    let tracker = PresenceTracker::new(
        storage.clone(),
        cache,
        dispatcher,
        registry.clone(),
        debounce,
    );
    Harness {
        storage,
        registry,
        tracker,
        alice,
        bob,
    }
}

fn attach(
    registry: &SessionRegistry,
    user: UserId,
) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = ConnectionId::generate();
    registry.register(user, connection, tx);
    (connection, rx)
}

fn status_events(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<(UserId, UserStatus)> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ServerEvent::UserStatus { user_id, status } = event {
            seen.push((user_id, status));
        }
    }
    seen
}

#[tokio::test]
async fn offline_commits_after_quiet_window() {
    let h = harness(Duration::from_millis(100)).await;
    let (_, mut bob_rx) = attach(&h.registry, h.bob);
    let (alice_conn, _alice_rx) = attach(&h.registry, h.alice);

    h.tracker.mark_online(h.alice).await;
    assert_eq!(status_events(&mut bob_rx), vec![(h.alice, UserStatus::Online)]);

    let (user, remaining) = h.registry.unregister(alice_conn).expect("registered");
    h.tracker.handle_disconnect(user, remaining);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(h.tracker.status_of(h.alice), UserStatus::Offline);
    assert_eq!(status_events(&mut bob_rx), vec![(h.alice, UserStatus::Offline)]);
    let profile = h
        .storage
        .user_profile(h.alice)
        .await
        .expect("profile")
        .expect("exists");
    assert_eq!(profile.status, UserStatus::Offline);
}

#[tokio::test]
async fn reconnect_within_window_suppresses_offline() {
    let h = harness(Duration::from_millis(200)).await;
    let (_, mut bob_rx) = attach(&h.registry, h.bob);
    let (alice_conn, _alice_rx) = attach(&h.registry, h.alice);
    h.tracker.mark_online(h.alice).await;
    status_events(&mut bob_rx);

    let (user, remaining) = h.registry.unregister(alice_conn).expect("registered");
    h.tracker.handle_disconnect(user, remaining);
    // Page reload: a new session arrives before the window elapses.
    let (_new_conn, _new_rx) = attach(&h.registry, h.alice);
    h.tracker.mark_online(h.alice).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.tracker.status_of(h.alice), UserStatus::Online);
    assert!(
        status_events(&mut bob_rx).is_empty(),
        "a reload inside the window must not flap user:status"
    );
}

#[tokio::test]
async fn remaining_session_keeps_user_online() {
    let h = harness(Duration::from_millis(100)).await;
    let (first, _rx1) = attach(&h.registry, h.alice);
    let (_second, _rx2) = attach(&h.registry, h.alice);
    h.tracker.mark_online(h.alice).await;

    let (user, remaining) = h.registry.unregister(first).expect("registered");
    assert_eq!(remaining, 1);
    h.tracker.handle_disconnect(user, remaining);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(h.tracker.status_of(h.alice), UserStatus::Online);
}

#[tokio::test]
async fn explicit_status_change_broadcasts_once() {
    let h = harness(DEFAULT_DEBOUNCE).await;
    let (_, mut bob_rx) = attach(&h.registry, h.bob);

    h.tracker.set_status(h.alice, UserStatus::Away).await;
    h.tracker.set_status(h.alice, UserStatus::Away).await;

    assert_eq!(h.tracker.status_of(h.alice), UserStatus::Away);
    assert_eq!(status_events(&mut bob_rx), vec![(h.alice, UserStatus::Away)]);
}

#[tokio::test]
async fn unknown_user_defaults_to_offline() {
    let h = harness(DEFAULT_DEBOUNCE).await;
    assert_eq!(h.tracker.status_of(UserId::generate()), UserStatus::Offline);
}
