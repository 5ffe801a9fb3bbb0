use super::*;
use chrono::Duration as ChronoDuration;
use shared::{
    domain::{ConversationKind, MessageKind, MessageStatus, ParticipantRole},
    protocol::MessagePayload,
};
use std::time::Duration;

fn conversation_entry(conversation_id: ConversationId) -> ConversationEntry {
    let user = UserId::generate();
    ConversationEntry {
        conversation: StoredConversation {
            conversation_id,
            kind: ConversationKind::Direct,
            title: None,
            last_message_id: None,
            updated_at: Utc::now(),
        },
        participants: vec![Participant {
            user_id: user,
            role: ParticipantRole::Owner,
            joined_at: Utc::now(),
            last_read_at: None,
            unread_count: 0,
        }],
    }
}

fn message(conversation_id: ConversationId, timestamp: DateTime<Utc>) -> MessagePayload {
    MessagePayload {
        id: MessageId::generate(),
        conversation_id,
        sender_id: UserId::generate(),
        content: "hi".into(),
        kind: MessageKind::Text,
        status: MessageStatus::Sent,
        timestamp,
        metadata: None,
    }
}

#[tokio::test(start_paused = true)]
async fn expired_conversation_is_a_miss() {
    let cache = EphemeralCache::new(Duration::from_secs(60), Duration::from_secs(60));
    let conversation_id = ConversationId::generate();
    cache.put_conversation(conversation_entry(conversation_id));

    assert!(cache.conversation(conversation_id).is_some());
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(cache.conversation(conversation_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn recent_messages_are_newest_first_and_capped() {
    let cache = EphemeralCache::with_defaults();
    let conversation_id = ConversationId::generate();
    let base = Utc::now();
    let mut ids = Vec::new();
    for i in 0..5 {
        let m = message(conversation_id, base + ChronoDuration::seconds(i));
        ids.push(m.id);
        cache.put_message(&m);
    }

    let recent = cache.recent_messages(conversation_id, 3);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].id, ids[4]);
    assert_eq!(recent[1].id, ids[3]);
    assert_eq!(recent[2].id, ids[2]);
}

#[tokio::test(start_paused = true)]
async fn expired_messages_drop_out_of_recent() {
    let cache = EphemeralCache::new(Duration::from_secs(3600), Duration::from_secs(10));
    let conversation_id = ConversationId::generate();
    let old = message(conversation_id, Utc::now());
    cache.put_message(&old);

    tokio::time::advance(Duration::from_secs(11)).await;
    let fresh = message(conversation_id, Utc::now());
    cache.put_message(&fresh);

    let recent = cache.recent_messages(conversation_id, 10);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, fresh.id);
    assert!(cache.message(old.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn invalidating_a_message_removes_it_from_the_index() {
    let cache = EphemeralCache::with_defaults();
    let conversation_id = ConversationId::generate();
    let m = message(conversation_id, Utc::now());
    cache.put_message(&m);

    cache.invalidate_message(conversation_id, m.id);
    assert!(cache.message(m.id).is_none());
    assert!(cache.recent_messages(conversation_id, 10).is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalidating_a_conversation_drops_its_messages() {
    let cache = EphemeralCache::with_defaults();
    let conversation_id = ConversationId::generate();
    cache.put_conversation(conversation_entry(conversation_id));
    let m = message(conversation_id, Utc::now());
    cache.put_message(&m);

    cache.invalidate_conversation(conversation_id);
    assert!(cache.conversation(conversation_id).is_none());
    assert!(cache.message(m.id).is_none());
    assert!(cache.recent_messages(conversation_id, 10).is_empty());
}

#[tokio::test(start_paused = true)]
async fn user_status_mirror_expires() {
    let cache = EphemeralCache::with_defaults();
    let user = UserId::generate();
    cache.put_user_status(user, UserStatus::Online, Utc::now());
    assert_eq!(
        cache.user_status(user).map(|(status, _)| status),
        Some(UserStatus::Online)
    );

    tokio::time::advance(DEFAULT_USER_TTL + Duration::from_secs(1)).await;
    assert!(cache.user_status(user).is_none());
}

#[tokio::test(start_paused = true)]
async fn sweep_reclaims_expired_entries() {
    let cache = EphemeralCache::new(Duration::from_secs(5), Duration::from_secs(5));
    let conversation_id = ConversationId::generate();
    cache.put_conversation(conversation_entry(conversation_id));
    cache.put_message(&message(conversation_id, Utc::now()));

    tokio::time::advance(Duration::from_secs(6)).await;
    cache.sweep();

    assert!(cache.conversation(conversation_id).is_none());
    assert!(cache.recent_messages(conversation_id, 10).is_empty());
}
