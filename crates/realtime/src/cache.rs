use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use shared::{
    domain::{ConversationId, MessageId, Participant, UserId, UserStatus},
    protocol::MessagePayload,
};
use storage::StoredConversation;

/// Default retention for cached entries.
pub const DEFAULT_CONVERSATION_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(86_400);
pub const DEFAULT_USER_TTL: Duration = Duration::from_secs(3600);

/// Cached conversation plus its participant list, enough for fan-out and
/// membership checks without touching the durable store.
#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub conversation: StoredConversation,
    pub participants: Vec<Participant>,
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

struct CacheInner {
    conversations: DashMap<ConversationId, Expiring<ConversationEntry>>,
    messages: DashMap<MessageId, Expiring<MessagePayload>>,
    /// Per-conversation time-ordered index of cached message ids.
    message_index: DashMap<ConversationId, BTreeMap<(DateTime<Utc>, MessageId), Instant>>,
    user_status: DashMap<UserId, Expiring<(UserStatus, DateTime<Utc>)>>,
    conversation_ttl: Duration,
    message_ttl: Duration,
    user_ttl: Duration,
}

/// Write-through TTL cache over hot conversation and message state.
///
/// Strictly a performance layer: every read can miss, every write is
/// best-effort, and callers must fall back to the durable store on a miss.
/// Never the sole write path.
#[derive(Clone)]
pub struct EphemeralCache {
    inner: Arc<CacheInner>,
}

impl EphemeralCache {
    pub fn new(conversation_ttl: Duration, message_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                conversations: DashMap::new(),
                messages: DashMap::new(),
                message_index: DashMap::new(),
                user_status: DashMap::new(),
                conversation_ttl,
                message_ttl,
                user_ttl: DEFAULT_USER_TTL,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CONVERSATION_TTL, DEFAULT_MESSAGE_TTL)
    }

    // --- conversations ---

    pub fn put_conversation(&self, entry: ConversationEntry) {
        self.inner.conversations.insert(
            entry.conversation.conversation_id,
            Expiring {
                value: entry,
                expires_at: Instant::now() + self.inner.conversation_ttl,
            },
        );
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<ConversationEntry> {
        let entry = self.inner.conversations.get(&conversation_id)?;
        if !entry.live() {
            drop(entry);
            self.inner.conversations.remove(&conversation_id);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn invalidate_conversation(&self, conversation_id: ConversationId) {
        self.inner.conversations.remove(&conversation_id);
        if let Some((_, index)) = self.inner.message_index.remove(&conversation_id) {
            for (_, message_id) in index.into_keys() {
                self.inner.messages.remove(&message_id);
            }
        }
    }

    // --- messages ---

    pub fn put_message(&self, message: &MessagePayload) {
        let expires_at = Instant::now() + self.inner.message_ttl;
        self.inner.messages.insert(
            message.id,
            Expiring {
                value: message.clone(),
                expires_at,
            },
        );
        self.inner
            .message_index
            .entry(message.conversation_id)
            .or_default()
            .insert((message.timestamp, message.id), expires_at);
    }

    pub fn message(&self, message_id: MessageId) -> Option<MessagePayload> {
        let entry = self.inner.messages.get(&message_id)?;
        if !entry.live() {
            drop(entry);
            self.inner.messages.remove(&message_id);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Up to `limit` cached messages for a conversation, newest first. A
    /// result shorter than `limit` means the cache is partial and the caller
    /// must supplement from the durable store.
    pub fn recent_messages(&self, conversation_id: ConversationId, limit: usize) -> Vec<MessagePayload> {
        let Some(index) = self.inner.message_index.get(&conversation_id) else {
            return Vec::new();
        };
        let now = Instant::now();
        index
            .iter()
            .rev()
            .filter(|(_, expires_at)| now < **expires_at)
            .filter_map(|((_, message_id), _)| self.message(*message_id))
            .take(limit)
            .collect()
    }

    pub fn invalidate_message(&self, conversation_id: ConversationId, message_id: MessageId) {
        let timestamp = self
            .inner
            .messages
            .remove(&message_id)
            .map(|(_, entry)| entry.value.timestamp);
        if let Some(timestamp) = timestamp {
            if let Some(mut index) = self.inner.message_index.get_mut(&conversation_id) {
                index.remove(&(timestamp, message_id));
            }
        }
    }

    // --- user status mirror ---

    pub fn put_user_status(&self, user_id: UserId, status: UserStatus, last_seen: DateTime<Utc>) {
        self.inner.user_status.insert(
            user_id,
            Expiring {
                value: (status, last_seen),
                expires_at: Instant::now() + self.inner.user_ttl,
            },
        );
    }

    pub fn user_status(&self, user_id: UserId) -> Option<(UserStatus, DateTime<Utc>)> {
        let entry = self.inner.user_status.get(&user_id)?;
        if !entry.live() {
            drop(entry);
            self.inner.user_status.remove(&user_id);
            return None;
        }
        Some(entry.value)
    }

    /// Drops every expired entry. Reads already treat expired entries as
    /// misses; this reclaims the memory between reads.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner.conversations.retain(|_, entry| now < entry.expires_at);
        self.inner.messages.retain(|_, entry| now < entry.expires_at);
        self.inner.user_status.retain(|_, entry| now < entry.expires_at);
        self.inner.message_index.retain(|_, index| {
            index.retain(|_, expires_at| now < *expires_at);
            !index.is_empty()
        });
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
