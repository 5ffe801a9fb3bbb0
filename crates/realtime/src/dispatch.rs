use shared::{
    domain::{ConversationId, UserId, UserStatus},
    error::ChatError,
    protocol::ServerEvent,
};
use std::sync::Arc;
use storage::Storage;
use tracing::{debug, warn};

use crate::{cache::EphemeralCache, session::SessionRegistry};

/// Routes outbound events to the live connections that should see them.
///
/// Delivery is a queue push per connection; each connection's writer task
/// drains its own queue, so one slow socket never blocks the rest of a
/// fan-out. Events for users with no live session are dropped; offline
/// recipients catch up by re-fetching on reconnect.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    storage: Storage,
    cache: EphemeralCache,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, storage: Storage, cache: EphemeralCache) -> Self {
        Self {
            registry,
            storage,
            cache,
        }
    }

    /// Pushes the event to every live session of a user. Returns how many
    /// connections accepted it.
    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let sessions = self.registry.sessions_for(user_id);
        if sessions.is_empty() {
            debug!(%user_id, "no live sessions, event dropped");
            return 0;
        }
        let mut delivered = 0;
        for (connection_id, sender) in sessions {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(%user_id, %connection_id, "connection queue closed mid-dispatch");
            }
        }
        delivered
    }

    /// Fans an event out to every participant of a conversation, optionally
    /// excluding one user (typically the sender, who gets an explicit ack
    /// instead of an echo).
    pub async fn broadcast_to_conversation(
        &self,
        conversation_id: ConversationId,
        event: &ServerEvent,
        exclude: Option<UserId>,
    ) -> Result<(), ChatError> {
        let participants = self.participant_ids(conversation_id).await?;
        for user_id in participants {
            if Some(user_id) == exclude {
                continue;
            }
            self.send_to_user(user_id, event);
        }
        Ok(())
    }

    /// Announces a user's status to everyone sharing a conversation with
    /// them. Participant sets are deduplicated so nobody sees the event
    /// twice per session.
    pub async fn broadcast_status(&self, user_id: UserId, status: UserStatus) {
        let event = ServerEvent::UserStatus { user_id, status };
        let conversations = match self.storage.conversation_ids_for_user(user_id).await {
            Ok(ids) => ids,
            Err(error) => {
                warn!(%user_id, %error, "status broadcast skipped: participant lookup failed");
                return;
            }
        };

        let mut notified = std::collections::HashSet::new();
        for conversation_id in conversations {
            let participants = match self.participant_ids(conversation_id).await {
                Ok(ids) => ids,
                Err(error) => {
                    warn!(%conversation_id, %error, "skipping conversation in status broadcast");
                    continue;
                }
            };
            for participant in participants {
                if notified.insert(participant) {
                    self.send_to_user(participant, &event);
                }
            }
        }
    }

    /// Participant ids for a conversation, cache-first with durable
    /// fallback.
    async fn participant_ids(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, ChatError> {
        if let Some(entry) = self.cache.conversation(conversation_id) {
            return Ok(entry.participants.iter().map(|p| p.user_id).collect());
        }
        let participants = self
            .storage
            .participants_for(conversation_id)
            .await
            .map_err(|e| ChatError::PersistenceFailed(e.to_string()))?;
        Ok(participants.iter().map(|p| p.user_id).collect())
    }
}
