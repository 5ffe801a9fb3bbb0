use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    error::ChatError,
    protocol::{MessagePayload, SendMessageRequest, ServerEvent},
};
use storage::Storage;
use tracing::warn;

use crate::{
    cache::EphemeralCache,
    conversations::{persistence, ConversationService},
    dispatch::Dispatcher,
};

/// End-to-end message path: validate, persist, cache, fan out, acknowledge.
///
/// The order is load-bearing: a message is broadcast only after it is
/// durably recorded, so recipients can never see a message that would
/// vanish on reload.
#[derive(Clone)]
pub struct MessagePipeline {
    storage: Storage,
    cache: EphemeralCache,
    dispatcher: Dispatcher,
    conversations: ConversationService,
}

impl MessagePipeline {
    pub fn new(
        storage: Storage,
        cache: EphemeralCache,
        dispatcher: Dispatcher,
        conversations: ConversationService,
    ) -> Self {
        Self {
            storage,
            cache,
            dispatcher,
            conversations,
        }
    }

    pub async fn send_message(
        &self,
        sender_id: UserId,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, ChatError> {
        if request.content.trim().is_empty() {
            return Err(ChatError::ValidationFailed("content cannot be empty".into()));
        }

        let conversation_id = self.resolve_target(sender_id, &request).await?;

        // Server clock is authoritative; the client never supplies the
        // timestamp or the id.
        let mut message = MessagePayload {
            id: MessageId::generate(),
            conversation_id,
            sender_id,
            content: request.content,
            kind: request.kind,
            status: MessageStatus::Sending,
            timestamp: Utc::now(),
            metadata: request.metadata,
        };

        if let Err(error) = self.storage.insert_message(&message).await {
            // Not durable: no cache write, no broadcast.
            return Err(ChatError::PersistenceFailed(error.to_string()));
        }

        match self
            .storage
            .update_message_status(message.id, MessageStatus::Sent)
            .await
        {
            Ok(_) => message.status = MessageStatus::Sent,
            // The ack must reflect what the store recorded, so the status
            // stays at the durable value.
            Err(error) => {
                warn!(message_id = %message.id, %error, "sent-status promotion failed; message remains durable");
            }
        }

        if let Err(error) = self
            .storage
            .record_message_arrival(conversation_id, message.id, sender_id, message.timestamp)
            .await
        {
            warn!(%conversation_id, %error, "conversation bookkeeping update failed");
        }

        // Write-through only after durable success.
        self.cache.put_message(&message);
        self.refresh_cached_conversation(conversation_id, message.id, message.timestamp);

        // The message is durable; a fan-out failure must not make the
        // caller retry and duplicate it.
        if let Err(error) = self
            .dispatcher
            .broadcast_to_conversation(
                conversation_id,
                &ServerEvent::MessageNew(message.clone()),
                Some(sender_id),
            )
            .await
        {
            warn!(%conversation_id, %error, "message fan-out failed; recipients catch up on re-fetch");
        }

        Ok(message)
    }

    /// Recent messages, newest first. Cache-first when no cursor is given;
    /// a partial cache never short-changes the caller: the remainder comes
    /// from the durable store and the merged result is deduplicated.
    pub async fn get_messages(
        &self,
        requester: UserId,
        conversation_id: ConversationId,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>, ChatError> {
        self.require_participant(conversation_id, requester).await?;

        if before.is_none() {
            let cached = self.cache.recent_messages(conversation_id, limit);
            if cached.len() == limit {
                return Ok(cached);
            }
        }

        let stored = self
            .storage
            .list_messages(conversation_id, limit as u32, before)
            .await
            .map_err(persistence)?;

        let mut merged = if before.is_none() {
            self.cache.recent_messages(conversation_id, limit)
        } else {
            Vec::new()
        };
        for message in stored {
            if !merged.iter().any(|m| m.id == message.id) {
                merged.push(message);
            }
        }
        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        merged.truncate(limit);

        // Repopulate only with the true head of the conversation. Caching a
        // cursor page would let a later first-page read trust stale entries
        // without consulting the store.
        if before.is_none() {
            for message in &merged {
                self.cache.put_message(message);
            }
        }
        Ok(merged)
    }

    /// Only the original sender may delete a message.
    pub async fn delete_message(
        &self,
        message_id: MessageId,
        requester: UserId,
    ) -> Result<(), ChatError> {
        let message = self
            .storage
            .message(message_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ChatError::NotFound("message not found".into()))?;
        if message.sender_id != requester {
            return Err(ChatError::Unauthorized(
                "only the sender may delete a message".into(),
            ));
        }

        self.storage
            .delete_message(message_id)
            .await
            .map_err(persistence)?;
        self.cache
            .invalidate_message(message.conversation_id, message_id);

        self.dispatcher
            .broadcast_to_conversation(
                message.conversation_id,
                &ServerEvent::MessageDeleted {
                    message_id,
                    conversation_id: message.conversation_id,
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Marks messages as read by `reader`. Read implies delivered; the
    /// monotonic guard in storage makes backward attempts a no-op.
    pub async fn mark_read(
        &self,
        reader: UserId,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), ChatError> {
        self.require_participant(conversation_id, reader).await?;

        // Membership grants read receipts for this conversation only; ids
        // pointing elsewhere are dropped, not advanced.
        let mut confirmed = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let Some(message) = self
                .storage
                .message(*message_id)
                .await
                .map_err(persistence)?
            else {
                continue;
            };
            if message.conversation_id != conversation_id {
                continue;
            }
            self.storage
                .update_message_status(*message_id, MessageStatus::Read)
                .await
                .map_err(persistence)?;
            if let Some(mut cached) = self.cache.message(*message_id) {
                cached.status = MessageStatus::Read;
                self.cache.put_message(&cached);
            }
            confirmed.push(*message_id);
        }

        let read_at = Utc::now();
        self.storage
            .reset_unread(conversation_id, reader, read_at)
            .await
            .map_err(persistence)?;

        self.dispatcher
            .broadcast_to_conversation(
                conversation_id,
                &ServerEvent::MessageReadAck {
                    conversation_id,
                    message_ids: confirmed,
                    read_by: reader,
                    timestamp: read_at,
                },
                None,
            )
            .await
    }

    /// Gateway receipt acknowledgement; promotes to `delivered` unless the
    /// message already progressed further.
    pub async fn mark_delivered(&self, message_ids: &[MessageId]) -> Result<(), ChatError> {
        for message_id in message_ids {
            self.storage
                .update_message_status(*message_id, MessageStatus::Delivered)
                .await
                .map_err(persistence)?;
            if let Some(mut cached) = self.cache.message(*message_id) {
                if cached.status.can_advance_to(MessageStatus::Delivered) {
                    cached.status = MessageStatus::Delivered;
                    self.cache.put_message(&cached);
                }
            }
        }
        Ok(())
    }

    async fn resolve_target(
        &self,
        sender_id: UserId,
        request: &SendMessageRequest,
    ) -> Result<ConversationId, ChatError> {
        if let Some(conversation_id) = request.conversation_id {
            self.require_participant(conversation_id, sender_id).await?;
            return Ok(conversation_id);
        }
        if let Some(receiver_id) = request.receiver_id {
            self.storage
                .user_profile(receiver_id)
                .await
                .map_err(persistence)?
                .ok_or_else(|| ChatError::NotFound("receiver not found".into()))?;
            return self.conversations.ensure_direct(sender_id, receiver_id).await;
        }
        Err(ChatError::ValidationFailed(
            "conversationId or receiverId is required".into(),
        ))
    }

    async fn require_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ChatError> {
        let conversation = self
            .storage
            .conversation(conversation_id)
            .await
            .map_err(persistence)?;
        if conversation.is_none() {
            return Err(ChatError::NotFound("conversation not found".into()));
        }
        if !self
            .conversations
            .is_participant(conversation_id, user_id)
            .await?
        {
            return Err(ChatError::Unauthorized(
                "not a participant of this conversation".into(),
            ));
        }
        Ok(())
    }

    /// Best-effort cache bump so a cached conversation reflects its new
    /// last message without a durable round trip.
    fn refresh_cached_conversation(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) {
        if let Some(mut entry) = self.cache.conversation(conversation_id) {
            entry.conversation.last_message_id = Some(message_id);
            entry.conversation.updated_at = at;
            self.cache.put_conversation(entry);
        }
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
