use shared::{
    domain::{ConversationId, ConversationKind, ParticipantRole, UserId},
    error::ChatError,
    protocol::ConversationSummary,
};
use storage::{direct_key, Storage};
use tracing::debug;

use crate::cache::{ConversationEntry, EphemeralCache};

/// Conversation lifecycle: creation with participant validation, owner-only
/// deletion, cache-first reads.
#[derive(Clone)]
pub struct ConversationService {
    storage: Storage,
    cache: EphemeralCache,
}

#[derive(Debug, Clone)]
pub struct CreateConversationRequest {
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    pub title: Option<String>,
}

impl ConversationService {
    pub fn new(storage: Storage, cache: EphemeralCache) -> Self {
        Self { storage, cache }
    }

    /// Creates a conversation. For direct conversations the unordered user
    /// pair is canonical: a second create for the same pair returns the
    /// existing conversation instead of a duplicate.
    pub async fn create(
        &self,
        creator: UserId,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary, ChatError> {
        let mut participant_ids = request.participant_ids;
        if !participant_ids.contains(&creator) {
            participant_ids.insert(0, creator);
        }
        let mut seen = std::collections::HashSet::new();
        participant_ids.retain(|id| seen.insert(*id));

        match request.kind {
            ConversationKind::Direct => {
                if participant_ids.len() != 2 {
                    return Err(ChatError::ValidationFailed(
                        "direct conversation requires exactly two distinct participants".into(),
                    ));
                }
            }
            ConversationKind::Group => {
                if participant_ids.len() < 2 {
                    return Err(ChatError::ValidationFailed(
                        "group conversation requires at least two participants".into(),
                    ));
                }
            }
        }

        for user_id in &participant_ids {
            self.storage
                .user_profile(*user_id)
                .await
                .map_err(persistence)?
                .ok_or_else(|| ChatError::NotFound(format!("participant {user_id} not found")))?;
        }

        let key = match request.kind {
            ConversationKind::Direct => Some(direct_key(participant_ids[0], participant_ids[1])),
            ConversationKind::Group => None,
        };
        let participants: Vec<(UserId, ParticipantRole)> = participant_ids
            .iter()
            .map(|user_id| {
                let role = if *user_id == creator {
                    ParticipantRole::Owner
                } else {
                    ParticipantRole::Member
                };
                (*user_id, role)
            })
            .collect();

        let (conversation_id, created) = self
            .storage
            .create_conversation(
                request.kind,
                request.title.as_deref(),
                key.as_deref(),
                &participants,
            )
            .await
            .map_err(persistence)?;
        if !created {
            debug!(%conversation_id, "direct conversation already exists, returning it");
        }

        self.summary(conversation_id).await
    }

    /// Resolves (or creates) the direct conversation between two users.
    /// Used by the message pipeline's `receiverId` shortcut.
    pub async fn ensure_direct(
        &self,
        sender: UserId,
        receiver: UserId,
    ) -> Result<ConversationId, ChatError> {
        if sender == receiver {
            return Err(ChatError::ValidationFailed(
                "cannot open a direct conversation with yourself".into(),
            ));
        }
        let key = direct_key(sender, receiver);
        if let Some(existing) = self
            .storage
            .find_direct_conversation(&key)
            .await
            .map_err(persistence)?
        {
            return Ok(existing);
        }

        let summary = self
            .create(
                sender,
                CreateConversationRequest {
                    kind: ConversationKind::Direct,
                    participant_ids: vec![sender, receiver],
                    title: None,
                },
            )
            .await?;
        Ok(summary.id)
    }

    /// Cache-first conversation read with durable fallback and repopulate.
    pub async fn entry(&self, conversation_id: ConversationId) -> Result<ConversationEntry, ChatError> {
        if let Some(entry) = self.cache.conversation(conversation_id) {
            return Ok(entry);
        }

        let conversation = self
            .storage
            .conversation(conversation_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ChatError::NotFound("conversation not found".into()))?;
        let participants = self
            .storage
            .participants_for(conversation_id)
            .await
            .map_err(persistence)?;

        let entry = ConversationEntry {
            conversation,
            participants,
        };
        self.cache.put_conversation(entry.clone());
        Ok(entry)
    }

    pub async fn summary(&self, conversation_id: ConversationId) -> Result<ConversationSummary, ChatError> {
        let entry = self.entry(conversation_id).await?;
        let last_message = match entry.conversation.last_message_id {
            Some(message_id) => self.storage.message(message_id).await.map_err(persistence)?,
            None => None,
        };
        Ok(ConversationSummary {
            id: entry.conversation.conversation_id,
            kind: entry.conversation.kind,
            title: entry.conversation.title,
            participants: entry.participants,
            last_message,
            updated_at: entry.conversation.updated_at,
        })
    }

    pub async fn list_for_user(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = self
            .storage
            .conversations_for_user(user_id, limit, offset)
            .await
            .map_err(persistence)?;
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            summaries.push(self.summary(conversation.conversation_id).await?);
        }
        Ok(summaries)
    }

    /// Owner-only deletion; removes the durable record and invalidates the
    /// cached entry plus its message index.
    pub async fn delete(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
    ) -> Result<(), ChatError> {
        let role = self
            .storage
            .participant_role(conversation_id, requester)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ChatError::NotFound("conversation not found".into()))?;
        if role != ParticipantRole::Owner {
            return Err(ChatError::Unauthorized(
                "only the conversation owner may delete it".into(),
            ));
        }

        self.storage
            .delete_conversation(conversation_id)
            .await
            .map_err(persistence)?;
        self.cache.invalidate_conversation(conversation_id);
        Ok(())
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, ChatError> {
        if let Some(entry) = self.cache.conversation(conversation_id) {
            return Ok(entry.participants.iter().any(|p| p.user_id == user_id));
        }
        self.storage
            .is_participant(conversation_id, user_id)
            .await
            .map_err(persistence)
    }
}

pub(crate) fn persistence(error: anyhow::Error) -> ChatError {
    ChatError::PersistenceFailed(error.to_string())
}
