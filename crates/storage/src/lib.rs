use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};
use uuid::Uuid;

use shared::{
    domain::{
        ConversationId, ConversationKind, MessageId, MessageKind, MessageStatus, Participant,
        ParticipantRole, UserId, UserProfile, UserStatus,
    },
    protocol::MessagePayload,
};

/// Durable store over SQLite. Owns users, conversations, participants and
/// messages; the ephemeral cache in the realtime crate is only ever a
/// write-through shadow of what lives here.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical key identifying the unordered pair of a direct conversation.
pub fn direct_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database is private to its connection, so the pool
        // must not hand out more than one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id        TEXT PRIMARY KEY,
                username  TEXT NOT NULL UNIQUE,
                status    TEXT NOT NULL DEFAULT 'offline',
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id              TEXT PRIMARY KEY,
                kind            TEXT NOT NULL,
                title           TEXT,
                direct_key      TEXT UNIQUE,
                last_message_id TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure conversations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                conversation_id TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                role            TEXT NOT NULL,
                joined_at       TEXT NOT NULL,
                last_read_at    TEXT,
                unread_count    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure participants table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id       TEXT NOT NULL,
                content         TEXT NOT NULL,
                kind            TEXT NOT NULL,
                status          TEXT NOT NULL,
                metadata        TEXT,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
             ON messages (conversation_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure message index")?;

        Ok(())
    }

    // --- users ---

    pub async fn create_user(&self, username: &str) -> Result<UserProfile> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO users (id, username, status, last_seen) VALUES (?, ?, 'offline', ?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id, username, status, last_seen",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(username)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row_to_profile(&row)
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT id, username, status, last_seen FROM users WHERE id = ?")
            .bind(user_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_profile(&r)).transpose()
    }

    pub async fn update_user_status(
        &self,
        user_id: UserId,
        status: UserStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET status = ?, last_seen = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(last_seen)
            .bind(user_id.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- conversations ---

    /// Creates a conversation with its participant rows. For direct
    /// conversations the unique `direct_key` makes the pair canonical: a
    /// second create for the same pair returns the existing conversation.
    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        title: Option<&str>,
        direct_key: Option<&str>,
        participants: &[(UserId, ParticipantRole)],
    ) -> Result<(ConversationId, bool)> {
        if let Some(key) = direct_key {
            if let Some(existing) = self.find_direct_conversation(key).await? {
                return Ok((existing, false));
            }
        }

        let conversation_id = ConversationId::generate();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO conversations (id, kind, title, direct_key, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(direct_key) DO NOTHING",
        )
        .bind(conversation_id.0.to_string())
        .bind(kind.as_str())
        .bind(title)
        .bind(direct_key)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Lost the race against a concurrent create for the same pair.
            tx.rollback().await?;
            let key = direct_key.context("conflict without direct key")?;
            let existing = self
                .find_direct_conversation(key)
                .await?
                .context("conflicting direct conversation missing")?;
            return Ok((existing, false));
        }

        for (user_id, role) in participants {
            sqlx::query(
                "INSERT INTO participants (conversation_id, user_id, role, joined_at, unread_count)
                 VALUES (?, ?, ?, ?, 0)",
            )
            .bind(conversation_id.0.to_string())
            .bind(user_id.0.to_string())
            .bind(match role {
                ParticipantRole::Owner => "owner",
                ParticipantRole::Member => "member",
            })
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((conversation_id, true))
    }

    pub async fn find_direct_conversation(&self, key: &str) -> Result<Option<ConversationId>> {
        let row = sqlx::query("SELECT id FROM conversations WHERE direct_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_id(&r.get::<String, _>(0)).map(ConversationId))
            .transpose()
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT id, kind, title, last_message_id, updated_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_conversation(&r)).transpose()
    }

    pub async fn participants_for(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Participant>> {
        let rows = sqlx::query(
            "SELECT user_id, role, joined_at, last_read_at, unread_count
             FROM participants WHERE conversation_id = ?",
        )
        .bind(conversation_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_participant).collect()
    }

    pub async fn conversations_for_user(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.title, c.last_message_id, c.updated_at
             FROM conversations c
             INNER JOIN participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?
             ORDER BY c.updated_at DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_id.0.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_conversation).collect()
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0.to_string())
        .bind(user_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn participant_role(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ParticipantRole>> {
        let row = sqlx::query(
            "SELECT role FROM participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0.to_string())
        .bind(user_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| match r.get::<String, _>(0).as_str() {
            "owner" => ParticipantRole::Owner,
            _ => ParticipantRole::Member,
        }))
    }

    pub async fn conversation_ids_for_user(&self, user_id: UserId) -> Result<Vec<ConversationId>> {
        let rows = sqlx::query("SELECT conversation_id FROM participants WHERE user_id = ?")
            .bind(user_id.0.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| parse_id(&r.get::<String, _>(0)).map(ConversationId))
            .collect()
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.0.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM participants WHERE conversation_id = ?")
            .bind(conversation_id.0.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.0.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- messages ---

    pub async fn insert_message(&self, message: &MessagePayload) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, content, kind, status, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.0.to_string())
        .bind(message.conversation_id.0.to_string())
        .bind(message.sender_id.0.to_string())
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.status.as_str())
        .bind(message.metadata.as_ref().map(|m| m.to_string()))
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<MessagePayload>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, content, kind, status, metadata, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_message(&r)).transpose()
    }

    /// Messages in a conversation, newest first, optionally older than
    /// `before`.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>> {
        let rows = if let Some(before) = before {
            sqlx::query(
                "SELECT id, conversation_id, sender_id, content, kind, status, metadata, created_at
                 FROM messages
                 WHERE conversation_id = ? AND created_at < ?
                 ORDER BY created_at DESC
                 LIMIT ?",
            )
            .bind(conversation_id.0.to_string())
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, conversation_id, sender_id, content, kind, status, metadata, created_at
                 FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at DESC
                 LIMIT ?",
            )
            .bind(conversation_id.0.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(row_to_message).collect()
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    /// Advances a message's status. The rank guard in the WHERE clause makes
    /// backward transitions a no-op at the SQL level, so concurrent updates
    /// can never regress the ladder.
    pub async fn update_message_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET status = ?
             WHERE id = ?
               AND (CASE status
                    WHEN 'sending' THEN 0
                    WHEN 'sent' THEN 1
                    WHEN 'delivered' THEN 2
                    ELSE 3 END) < ?",
        )
        .bind(status.as_str())
        .bind(message_id.0.to_string())
        .bind(i64::from(status.rank()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Records a new last message and bumps every other participant's unread
    /// counter. The counter update is a relative increment so concurrent
    /// sends into the same conversation never lose updates.
    pub async fn record_message_arrival(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        arrived_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE conversations SET last_message_id = ?, updated_at = ? WHERE id = ?")
            .bind(message_id.0.to_string())
            .bind(arrived_at)
            .bind(conversation_id.0.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE participants SET unread_count = unread_count + 1
             WHERE conversation_id = ? AND user_id != ?",
        )
        .bind(conversation_id.0.to_string())
        .bind(sender_id.0.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn reset_unread(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE participants SET unread_count = 0, last_read_at = ?
             WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(read_at)
        .bind(conversation_id.0.to_string())
        .bind(user_id.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("malformed id in database: {raw}"))
}

fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<UserProfile> {
    let status_raw = row.get::<String, _>(2);
    Ok(UserProfile {
        user_id: UserId(parse_id(&row.get::<String, _>(0))?),
        username: row.get::<String, _>(1),
        status: UserStatus::parse(&status_raw)
            .with_context(|| format!("malformed user status: {status_raw}"))?,
        last_seen: row.get::<DateTime<Utc>, _>(3),
    })
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<StoredConversation> {
    Ok(StoredConversation {
        conversation_id: ConversationId(parse_id(&row.get::<String, _>(0))?),
        kind: match row.get::<String, _>(1).as_str() {
            "direct" => ConversationKind::Direct,
            _ => ConversationKind::Group,
        },
        title: row.get::<Option<String>, _>(2),
        last_message_id: row
            .get::<Option<String>, _>(3)
            .map(|raw| parse_id(&raw).map(MessageId))
            .transpose()?,
        updated_at: row.get::<DateTime<Utc>, _>(4),
    })
}

fn row_to_participant(row: &sqlx::sqlite::SqliteRow) -> Result<Participant> {
    Ok(Participant {
        user_id: UserId(parse_id(&row.get::<String, _>(0))?),
        role: match row.get::<String, _>(1).as_str() {
            "owner" => ParticipantRole::Owner,
            _ => ParticipantRole::Member,
        },
        joined_at: row.get::<DateTime<Utc>, _>(2),
        last_read_at: row.get::<Option<DateTime<Utc>>, _>(3),
        unread_count: row.get::<i64, _>(4),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<MessagePayload> {
    let kind_raw = row.get::<String, _>(4);
    let status_raw = row.get::<String, _>(5);
    Ok(MessagePayload {
        id: MessageId(parse_id(&row.get::<String, _>(0))?),
        conversation_id: ConversationId(parse_id(&row.get::<String, _>(1))?),
        sender_id: UserId(parse_id(&row.get::<String, _>(2))?),
        content: row.get::<String, _>(3),
        kind: MessageKind::parse(&kind_raw)
            .with_context(|| format!("malformed message kind: {kind_raw}"))?,
        status: MessageStatus::parse(&status_raw)
            .with_context(|| format!("malformed message status: {status_raw}"))?,
        metadata: row
            .get::<Option<String>, _>(6)
            .map(|raw| serde_json::from_str(&raw).context("malformed message metadata"))
            .transpose()?,
        timestamp: row.get::<DateTime<Utc>, _>(7),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for '{database_url}'")
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
