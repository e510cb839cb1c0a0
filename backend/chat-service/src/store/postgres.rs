use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Message};

use super::{ConversationStore, UnreadUpdate};

/// Postgres adapter. Order keys come from `conversations.last_seq`, bumped
/// inside the append transaction; the row-level lock taken by that UPDATE is
/// what makes key assignment atomic under concurrent appends.
pub struct PostgresStore {
    db: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| AppError::StartServer(format!("db connect: {e}")))?;
        Ok(Self { db })
    }

    /// Idempotent embedded schema setup.
    pub async fn run_migrations(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id UUID PRIMARY KEY,
                participant_a UUID NOT NULL,
                participant_b UUID NOT NULL,
                unread_a BIGINT NOT NULL DEFAULT 0,
                unread_b BIGINT NOT NULL DEFAULT 0,
                last_seq BIGINT NOT NULL DEFAULT 0,
                last_message_id UUID,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT conversations_pair_ordered CHECK (participant_a < participant_b),
                CONSTRAINT conversations_pair_unique UNIQUE (participant_a, participant_b)
            )
            "#,
        )
        .execute(&self.db)
        .await
        .map_err(|e| AppError::StartServer(format!("migrate conversations: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id UUID PRIMARY KEY,
                conversation_id UUID NOT NULL REFERENCES conversations(id),
                sender_id UUID NOT NULL,
                content TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                is_read BOOLEAN NOT NULL DEFAULT FALSE,
                CONSTRAINT messages_order_unique UNIQUE (conversation_id, sequence)
            )
            "#,
        )
        .execute(&self.db)
        .await
        .map_err(|e| AppError::StartServer(format!("migrate messages: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq \
             ON messages (conversation_id, sequence DESC)",
        )
        .execute(&self.db)
        .await
        .map_err(|e| AppError::StartServer(format!("migrate index: {e}")))?;

        Ok(())
    }

    fn message_from_row(row: &PgRow) -> Message {
        Message {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            sender_id: row.get("sender_id"),
            content: row.get("content"),
            sequence: row.get("sequence"),
            created_at: row.get("created_at"),
            is_read: row.get("is_read"),
        }
    }

    async fn load_conversation_row(&self, row: &PgRow) -> AppResult<Conversation> {
        let last_message_id: Option<Uuid> = row.try_get("last_message_id").ok().flatten();
        let last_message = match last_message_id {
            Some(mid) => sqlx::query(
                "SELECT id, conversation_id, sender_id, content, sequence, created_at, is_read \
                 FROM messages WHERE id = $1",
            )
            .bind(mid)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| AppError::Storage(format!("load last message: {e}")))?
            .map(|r| Self::message_from_row(&r)),
            None => None,
        };

        Ok(Conversation {
            id: row.get("id"),
            participant_a: row.get("participant_a"),
            participant_b: row.get("participant_b"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_message,
            unread_a: row.get("unread_a"),
            unread_b: row.get("unread_b"),
        })
    }
}

#[async_trait]
impl ConversationStore for PostgresStore {
    async fn create_or_get_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        let (pa, pb) = Conversation::normalize_pair(a, b);
        sqlx::query(
            "INSERT INTO conversations (id, participant_a, participant_b) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (participant_a, participant_b) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(pa)
        .bind(pb)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::Storage(format!("insert conversation: {e}")))?;

        let row = sqlx::query(
            "SELECT * FROM conversations WHERE participant_a = $1 AND participant_b = $2",
        )
        .bind(pa)
        .bind(pb)
        .fetch_one(&self.db)
        .await
        .map_err(|e| AppError::Storage(format!("get conversation: {e}")))?;
        self.load_conversation_row(&row).await
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| AppError::Storage(format!("get conversation: {e}")))?
            .ok_or(AppError::NotFound)?;
        self.load_conversation_row(&row).await
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations \
             WHERE participant_a = $1 OR participant_b = $1 \
             ORDER BY updated_at DESC \
             LIMIT 100",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| AppError::Storage(format!("list conversations: {e}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.load_conversation_row(row).await?);
        }
        Ok(out)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| AppError::Storage(format!("tx: {e}")))?;

        let sequence: i64 = sqlx::query_scalar(
            "UPDATE conversations SET last_seq = last_seq + 1, updated_at = NOW() \
             WHERE id = $1 RETURNING last_seq",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("assign order key: {e}")))?
        .ok_or(AppError::NotFound)?;

        let id = Uuid::new_v4();
        let row = sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, content, sequence) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, conversation_id, sender_id, content, sequence, created_at, is_read",
        )
        .bind(id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(content)
        .bind(sequence)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Storage(format!("insert message: {e}")))?;

        sqlx::query("UPDATE conversations SET last_message_id = $1 WHERE id = $2")
            .bind(id)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Storage(format!("set last message: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Storage(format!("commit: {e}")))?;

        Ok(Self::message_from_row(&row))
    }

    async fn update_unread(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        update: UnreadUpdate,
    ) -> AppResult<()> {
        let sql = match update {
            UnreadUpdate::Increment => {
                "UPDATE conversations SET \
                   unread_a = unread_a + CASE WHEN participant_a = $2 THEN 1 ELSE 0 END, \
                   unread_b = unread_b + CASE WHEN participant_b = $2 THEN 1 ELSE 0 END \
                 WHERE id = $1 AND (participant_a = $2 OR participant_b = $2)"
            }
            UnreadUpdate::Reset => {
                "UPDATE conversations SET \
                   unread_a = CASE WHEN participant_a = $2 THEN 0 ELSE unread_a END, \
                   unread_b = CASE WHEN participant_b = $2 THEN 0 ELSE unread_b END \
                 WHERE id = $1 AND (participant_a = $2 OR participant_b = $2)"
            }
        };
        let result = sqlx::query(sql)
            .bind(conversation_id)
            .bind(user_id)
            .execute(&self.db)
            .await
            .map_err(|e| AppError::Storage(format!("update unread: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, content, sequence, created_at, is_read \
             FROM messages \
             WHERE conversation_id = $1 AND ($2::bigint IS NULL OR sequence < $2) \
             ORDER BY sequence DESC \
             LIMIT $3",
        )
        .bind(conversation_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(|e| AppError::Storage(format!("fetch messages: {e}")))?;
        Ok(rows.iter().map(Self::message_from_row).collect())
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, content, sequence, created_at, is_read \
             FROM messages \
             WHERE conversation_id = $1 AND sequence > $2 \
             ORDER BY sequence ASC \
             LIMIT $3",
        )
        .bind(conversation_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(|e| AppError::Storage(format!("messages after: {e}")))?;
        Ok(rows.iter().map(Self::message_from_row).collect())
    }

    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = TRUE \
             WHERE conversation_id = $1 AND sender_id <> $2 \
               AND is_read = FALSE AND created_at <= $3",
        )
        .bind(conversation_id)
        .bind(reader_id)
        .bind(up_to)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::Storage(format!("mark read: {e}")))?;
        Ok(result.rows_affected())
    }
}
