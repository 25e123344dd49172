use anyhow::Result;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::models::ChatMessage;
use crate::services::conversation::engine::{
    AssistantMessageDraft, TurnStore, TurnTransaction,
};

use super::models::SessionMeta;
use super::Repository;

#[async_trait]
impl TurnStore for Repository {
    async fn find_session(&self, session_id: Uuid, user_id: Uuid) -> Result<Option<SessionMeta>> {
        let session = sqlx::query_as::<_, SessionMeta>(
            r#"SELECT id, user_id, title, pinned, created_at, last_active_at
               FROM chat_sessions
               WHERE id = $1 AND user_id = $2"#,
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(session)
    }

    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
        // Window from the tail, then flip back to chronological order.
        let mut messages = sqlx::query_as::<_, ChatMessage>(
            r#"SELECT role, content
               FROM chat_messages
               WHERE session_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        messages.reverse();
        Ok(messages)
    }

    async fn begin_turn(&self) -> Result<Box<dyn TurnTransaction>> {
        let txn = self.pool.get_pool().begin().await?;
        Ok(Box::new(PgTurnTransaction { txn }))
    }
}

/// One turn's write set on a dedicated connection. Dropped without commit,
/// sqlx rolls the transaction back.
pub struct PgTurnTransaction {
    txn: Transaction<'static, Postgres>,
}

#[async_trait]
impl TurnTransaction for PgTurnTransaction {
    async fn create_session(&mut self, user_id: Uuid) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO chat_sessions (user_id) VALUES ($1) RETURNING id",
        )
        .bind(user_id)
        .fetch_one(&mut *self.txn)
        .await?;

        Ok(id)
    }

    async fn insert_user_message(
        &mut self,
        session_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO chat_messages (session_id, user_id, role, content)
               VALUES ($1, $2, 'user', $3)"#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(content)
        .execute(&mut *self.txn)
        .await?;

        Ok(())
    }

    async fn insert_assistant_message(&mut self, draft: AssistantMessageDraft) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO chat_messages
               (session_id, user_id, role, content, system_prompt, recalled_memories, meta)
               VALUES ($1, $2, 'assistant', $3, $4, $5, $6)"#,
        )
        .bind(draft.session_id)
        .bind(draft.user_id)
        .bind(&draft.content)
        .bind(&draft.system_prompt)
        .bind(Json(&draft.recalled_memories))
        .bind(Json(&draft.meta))
        .execute(&mut *self.txn)
        .await?;

        Ok(())
    }

    async fn touch_session(&mut self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE chat_sessions SET last_active_at = NOW() WHERE id = $1")
            .bind(session_id)
            .execute(&mut *self.txn)
            .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit().await?;
        Ok(())
    }
}
