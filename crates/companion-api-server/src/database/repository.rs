use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use super::models::{SessionWithCount, StoredMessage, User};
use super::DbPool;

pub struct Repository {
    pub pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let pool = self.pool.get_pool();

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                username VARCHAR(100) NOT NULL UNIQUE,
                email VARCHAR(255) NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_login TIMESTAMPTZ
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chat_sessions (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title VARCHAR(200),
                pinned BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_active_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                session_id UUID NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
                user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role VARCHAR(20) NOT NULL,
                content TEXT NOT NULL,
                system_prompt TEXT,
                recalled_memories JSONB,
                meta JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions(user_id)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_sessions_active ON chat_sessions(last_active_at)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_created ON chat_messages(created_at)",
        )
        .execute(pool)
        .await?;

        debug!("Schema ensured");
        Ok(())
    }

    // ===== Users =====

    /// Insert a new user; returns None when username or email is taken.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"INSERT INTO users (username, email, password_hash)
               VALUES ($1, $2, $3)
               ON CONFLICT DO NOTHING
               RETURNING id, username, email, password_hash, created_at, last_login"#,
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(user)
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"SELECT id, username, email, password_hash, created_at, last_login
               FROM users WHERE username = $1"#,
        )
        .bind(username)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(user)
    }

    pub async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"SELECT id, username, email, password_hash, created_at, last_login
               FROM users WHERE id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(user)
    }

    pub async fn touch_last_login(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(self.pool.get_pool())
            .await?;

        Ok(())
    }

    // ===== Sessions =====

    pub async fn create_session(
        &self,
        user_id: Uuid,
        title: Option<&str>,
    ) -> Result<SessionWithCount> {
        let session = sqlx::query_as::<_, SessionWithCount>(
            r#"INSERT INTO chat_sessions (user_id, title)
               VALUES ($1, $2)
               RETURNING id, user_id, title, pinned, created_at, last_active_at,
                         0::BIGINT AS message_count"#,
        )
        .bind(user_id)
        .bind(title)
        .fetch_one(self.pool.get_pool())
        .await?;

        debug!("Created session {} for user {}", session.id, user_id);
        Ok(session)
    }

    /// User's sessions, most recently active first, with message counts.
    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionWithCount>> {
        let sessions = sqlx::query_as::<_, SessionWithCount>(
            r#"SELECT s.id, s.user_id, s.title, s.pinned, s.created_at, s.last_active_at,
                      COUNT(m.id) AS message_count
               FROM chat_sessions s
               LEFT JOIN chat_messages m ON m.session_id = s.id
               WHERE s.user_id = $1
               GROUP BY s.id
               ORDER BY s.last_active_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(sessions)
    }

    /// Rename and/or pin a session owned by the user. Returns false when no
    /// such session exists.
    pub async fn update_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        title: Option<&str>,
        pinned: Option<bool>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE chat_sessions
               SET title = COALESCE($3, title),
                   pinned = COALESCE($4, pinned)
               WHERE id = $1 AND user_id = $2"#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(title)
        .bind(pinned)
        .execute(self.pool.get_pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a session owned by the user; messages cascade.
    pub async fn delete_session(&self, session_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1 AND user_id = $2")
            .bind(session_id)
            .bind(user_id)
            .execute(self.pool.get_pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ===== Messages =====

    /// Full message history of a session, ascending by creation time.
    pub async fn session_messages(&self, session_id: Uuid) -> Result<Vec<StoredMessage>> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            r#"SELECT id, session_id, user_id, role, content,
                      system_prompt, recalled_memories, meta, created_at
               FROM chat_messages
               WHERE session_id = $1
               ORDER BY created_at ASC"#,
        )
        .bind(session_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(messages)
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(self.pool.get_pool())
            .await?;
        Ok(())
    }
}
