use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::conversation::types::{AssistantMeta, RecalledMemoryItem};

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Session metadata row. The engine's only write is bumping
/// `last_active_at` on a successful turn (and the lazy create).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SessionMeta {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Session row joined with its message count, for listings.
#[derive(Debug, Clone, FromRow)]
pub struct SessionWithCount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub message_count: i64,
}

/// One persisted utterance. Assistant rows carry the composed prompt, the
/// recalled-memory snapshot, and generation metadata; rows are written once
/// and never updated.
#[derive(Debug, Clone, FromRow)]
pub struct StoredMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub content: String,
    pub system_prompt: Option<String>,
    pub recalled_memories: Option<Json<Vec<RecalledMemoryItem>>>,
    pub meta: Option<Json<AssistantMeta>>,
    pub created_at: DateTime<Utc>,
}
