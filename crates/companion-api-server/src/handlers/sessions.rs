use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::database::Repository;
use crate::models::chat::{
    MessageResponse, SessionCreateRequest, SessionResponse, SessionUpdateRequest,
};
use crate::services::conversation::TurnStore;
use crate::utils::error::ApiError;

pub async fn create_session(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<SessionCreateRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = repository
        .create_session(user.id, request.title.as_deref())
        .await?;

    Ok(Json(SessionResponse {
        id: session.id,
        title: session.title,
        pinned: session.pinned,
        created_at: session.created_at,
        last_active_at: session.last_active_at,
        message_count: session.message_count,
    }))
}

pub async fn list_sessions(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let sessions = repository.list_sessions(user.id).await?;

    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionResponse {
                id: s.id,
                title: s.title,
                pinned: s.pinned,
                created_at: s.created_at,
                last_active_at: s.last_active_at,
                message_count: s.message_count,
            })
            .collect(),
    ))
}

pub async fn session_messages(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let session = repository
        .find_session(session_id, user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;

    let messages = repository.session_messages(session.id).await?;

    Ok(Json(
        messages
            .into_iter()
            .map(|m| MessageResponse {
                id: m.id,
                role: m.role,
                content: m.content,
                created_at: m.created_at,
                system_prompt: m.system_prompt,
                memories_recalled: m.meta.as_ref().map(|meta| meta.0.memories_count),
            })
            .collect(),
    ))
}

pub async fn update_session(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SessionUpdateRequest>,
) -> Result<StatusCode, ApiError> {
    let updated = repository
        .update_session(session_id, user.id, request.title.as_deref(), request.pinned)
        .await?;

    if !updated {
        return Err(ApiError::NotFound("session not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_session(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = repository.delete_session(session_id, user.id).await?;

    if !deleted {
        return Err(ApiError::NotFound("session not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}
