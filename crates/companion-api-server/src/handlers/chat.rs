use axum::{
    extract::Extension,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use crate::auth::AuthUser;
use crate::models::chat::{ChatRequest, ChatResponse};
use crate::services::conversation::{ConversationEngine, EngineError};
use crate::utils::error::ApiError;

pub async fn chat_handler(
    Extension(engine): Extension<Arc<ConversationEngine>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    info!(
        "Chat request: user={}, session={:?}, message_len={}",
        user.id,
        request.session_id,
        request.message.len()
    );

    let reply = engine
        .process_turn(
            user.id,
            request.session_id,
            request.message,
            request.debug_mode,
        )
        .await
        .map_err(|err| match err {
            EngineError::SessionNotFound(_) => {
                ApiError::NotFound("session not found".to_string())
            }
            other => ApiError::InternalError(other.to_string()),
        })?;

    Ok(Json(ChatResponse {
        response: reply.response,
        session_id: reply.session_id,
        memories_recalled: reply.memories_recalled,
        history_messages_count: reply.history_messages_count,
        error: reply.error,
        debug_info: reply.debug_info,
    }))
}

/// SSE variant: `token` events carrying text fragments, then exactly one
/// terminal `done` or `error` event.
pub async fn chat_stream_handler(
    Extension(engine): Extension<Arc<ConversationEngine>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    info!(
        "Chat stream request: user={}, session={:?}",
        user.id, request.session_id
    );

    let stream = engine
        .stream_turn(
            user.id,
            request.session_id,
            request.message,
            request.debug_mode,
        )
        .map(|event| Ok(create_sse_event(event.kind(), &event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn create_sse_event<T: serde::Serialize>(event_type: &str, data: &T) -> Event {
    Event::default()
        .event(event_type)
        .data(serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string()))
}
