use axum::{
    extract::{Extension, Request},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::utils::error::ApiError;

/// The authenticated principal, injected into request extensions for
/// handlers behind this middleware.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
}

pub async fn auth_middleware(
    Extension(jwt): Extension<Arc<JwtManager>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    let claims = jwt
        .validate_token(token)
        .map_err(|_| ApiError::Unauthorized("invalid or expired token".to_string()))?;

    request.extensions_mut().insert(AuthUser {
        id: claims.user_id,
    });

    Ok(next.run(request).await)
}
