use axum::{extract::Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::password::{hash_password, verify_password};
use crate::auth::{AuthUser, JwtManager};
use crate::database::Repository;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

pub async fn register(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(jwt): Extension<Arc<JwtManager>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let username = request.username.trim();
    if username.len() < 3 || username.len() > 100 {
        return Err(ApiError::BadRequest(
            "username must be 3-100 characters".to_string(),
        ));
    }
    if !request.email.contains('@') {
        return Err(ApiError::BadRequest("invalid email address".to_string()));
    }
    if request.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let password_hash =
        hash_password(&request.password).map_err(|e| ApiError::InternalError(e.to_string()))?;

    let user = repository
        .create_user(username, request.email.trim(), &password_hash)
        .await?
        .ok_or_else(|| ApiError::Conflict("username or email already taken".to_string()))?;

    info!("Registered user {} ({})", user.username, user.id);

    let access_token = jwt
        .generate_token(user.id)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

pub async fn login(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(jwt): Extension<Arc<JwtManager>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = repository
        .find_user_by_username(request.username.trim())
        .await?;

    // Same rejection for unknown user and wrong password.
    let user = match user {
        Some(user) if verify_password(&request.password, &user.password_hash) => user,
        _ => {
            return Err(ApiError::Unauthorized(
                "invalid username or password".to_string(),
            ))
        }
    };

    repository.touch_last_login(user.id).await?;

    let access_token = jwt
        .generate_token(user.id)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

pub async fn me(
    Extension(repository): Extension<Arc<Repository>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = repository
        .find_user_by_id(user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

    Ok(Json(UserResponse {
        id: user.id,
        username: user.username,
        email: user.email,
        created_at: user.created_at,
    }))
}
