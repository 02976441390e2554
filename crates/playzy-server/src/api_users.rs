//! Account endpoints: `POST /users` and `POST /auth`.

use axum::{http::StatusCode, Extension, Json};
use playzy_accounts::{CreateUserParams, User};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user_id: String,
    pub token: String,
    pub name: String,
    pub email: String,
    pub gamertag: String,
    pub phone: String,
}

/// Handler for `POST /users`.
pub async fn create_user_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateUserParams>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = tokio::task::spawn_blocking(move || {
        let conn = state
            .pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        playzy_accounts::create_user(&conn, &payload).map_err(ApiError::from)
    })
    .await??;

    Ok((StatusCode::CREATED, Json(user)))
}

/// Handler for `POST /auth`: exchanges email and password for a token.
pub async fn authenticate_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(ApiError::BadRequest(
            "email and password are required".to_string(),
        ));
    }

    let pool = state.pool.clone();
    let user = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        playzy_accounts::authenticate(&conn, &payload.email, &payload.password)
            .map_err(ApiError::from)
    })
    .await??;

    let token = playzy_accounts::issue_token(&state.jwt_secret, &user.id, state.token_ttl_secs)
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    tracing::info!(user_id = %user.id, "issued token");

    Ok(Json(AuthResponse {
        user_id: user.id,
        token,
        name: user.name,
        email: user.email,
        gamertag: user.gamertag,
        phone: user.phone,
    }))
}
