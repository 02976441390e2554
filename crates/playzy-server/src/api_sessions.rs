//! LFG session endpoints: `POST /sessions` and `GET /sessions`.

use axum::{extract::Query, http::StatusCode, Extension, Json};
use playzy_accounts::{CreateSessionParams, Session, SessionFilter, SessionsPage};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::ApiError;
use crate::middleware::IdentityContext;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListSessionsParams {
    pub page: Option<String>,
    pub rank: Option<String>,
    pub game: Option<String>,
}

/// Handler for `POST /sessions`; the caller becomes the session's owner.
pub async fn create_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<IdentityContext>,
    Json(payload): Json<CreateSessionParams>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let session = tokio::task::spawn_blocking(move || {
        let conn = state
            .pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        playzy_accounts::create_session(&conn, &identity.user_id, &payload).map_err(ApiError::from)
    })
    .await??;

    Ok((StatusCode::CREATED, Json(session)))
}

/// Handler for `GET /sessions?page=&rank=&game=`.
pub async fn list_sessions_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<SessionsPage>, ApiError> {
    let page = match params.page.as_deref().map(str::trim) {
        None | Some("") => 1,
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|page| *page >= 1)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid page: {raw}")))?,
    };
    let filter = SessionFilter {
        rank: params.rank,
        game: params.game,
    };

    let listing = tokio::task::spawn_blocking(move || {
        let conn = state
            .pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        playzy_accounts::list_available_sessions(&conn, page, &filter).map_err(ApiError::from)
    })
    .await??;

    Ok(Json(listing))
}
