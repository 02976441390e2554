//! WebSocket gateway: `GET /ws`.
//!
//! Resolves the caller's identity, applies the per-identity connect
//! cooldown, reserves a slot in the registry's register queue and only then
//! upgrades. Every rejection happens while the handler still owns the HTTP
//! response, so clients see a plain status code.

use axum::{
    extract::{ws::WebSocketUpgrade, Query},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::ApiError;
use crate::config::IdentitySource;
use crate::connection::{Connection, ConnectionSettings};
use crate::middleware::{bearer_token, CooldownStamp};
use crate::registry::RegisterPermit;
use crate::AppState;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Default, Deserialize)]
pub struct WsConnectParams {
    #[serde(rename = "userID", alias = "userId")]
    pub user_id: Option<String>,
    pub token: Option<String>,
}

/// Works out who is connecting according to the configured identity source.
fn resolve_identity(
    state: &AppState,
    params: &WsConnectParams,
    headers: &HeaderMap,
) -> Result<String, ApiError> {
    match state.gateway.identity_source {
        IdentitySource::Query => params
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("userID is required".to_string())),
        IdentitySource::Token => {
            let token = params
                .token
                .as_deref()
                .or_else(|| bearer_token(headers))
                .ok_or_else(|| ApiError::BadRequest("token is required".to_string()))?;
            playzy_accounts::verify_token(&state.jwt_secret, token)
                .map(|claims| claims.user_id)
                .map_err(|e| {
                    tracing::debug!("websocket token rejected: {}", e);
                    ApiError::BadRequest("invalid token".to_string())
                })
        }
    }
}

pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<WsConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match admit(&state, &params, &headers) {
        Ok((user_id, stamp, permit)) => {
            let settings = ConnectionSettings::from(&state.gateway);
            let transport_limit = state.gateway.max_transport_bytes;
            let cooldown = state.connect_cooldown.clone();
            let failed_user = user_id.clone();
            ws.max_message_size(transport_limit)
                .max_frame_size(transport_limit)
                .on_failed_upgrade(move |e| {
                    tracing::warn!(user_id = %failed_user, "websocket upgrade failed: {}", e);
                    cooldown.release(&failed_user, stamp);
                })
                .on_upgrade(move |socket| async move {
                    let (connection, handle, outbound) = Connection::open(
                        user_id,
                        state.registry.clone(),
                        state.store.clone(),
                        settings,
                    );
                    permit.admit(handle);
                    connection.serve(socket, outbound).await;
                })
        }
        Err(e) => e.into_response(),
    }
}

/// Runs every admission check. Only an attempt that passes all of them
/// keeps its place in the connect cooldown.
fn admit(
    state: &AppState,
    params: &WsConnectParams,
    headers: &HeaderMap,
) -> Result<(String, CooldownStamp, RegisterPermit), ApiError> {
    let user_id = resolve_identity(state, params, headers)?;

    let stamp = state.connect_cooldown.try_acquire(&user_id).map_err(|wait| {
        tracing::warn!(user_id = %user_id, "connection attempt inside cooldown window");
        ApiError::TooManyRequests {
            retry_after_secs: wait.as_secs_f64().ceil() as u64,
        }
    })?;

    let permit = match state.registry.try_reserve_register() {
        Ok(permit) => permit,
        Err(e) => {
            tracing::error!(user_id = %user_id, "refusing connection: {}", e);
            state.connect_cooldown.release(&user_id, stamp);
            return Err(ApiError::ServiceUnavailable(
                "server is busy, try again".to_string(),
            ));
        }
    };

    tracing::info!(user_id = %user_id, "websocket connection accepted");
    Ok((user_id, stamp, permit))
}
