//! Conversation history: `GET /conversations`.

use axum::{extract::Query, Extension, Json};
use playzy_messages::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::ApiError;
use crate::middleware::IdentityContext;
use crate::AppState;

pub const DEFAULT_PAGE_LIMIT: u32 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct ConversationParams {
    #[serde(rename = "otherUserId", alias = "otherUserID")]
    pub other_user_id: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

/// A history entry: the message plus whether the caller sent it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(flatten)]
    pub message: Message,
    pub is_mine: bool,
}

/// Page window parsed leniently: a missing, unparsable or non-positive
/// limit falls back to [`DEFAULT_PAGE_LIMIT`], a bad offset to 0. Any
/// positive limit is honored as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub limit: u32,
    pub offset: u32,
}

impl PageWindow {
    pub fn from_raw(limit: Option<&str>, offset: Option<&str>) -> Self {
        let limit = limit
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_PAGE_LIMIT);
        let offset = offset
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(0);
        Self { limit, offset }
    }
}

/// Returns one page of the caller's conversation with `otherUserId` in
/// chronological order, and schedules the page's incoming messages to be
/// marked read.
pub async fn get_conversation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<IdentityContext>,
    Query(params): Query<ConversationParams>,
) -> Result<Json<Vec<ConversationMessage>>, ApiError> {
    let counterpart = params
        .other_user_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("otherUserId is required".to_string()))?
        .to_string();
    let window = PageWindow::from_raw(params.limit.as_deref(), params.offset.as_deref());
    let owner = identity.user_id;

    let store = state.store.clone();
    let (a, b) = (owner.clone(), counterpart.clone());
    let mut page = tokio::task::spawn_blocking(move || {
        store.list_between(&a, &b, window.limit, window.offset)
    })
    .await??;

    page.reverse();

    if !page.is_empty() {
        state.read_receipts.schedule(&owner, &counterpart);
    }

    let history = page
        .into_iter()
        .map(|message| ConversationMessage {
            is_mine: message.sender_id == owner,
            message,
        })
        .collect();

    Ok(Json(history))
}
