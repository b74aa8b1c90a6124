//! Messaging handlers

use std::sync::Arc;

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use sitebook_core::models::Message;

use crate::{ApiError, AppState, AuthUser};

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub channel_key: String,
    pub body: String,
    pub metadata: Option<serde_json::Value>,
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
}

/// POST /api/messages
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "messages", "post")?;
    let id = state.db.post_message(
        &body.channel_key,
        user.id,
        &body.body,
        None,
        body.metadata.as_ref(),
        body.reply_to,
        &body.mentions,
    )?;

    // A plain post may be a follow-up inside an attention session.
    let event = sitebook_core::agents::InboundEvent {
        user_id: user.id,
        channel_key: body.channel_key.clone(),
        project_id: body
            .channel_key
            .split_once(':')
            .and_then(|(_, scope)| scope.parse().ok()),
        text: body.body.clone(),
        message_id: Some(id),
    };
    let _ = state.dispatcher.handle_followup(&event).await;

    Ok(Json(serde_json::json!({"id": id})))
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub channel_key: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/messages?channel_key=
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ChannelQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    state.gate.require(user.id, "messages", "read")?;
    let messages = state
        .db
        .recent_messages(&query.channel_key, query.limit.clamp(1, 200))?;
    Ok(Json(messages))
}

/// GET /api/messages/unread_counts
pub async fn unread_counts(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<sitebook_core::db::UnreadCount>>, ApiError> {
    state.gate.require(user.id, "messages", "read")?;
    let counts = state.db.unread_counts(user.id)?;
    Ok(Json(counts))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub channel_key: String,
}

/// POST /api/channels/read
pub async fn mark_channel_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<MarkReadRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "messages", "read")?;
    state.db.mark_channel_read(user.id, &body.channel_key)?;
    Ok(Json(serde_json::json!({"success": true})))
}
