//! Chat agent entry point

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use sitebook_core::agents::{AgentKind, DispatchOutcome, InboundEvent};

use crate::{ApiError, AppState, AuthUser};

#[derive(Debug, Deserialize)]
pub struct AgentMessageRequest {
    pub channel_key: String,
    pub text: String,
    pub project_id: Option<Uuid>,
}

/// POST /api/agents/:agent/message - an @mention carried over the chat
/// transport. The dispatcher applies cooldowns and posts the reply into the
/// channel.
pub async fn agent_message(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(agent): Path<String>,
    Json(body): Json<AgentMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "messages", "post")?;
    let agent: AgentKind = agent
        .parse()
        .map_err(|e: String| ApiError::validation(&e))?;

    // The user's message lands in the channel first.
    let message_id = state.db.post_message(
        &body.channel_key,
        user.id,
        &body.text,
        None,
        None,
        None,
        &[],
    )?;

    let project_id = body.project_id.or_else(|| {
        body.channel_key
            .split_once(':')
            .and_then(|(_, scope)| scope.parse().ok())
    });
    let event = InboundEvent {
        user_id: user.id,
        channel_key: body.channel_key,
        project_id,
        text: body.text,
        message_id: Some(message_id),
    };

    let outcome = state.dispatcher.dispatch(agent, &event).await?;
    let body = match outcome {
        DispatchOutcome::Posted(id) => {
            serde_json::json!({"handled": true, "reply_id": id})
        }
        DispatchOutcome::Suppressed => {
            serde_json::json!({"handled": false, "suppressed": true})
        }
        DispatchOutcome::Ignored => serde_json::json!({"handled": false}),
    };
    Ok(Json(body))
}
