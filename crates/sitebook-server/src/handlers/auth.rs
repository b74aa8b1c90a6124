//! Login and health handlers

use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{issue_token, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: serde_json::Value,
    pub role: String,
    pub capabilities: Vec<String>,
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if body.email.trim().is_empty() || body.password.is_empty() {
        return Err(ApiError::validation("Email and password are required"));
    }

    let user = state
        .db
        .get_user_by_email(&body.email)?
        .ok_or_else(|| ApiError::unauthenticated("Invalid credentials"))?;

    let Some(hash) = user.password_hash.as_deref() else {
        warn!(email = %body.email, "Login attempt against passwordless identity");
        return Err(ApiError::unauthenticated("Invalid credentials"));
    };
    let parsed =
        PasswordHash::new(hash).map_err(|_| ApiError::unauthenticated("Invalid credentials"))?;
    if Argon2::default()
        .verify_password(body.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(ApiError::unauthenticated("Invalid credentials"));
    }

    let token = issue_token(&state.config, user.id, user.role.as_str())?;
    let capabilities = state
        .db
        .role_capabilities(user.role)?
        .into_iter()
        .map(|(module, action)| format!("{}:{}", module, action))
        .collect();

    state
        .db
        .log_audit(user.id, "login", Some("user"), None, None)?;
    info!(user = %user.id, "Login succeeded");

    Ok(Json(LoginResponse {
        token,
        role: user.role.as_str().to_string(),
        user: serde_json::json!({
            "id": user.id,
            "email": user.email,
            "name": user.name,
        }),
        capabilities,
    }))
}

/// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
