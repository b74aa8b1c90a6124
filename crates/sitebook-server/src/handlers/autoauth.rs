//! Auto-authorization handlers

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use sitebook_core::models::AuthReport;

use crate::{ApiError, AppState, AuthUser};

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub project: Uuid,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// POST /api/autoauth/run
pub async fn run_auto_auth(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<RunRequest>,
) -> Result<Json<sitebook_core::autoauth::RunOutcome>, ApiError> {
    state.gate.require(user.id, "autoauth", "run")?;

    let window = match (body.from, body.to) {
        (Some(from), Some(to)) if from <= to => Some((from, to)),
        (Some(_), Some(_)) => {
            return Err(ApiError::validation("'from' must not be after 'to'"))
        }
        (None, None) => None,
        _ => return Err(ApiError::validation("Provide both 'from' and 'to', or neither")),
    };

    let outcome = state.engine.run(body.project, window, false).await?;
    state.db.log_audit(
        user.id,
        "run_auto_auth",
        Some("project"),
        Some(&body.project.to_string()),
        Some(&format!(
            "authorized={}, escalated={}",
            outcome.summary.authorized, outcome.summary.escalated
        )),
    )?;
    Ok(Json(outcome))
}

/// GET /api/reports/:id - decision records for one run
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<AuthReport>, ApiError> {
    state.gate.require(user.id, "reports", "read")?;
    let report = state
        .db
        .get_auth_report(id)?
        .ok_or_else(|| ApiError::not_found("Report not found"))?;
    state
        .db
        .log_audit(user.id, "view", Some("auth_report"), Some(&id.to_string()), None)?;
    Ok(Json(report))
}
