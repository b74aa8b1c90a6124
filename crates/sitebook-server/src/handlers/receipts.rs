//! Receipt intake handlers

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, Request, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use sitebook_core::jobs::Job;
use sitebook_core::models::{IntakeStatus, ReceiptIntake};

use crate::{ApiError, AppState, AuthUser};

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub project: Uuid,
}

/// POST /api/receipts?project= - raw file body; content type from the
/// Content-Type header.
pub async fn upload_receipt(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Result<Json<sitebook_core::intake::UploadOutcome>, ApiError> {
    state.gate.require(user.id, "receipts", "upload")?;

    let mime_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let max = state.config.max_upload_bytes;
    let bytes = axum::body::to_bytes(request.into_body(), max)
        .await
        .map_err(|_| {
            ApiError::payload_too_large(&format!("File exceeds the {} byte limit", max))
        })?;
    if bytes.is_empty() {
        return Err(ApiError::validation("Uploaded file is empty"));
    }

    let outcome = state
        .intake
        .upload(query.project, user.id, &bytes, &mime_type)?;
    drop(bytes);

    state.db.log_audit(
        user.id,
        "upload",
        Some("receipt_intake"),
        Some(&outcome.intake_id.to_string()),
        Some(&format!("status={}", outcome.status)),
    )?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ListIntakesQuery {
    pub project: Option<Uuid>,
    pub status: Option<String>,
}

/// GET /api/receipts
pub async fn list_receipts(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListIntakesQuery>,
) -> Result<Json<Vec<ReceiptIntake>>, ApiError> {
    state.gate.require(user.id, "receipts", "read")?;
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<IntakeStatus>()
                .map_err(|e| ApiError::validation(&e))?,
        ),
        None => None,
    };
    let intakes = state.db.list_intakes(query.project, status)?;
    Ok(Json(intakes))
}

/// GET /api/receipts/:id
pub async fn get_receipt(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReceiptIntake>, ApiError> {
    state.gate.require(user.id, "receipts", "read")?;
    let intake = state
        .db
        .get_intake(id)?
        .ok_or_else(|| ApiError::not_found("Intake not found"))?;
    Ok(Json(intake))
}

/// POST /api/receipts/:id/process - run OCR, categorization, and expense
/// creation. Partial creation returns `{created, skipped, reasons}`.
pub async fn process_receipt(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<sitebook_core::intake::ProcessOutcome>, ApiError> {
    state.gate.require(user.id, "receipts", "process")?;
    let outcome = state.intake.process(id).await?;

    state.db.log_audit(
        user.id,
        "process",
        Some("receipt_intake"),
        Some(&id.to_string()),
        Some(&format!(
            "status={}, created={}, skipped={}",
            outcome.status, outcome.created, outcome.skipped
        )),
    )?;

    // Auto-auth follows a successful link, as post-commit work.
    if outcome.status == IntakeStatus::Linked {
        if let Some(intake) = state.db.get_intake(id)? {
            let _ = state
                .jobs
                .enqueue(Job::TriggerAutoAuth {
                    project_id: intake.project_id,
                })
                .await;
        }
    }
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

/// POST /api/receipts/:id/reject
pub async fn reject_receipt(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "receipts", "process")?;
    if body.reason.trim().is_empty() {
        return Err(ApiError::validation("A reason is required"));
    }
    state.intake.reject(id, &body.reason)?;
    state.db.log_audit(
        user.id,
        "reject",
        Some("receipt_intake"),
        Some(&id.to_string()),
        Some(&body.reason),
    )?;
    Ok(Json(serde_json::json!({"success": true})))
}

/// POST /api/receipts/:id/reconcile - compare the receipt total against the
/// created expenses and record a suggested correction on disagreement.
pub async fn reconcile_receipt(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "receipts", "process")?;
    let outcome = state.reconciler.reconcile(id).await?;
    state.db.log_audit(
        user.id,
        "reconcile",
        Some("receipt_intake"),
        Some(&id.to_string()),
        outcome.as_ref().map(|o| o.finding.as_str()),
    )?;
    match outcome {
        Some(o) => Ok(Json(serde_json::to_value(o).map_err(|e| {
            ApiError::validation(&e.to_string())
        })?)),
        None => Ok(Json(serde_json::json!({"matched": true}))),
    }
}
