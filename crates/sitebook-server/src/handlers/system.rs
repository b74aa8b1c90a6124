//! Observability handlers: OCR metrics, audit log, classifier lifecycle

use std::sync::Arc;

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::Deserialize;

use crate::{ApiError, AppState, AuthUser};

/// GET /api/ocr/metrics
pub async fn ocr_metrics(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "reports", "read")?;
    let (calls, successes, avg_wall_ms) = state.db.ocr_metric_summary()?;
    Ok(Json(serde_json::json!({
        "calls": calls,
        "successes": successes,
        "avg_wall_ms": avg_wall_ms,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// GET /api/audit
pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "reports", "read")?;
    let rows = state.db.list_audit_log(query.limit)?;
    let items: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, user_id, action, entity_type, details)| {
            serde_json::json!({
                "id": id,
                "user_id": user_id,
                "action": action,
                "entity_type": entity_type,
                "details": details,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"items": items})))
}

/// GET /api/classifier/status
pub async fn classifier_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<sitebook_core::classifier::ClassifierStatus>, ApiError> {
    state.gate.require(user.id, "reports", "read")?;
    Ok(Json(state.classifier.status()))
}

/// POST /api/classifier/train - explicit retrain request
pub async fn train_classifier(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<sitebook_core::classifier::ClassifierStatus>, ApiError> {
    state.gate.require(user.id, "autoauth", "run")?;
    let db = state.db.clone();
    let classifier = state.classifier.clone();
    // Training is CPU-bound; keep it off the request executor.
    tokio::task::spawn_blocking(move || classifier.train(&db))
        .await
        .map_err(|e| ApiError::validation(&e.to_string()))??;
    state
        .db
        .log_audit(user.id, "train", Some("classifier"), None, None)?;
    Ok(Json(state.classifier.status()))
}
