//! Expense handlers

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sitebook_core::db::ExpenseFilter;
use sitebook_core::jobs::Job;
use sitebook_core::models::{Expense, ExpensePatch, ExpenseStatus, NewExpense};
use sitebook_core::money::Money;

use crate::{ApiError, AppState, AuthUser};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub project: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<String>,
    pub vendor: Option<Uuid>,
    pub account: Option<Uuid>,
    #[serde(default)]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub size: i64,
}

fn default_page_size() -> i64 {
    50
}

fn filter_from(query: &ListQuery) -> Result<ExpenseFilter, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<ExpenseStatus>()
                .map_err(|e| ApiError::validation(&e))?,
        ),
        None => None,
    };
    Ok(ExpenseFilter {
        project_id: query.project,
        from: query.from,
        to: query.to,
        status,
        vendor_id: query.vendor,
        account_id: query.account,
    })
}

/// GET /api/expenses
pub async fn list_expenses(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<sitebook_core::db::ExpensePage>, ApiError> {
    state.gate.require(user.id, "expenses", "read")?;
    let filter = filter_from(&query)?;
    let page = state.db.list_expenses(&filter, query.page, query.size)?;
    state.db.log_audit(
        user.id,
        "list",
        Some("expenses"),
        None,
        Some(&format!("page={}, count={}", page.page, page.items.len())),
    )?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct CreateExpenseRequest {
    pub project_id: Uuid,
    pub txn_date: NaiveDate,
    pub amount: Money,
    pub vendor_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub description: String,
    pub payment_method_id: Option<Uuid>,
    pub bill_ref: Option<String>,
    pub external_ref: Option<String>,
}

impl CreateExpenseRequest {
    fn into_new(self) -> NewExpense {
        NewExpense {
            project_id: self.project_id,
            txn_date: self.txn_date,
            amount: self.amount,
            vendor_id: self.vendor_id,
            account_id: self.account_id,
            description: self.description,
            payment_method_id: self.payment_method_id,
            bill_ref: self.bill_ref,
            external_ref: self.external_ref,
            confidence: None,
            source: Some(sitebook_core::models::CategorizationSource::Manual),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub ids: Vec<Uuid>,
}

/// POST /api/expenses
pub async fn create_expense(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateExpenseRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    state.gate.require(user.id, "expenses", "create")?;
    let new = body.into_new();
    let vendor = new.vendor_id;
    let project = new.project_id;
    let id = state.db.create_expense(&new, user.id)?;

    state
        .db
        .log_audit(user.id, "create", Some("expense"), Some(&id.to_string()), None)?;

    if let Some(vendor) = vendor {
        let _ = state
            .jobs
            .enqueue(Job::RefreshAffinity { vendor_id: vendor })
            .await;
    }
    let _ = state
        .jobs
        .enqueue(Job::TriggerAutoAuth {
            project_id: project,
        })
        .await;

    Ok(Json(CreatedResponse { ids: vec![id] }))
}

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    pub items: Vec<CreateExpenseRequest>,
    pub idempotency_key: Option<String>,
}

/// POST /api/expenses/batch
pub async fn create_expense_batch(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<BatchCreateRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    state.gate.require(user.id, "expenses", "create")?;
    if body.items.is_empty() {
        return Err(ApiError::validation("Batch is empty"));
    }

    // Per-row validation up front so a 400 carries row-level errors and no
    // rows land.
    let mut row_errors = Vec::new();
    for (i, item) in body.items.iter().enumerate() {
        if item.description.trim().is_empty() {
            row_errors.push(serde_json::json!({"row": i, "error": "description is empty"}));
        }
        if !item.amount.is_positive() {
            row_errors.push(serde_json::json!({"row": i, "error": "amount must be positive"}));
        }
    }
    if !row_errors.is_empty() {
        return Err(ApiError::validation("Batch failed validation")
            .with_details(serde_json::json!({"rows": row_errors})));
    }

    let project = body.items[0].project_id;
    let items: Vec<NewExpense> = body.items.into_iter().map(|i| i.into_new()).collect();
    let ids =
        state
            .db
            .create_expense_batch(&items, user.id, body.idempotency_key.as_deref())?;

    state.db.log_audit(
        user.id,
        "create_batch",
        Some("expenses"),
        None,
        Some(&format!("count={}", ids.len())),
    )?;
    let _ = state
        .jobs
        .enqueue(Job::TriggerAutoAuth {
            project_id: project,
        })
        .await;

    Ok(Json(CreatedResponse { ids }))
}

/// GET /api/expenses/:id
pub async fn get_expense(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Expense>, ApiError> {
    state.gate.require(user.id, "expenses", "read")?;
    let expense = state
        .db
        .get_expense(id)?
        .ok_or_else(|| ApiError::not_found("Expense not found"))?;
    Ok(Json(expense))
}

#[derive(Debug, Deserialize)]
pub struct PatchRequest {
    #[serde(flatten)]
    pub fields: ExpensePatch,
    pub version_token: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PatchResponse {
    pub id: Uuid,
    pub version_token: Uuid,
}

/// PATCH /api/expenses/:id
pub async fn patch_expense(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchRequest>,
) -> Result<Json<PatchResponse>, ApiError> {
    state.gate.require(user.id, "expenses", "update")?;
    let role = state.gate.role(user.id)?;

    let (expense, changes) =
        state
            .db
            .update_expense(id, &body.fields, body.version_token, user.id, role)?;

    // Change-log rows are post-commit work.
    let _ = state
        .jobs
        .enqueue(Job::WriteChangeLog { entries: changes })
        .await;
    state
        .db
        .log_audit(user.id, "update", Some("expense"), Some(&id.to_string()), None)?;

    // An edit may have resolved outstanding missing-info requests.
    state.db.resolve_pending_info(id).ok();
    if let Some(vendor) = expense.vendor_id {
        let _ = state
            .jobs
            .enqueue(Job::RefreshAffinity { vendor_id: vendor })
            .await;
    }

    Ok(Json(PatchResponse {
        id,
        version_token: expense.version_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: ExpenseStatus,
    pub reason: Option<String>,
    pub version_token: Uuid,
}

/// POST /api/expenses/:id/status
pub async fn set_expense_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<PatchResponse>, ApiError> {
    state.gate.require(user.id, "expenses", "status")?;
    let expense = state.db.set_expense_status(
        id,
        body.status,
        body.reason.as_deref(),
        body.version_token,
        user.id,
    )?;
    state.db.log_audit(
        user.id,
        "set_status",
        Some("expense"),
        Some(&id.to_string()),
        Some(body.status.as_str()),
    )?;
    Ok(Json(PatchResponse {
        id,
        version_token: expense.version_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub reason: Option<String>,
}

/// DELETE /api/expenses/:id (soft delete)
pub async fn delete_expense(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "expenses", "delete")?;
    let reason = query.reason.as_deref().unwrap_or("Deleted");
    state.db.soft_delete_expense(id, reason, user.id)?;
    state
        .db
        .log_audit(user.id, "delete", Some("expense"), Some(&id.to_string()), Some(reason))?;
    Ok(Json(serde_json::json!({"success": true})))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub project: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<String>,
    pub vendor: Option<Uuid>,
    pub account: Option<Uuid>,
    /// by: status | project | payment_method
    #[serde(default = "default_group")]
    pub by: String,
}

fn default_group() -> String {
    "status".into()
}

/// GET /api/expenses/summary
///
/// Aggregates page through every matching row; `complete` is always true
/// and present so consumers can tell a full scan from a truncated one.
pub async fn expense_summary(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "expenses", "read")?;
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<ExpenseStatus>()
                .map_err(|e| ApiError::validation(&e))?,
        ),
        None => None,
    };
    let filter = ExpenseFilter {
        project_id: query.project,
        from: query.from,
        to: query.to,
        status,
        vendor_id: query.vendor,
        account_id: query.account,
    };

    let body = match query.by.as_str() {
        "project" => {
            let rows = state.db.summarize_by_project(&filter)?;
            serde_json::json!({"by": "project", "rows": rows, "complete": true})
        }
        "payment_method" => {
            let rows = state.db.summarize_by_payment_method(&filter)?;
            serde_json::json!({"by": "payment_method", "rows": rows, "complete": true})
        }
        "status" => {
            let summary = state.db.summarize_by_status(&filter)?;
            serde_json::json!({"by": "status", "rows": summary, "complete": true})
        }
        other => {
            return Err(ApiError::validation(&format!(
                "Unknown grouping '{}'; use status, project, or payment_method",
                other
            )))
        }
    };

    state
        .db
        .log_audit(user.id, "summary", Some("expenses"), None, Some(&query.by))?;
    Ok(Json(body))
}

/// GET /api/expenses/:id/history - change log plus status log
pub async fn expense_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gate.require(user.id, "expenses", "read")?;
    let changes = state.db.change_log(id)?;
    let statuses = state.db.status_log(id)?;
    Ok(Json(serde_json::json!({
        "changes": changes,
        "transitions": statuses,
    })))
}
