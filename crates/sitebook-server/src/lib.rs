//! Sitebook Web Server
//!
//! Axum-based REST API for the expense ingestion and auto-authorization
//! pipeline. Security posture:
//! - Bearer JWT authentication validated at the edge (signature + expiry)
//! - Role capability checks on every mutating route
//! - Audit logging for reads that surface financial data
//! - Sanitized error bodies: `{error_kind, message, details?}`

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use sitebook_core::agents::AgentDispatcher;
use sitebook_core::autoauth::AutoAuthEngine;
use sitebook_core::categorize::CategorizationEngine;
use sitebook_core::classifier::Classifier;
use sitebook_core::intake::IntakeService;
use sitebook_core::jobs::JobQueue;
use sitebook_core::ocr::OcrPipeline;
use sitebook_core::reconcile::Reconciler;
use sitebook_core::{CapabilityGate, Config, Database, Error as CoreError, LlmClient};

mod handlers;
mod scheduler;

pub use scheduler::start_schedulers;

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub gate: CapabilityGate,
    pub classifier: Arc<Classifier>,
    pub intake: Arc<IntakeService>,
    pub engine: Arc<AutoAuthEngine>,
    pub reconciler: Arc<Reconciler>,
    pub dispatcher: Arc<AgentDispatcher>,
    pub jobs: JobQueue,
}

impl AppState {
    /// Wire every core component from one database handle and config.
    pub fn build(db: Database, config: Config, llm: Option<LlmClient>) -> Arc<Self> {
        let classifier = Arc::new(Classifier::new(config.retrain_interval_hours));
        let ocr = OcrPipeline::new(db.clone(), llm.clone(), config.clone());
        let categorizer = CategorizationEngine::new(
            db.clone(),
            llm.clone(),
            classifier.clone(),
            config.clone(),
        );
        let intake = Arc::new(IntakeService::new(
            db.clone(),
            ocr,
            categorizer,
            config.clone(),
        ));
        let engine = Arc::new(AutoAuthEngine::new(db.clone(), config.clone()));
        let reconciler = Arc::new(Reconciler::new(db.clone(), llm.clone(), config.clone()));
        let dispatcher = Arc::new(AgentDispatcher::new(
            db.clone(),
            llm,
            intake.clone(),
            engine.clone(),
            config.clone(),
        ));
        let jobs = JobQueue::start(db.clone(), engine.clone());

        Arc::new(Self {
            gate: CapabilityGate::new(db.clone()),
            db,
            config,
            classifier,
            intake,
            engine,
            reconciler,
            dispatcher,
            jobs,
        })
    }
}

/// Authenticated principal attached to the request by the middleware
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: uuid::Uuid,
}

#[derive(Debug, Serialize, serde::Deserialize)]
struct Claims {
    sub: String,
    role: String,
    exp: i64,
}

/// Issue a bearer token for a user (24h expiry).
pub fn issue_token(config: &Config, user_id: uuid::Uuid, role: &str) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| ApiError::internal_with(e.into()))
}

/// Authentication middleware: validates the bearer token's signature and
/// expiry, resolves the user, and attaches `AuthUser`.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::unauthenticated("Missing bearer token").into_response();
    };

    let mut validation = jsonwebtoken::Validation::default();
    validation.validate_exp = true;
    let decoded = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &validation,
    );

    let claims = match decoded {
        Ok(data) => data.claims,
        Err(e) => {
            warn!(error = %e, path = %request.uri().path(), "Token rejected");
            return ApiError::unauthenticated("Invalid or expired token").into_response();
        }
    };

    let Ok(user_id) = claims.sub.parse::<uuid::Uuid>() else {
        return ApiError::unauthenticated("Malformed token subject").into_response();
    };

    request.extensions_mut().insert(AuthUser { id: user_id });
    next.run(request).await
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Expenses
        .route(
            "/expenses",
            get(handlers::list_expenses).post(handlers::create_expense),
        )
        .route("/expenses/batch", post(handlers::create_expense_batch))
        .route("/expenses/summary", get(handlers::expense_summary))
        .route(
            "/expenses/:id",
            get(handlers::get_expense)
                .patch(handlers::patch_expense)
                .delete(handlers::delete_expense),
        )
        .route("/expenses/:id/status", post(handlers::set_expense_status))
        .route("/expenses/:id/history", get(handlers::expense_history))
        // Receipts
        .route(
            "/receipts",
            get(handlers::list_receipts).post(handlers::upload_receipt),
        )
        .route("/receipts/:id", get(handlers::get_receipt))
        .route("/receipts/:id/process", post(handlers::process_receipt))
        .route("/receipts/:id/reject", post(handlers::reject_receipt))
        .route(
            "/receipts/:id/reconcile",
            post(handlers::reconcile_receipt),
        )
        // Auto-authorization
        .route("/autoauth/run", post(handlers::run_auto_auth))
        .route("/reports/:id", get(handlers::get_report))
        // Messaging
        .route(
            "/messages",
            get(handlers::list_messages).post(handlers::post_message),
        )
        .route(
            "/messages/unread_counts",
            get(handlers::unread_counts),
        )
        .route("/channels/read", post(handlers::mark_channel_read))
        // Agents
        .route("/agents/:agent/message", post(handlers::agent_message))
        // Observability
        .route("/ocr/metrics", get(handlers::ocr_metrics))
        .route("/audit", get(handlers::list_audit))
        .route("/classifier/status", get(handlers::classifier_status))
        .route("/classifier/train", post(handlers::train_classifier));

    let public_routes = Router::new()
        .route("/auth/login", post(handlers::login))
        .route("/health", get(handlers::health));

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let protected = api_routes.layer(middleware::from_fn_with_state(
        state.clone(),
        auth_middleware,
    ));

    Router::new()
        .nest("/api", protected.merge(public_routes))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
}

/// Start the server
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    state.db.seed_default_capabilities()?;
    start_schedulers(state.clone());

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);
    info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Error Handling
// ============================================================================

/// API error body: `{error_kind, message, details?}` with the HTTP status
/// derived from the kind.
#[derive(Debug)]
pub struct ApiError {
    kind: String,
    message: String,
    details: Option<serde_json::Value>,
    internal: Option<anyhow::Error>,
}

impl ApiError {
    pub fn validation(msg: &str) -> Self {
        Self::of("validation", msg)
    }

    pub fn unauthenticated(msg: &str) -> Self {
        Self::of("unauthenticated", msg)
    }

    pub fn not_found(msg: &str) -> Self {
        Self::of("not_found", msg)
    }

    pub fn payload_too_large(msg: &str) -> Self {
        Self::of("validation", msg).with_status_hint("payload")
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn of(kind: &str, msg: &str) -> Self {
        Self {
            kind: kind.to_string(),
            message: msg.to_string(),
            details: None,
            internal: None,
        }
    }

    fn with_status_hint(mut self, hint: &str) -> Self {
        // 413 shares the validation kind; the hint switches the status only.
        self.kind = format!("{}:{}", self.kind, hint);
        self
    }

    fn internal_with(err: anyhow::Error) -> Self {
        Self {
            kind: "internal".into(),
            message: "An internal error occurred".into(),
            details: None,
            internal: Some(err),
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind.as_str() {
            "validation" => StatusCode::BAD_REQUEST,
            "validation:payload" => StatusCode::PAYLOAD_TOO_LARGE,
            "unauthenticated" => StatusCode::UNAUTHORIZED,
            "unauthorized" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "business_rule" => StatusCode::UNPROCESSABLE_ENTITY,
            "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
            "upstream_timeout" | "upstream_unavailable" | "upstream_invalid" => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            "partial_success" => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(err) = &self.internal {
            error!(error = %err, "Internal error");
        }

        // the payload hint is internal; the wire kind stays canonical
        let kind = self
            .kind
            .split(':')
            .next()
            .unwrap_or(&self.kind)
            .to_string();
        let mut body = serde_json::json!({
            "error_kind": kind,
            "message": self.message,
        });
        if let Some(ref details) = self.details {
            body["details"] = details.clone();
        }

        (self.status(), Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let kind = err.kind();
        if kind == "internal" {
            return Self::internal_with(err.into());
        }
        Self {
            kind: kind.to_string(),
            message: err.to_string(),
            details: None,
            internal: None,
        }
    }
}

#[cfg(test)]
mod tests;
