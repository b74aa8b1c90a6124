//! Server API tests

use super::*;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use sitebook_core::models::Role;
use sitebook_core::{Config, Database, LlmClient};

struct TestApp {
    router: Router,
    db: Database,
    config: Config,
}

fn setup() -> TestApp {
    let db = Database::in_memory().unwrap();
    db.seed_default_capabilities().unwrap();
    let mut config = Config::default();
    config.blob_dir = std::env::temp_dir().join(format!("sb_srv_{}", Uuid::new_v4()));
    let state = AppState::build(db.clone(), config.clone(), Some(LlmClient::mock()));
    TestApp {
        router: create_router(state),
        db,
        config,
    }
}

fn token_for(app: &TestApp, role: Role) -> (Uuid, String) {
    let email = format!("{}-{}@example.com", role.as_str(), Uuid::new_v4());
    let user = app.db.create_user(&email, "Test", role, None).unwrap();
    let token = issue_token(&app.config, user, role.as_str()).unwrap();
    (user, token)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

fn authed(
    method: &str,
    uri: &str,
    token: &str,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let app = setup();
    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_token_is_401() {
    let app = setup();
    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/expenses")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "unauthenticated");
}

#[tokio::test]
async fn test_login_with_password() {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let app = setup();
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(b"hunter2hunter2", &salt)
        .unwrap()
        .to_string();
    app.db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, Some(&hash))
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"email": "bk@example.com", "password": "hunter2hunter2"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["token"].as_str().is_some());
    assert_eq!(json["role"], "bookkeeper");
    assert!(json["capabilities"].as_array().unwrap().len() > 3);

    // wrong password
    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"email": "bk@example.com", "password": "wrong"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expense_crud_and_capability_denial() {
    let app = setup();
    let (_, bk_token) = token_for(&app, Role::Bookkeeper);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    // create
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            "/api/expenses",
            &bk_token,
            Some(serde_json::json!({
                "project_id": project,
                "txn_date": "2026-07-01",
                "amount": "12.00",
                "description": "2x4 lumber",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let id = json["ids"][0].as_str().unwrap().to_string();

    // read it back: amount serialized as a string
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "GET",
            &format!("/api/expenses/{}", id),
            &bk_token,
            None,
        ))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["amount"], "12.00");
    assert_eq!(json["status"], "pending");

    // bookkeepers cannot delete
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/expenses/{}?reason=test", id),
            &bk_token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "unauthorized");
}

#[tokio::test]
async fn test_patch_conflict_on_stale_token() {
    let app = setup();
    let (_, token) = token_for(&app, Role::Bookkeeper);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            "/api/expenses",
            &token,
            Some(serde_json::json!({
                "project_id": project,
                "txn_date": "2026-07-01",
                "amount": "30.00",
                "description": "paint",
            })),
        ))
        .await
        .unwrap();
    let id: Uuid = body_json(response).await["ids"][0]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let version = app.db.get_expense(id).unwrap().unwrap().version_token;

    // first patch wins
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "PATCH",
            &format!("/api/expenses/{}", id),
            &token,
            Some(serde_json::json!({
                "description": "exterior paint",
                "version_token": version,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // second patch with the stale token gets 409
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "PATCH",
            &format!("/api/expenses/{}", id),
            &token,
            Some(serde_json::json!({
                "description": "interior paint",
                "version_token": version,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "conflict");
}

#[tokio::test]
async fn test_forbidden_status_transition_is_422() {
    let app = setup();
    let (_, token) = token_for(&app, Role::AccountingManager);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            "/api/expenses",
            &token,
            Some(serde_json::json!({
                "project_id": project,
                "txn_date": "2026-07-01",
                "amount": "50.00",
                "description": "rebar",
            })),
        ))
        .await
        .unwrap();
    let id: Uuid = body_json(response).await["ids"][0]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let version = app.db.get_expense(id).unwrap().unwrap().version_token;

    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            &format!("/api/expenses/{}/status", id),
            &token,
            Some(serde_json::json!({"status": "authorized", "version_token": version})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // authorized -> pending is a business-rule rejection
    let version = app.db.get_expense(id).unwrap().unwrap().version_token;
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            &format!("/api/expenses/{}/status", id),
            &token,
            Some(serde_json::json!({"status": "pending", "version_token": version})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "business_rule");
}

#[tokio::test]
async fn test_batch_validation_writes_nothing() {
    let app = setup();
    let (_, token) = token_for(&app, Role::Bookkeeper);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            "/api/expenses/batch",
            &token,
            Some(serde_json::json!({
                "items": [
                    {"project_id": project, "txn_date": "2026-07-01", "amount": "12.00",
                     "description": "good row"},
                    {"project_id": project, "txn_date": "2026-07-01", "amount": "0.00",
                     "description": ""},
                ]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "validation");
    assert_eq!(json["details"]["rows"].as_array().unwrap().len(), 2);

    // no rows written
    let page = app
        .db
        .list_expenses(&Default::default(), 0, 10)
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_zero_byte_upload_rejected() {
    let app = setup();
    let (_, token) = token_for(&app, Role::Bookkeeper);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/receipts?project={}", project))
                .header("authorization", format!("Bearer {}", token))
                .header("content-type", "application/pdf")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "validation");
}

#[tokio::test]
async fn test_receipt_upload_and_duplicate() {
    let app = setup();
    let (_, token) = token_for(&app, Role::Bookkeeper);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    let upload = |body: &'static [u8], token: String, project: Uuid| {
        Request::builder()
            .method("POST")
            .uri(format!("/api/receipts?project={}", project))
            .header("authorization", format!("Bearer {}", token))
            .header("content-type", "application/pdf")
            .body(Body::from(body))
            .unwrap()
    };

    let response = app
        .router
        .clone()
        .oneshot(upload(b"receipt bytes", token.clone(), project))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "pending");
    assert_eq!(json["file_hash"].as_str().unwrap().len(), 64);

    // same bytes again: duplicate, no processing
    let response = app
        .router
        .clone()
        .oneshot(upload(b"receipt bytes", token.clone(), project))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["status"], "duplicate");
}

#[tokio::test]
async fn test_messages_and_unread_counts() {
    let app = setup();
    let (_, alice_token) = token_for(&app, Role::Bookkeeper);
    let (bob, bob_token) = token_for(&app, Role::ProjectManager);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();
    let channel = format!("project_general:{}", project);

    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            "/api/messages",
            &alice_token,
            Some(serde_json::json!({
                "channel_key": channel,
                "body": "morning crew",
                "mentions": [bob],
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(authed("GET", "/api/messages/unread_counts", &bob_token, None))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json[0]["count"], 1);

    // mark read clears the count
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            "/api/channels/read",
            &bob_token,
            Some(serde_json::json!({"channel_key": channel})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(authed("GET", "/api/messages/unread_counts", &bob_token, None))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_auto_auth_run_and_report() {
    let app = setup();
    let (_, token) = token_for(&app, Role::ProjectManager);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(authed(
            "POST",
            "/api/autoauth/run",
            &token,
            Some(serde_json::json!({"project": project})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let report_id = json["report_id"].as_str().unwrap().to_string();

    // report is readable by a role with reports:read
    let (_, mgr_token) = token_for(&app, Role::AccountingManager);
    let response = app
        .router
        .clone()
        .oneshot(authed(
            "GET",
            &format!("/api/reports/{}", report_id),
            &mgr_token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["decisions"].is_array());
}

#[tokio::test]
async fn test_agent_message_cooldown_suppression() {
    let app = setup();
    let (_, token) = token_for(&app, Role::ProjectManager);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();
    let channel = format!("project_general:{}", project);

    let request = |token: String, channel: String| {
        authed(
            "POST",
            "/api/agents/assistant/message",
            &token,
            Some(serde_json::json!({"channel_key": channel, "text": "@assistant hi"})),
        )
    };

    let response = app
        .router
        .clone()
        .oneshot(request(token.clone(), channel.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["handled"], true);

    // 2 seconds apart in spirit: an immediate second mention is suppressed
    let response = app
        .router
        .clone()
        .oneshot(request(token, channel))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["suppressed"], true);
}

#[tokio::test]
async fn test_summary_equals_paged_listing() {
    let app = setup();
    let (user, token) = token_for(&app, Role::AccountingManager);
    let project = app.db.upsert_project("Maple St", "Framing").unwrap();

    for i in 0..7 {
        let id = app
            .db
            .create_expense(
                &sitebook_core::models::NewExpense {
                    project_id: project,
                    txn_date: "2026-07-01".parse().unwrap(),
                    amount: sitebook_core::Money::parse("10.00").unwrap(),
                    vendor_id: None,
                    account_id: None,
                    description: format!("row {}", i),
                    payment_method_id: None,
                    bill_ref: None,
                    external_ref: None,
                    confidence: None,
                    source: None,
                },
                user,
            )
            .unwrap();
        let version = app.db.get_expense(id).unwrap().unwrap().version_token;
        app.db
            .set_expense_status(
                id,
                sitebook_core::models::ExpenseStatus::Authorized,
                None,
                version,
                user,
            )
            .unwrap();
    }

    let response = app
        .router
        .clone()
        .oneshot(authed(
            "GET",
            &format!("/api/expenses/summary?project={}&by=status", project),
            &token,
            None,
        ))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["complete"], true);
    assert_eq!(json["rows"]["authorized"]["count"], 7);
    assert_eq!(json["rows"]["authorized"]["total"], "70.00");
}
