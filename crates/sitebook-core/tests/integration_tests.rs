//! Integration tests for sitebook-core
//!
//! These exercise the full upload -> extract -> categorize -> create ->
//! auto-authorize -> digest pipeline against a real (temp-file) database
//! with the mock LLM backend.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use sitebook_core::agents::AgentKind;
use sitebook_core::autoauth::AutoAuthEngine;
use sitebook_core::categorize::CategorizationEngine;
use sitebook_core::classifier::Classifier;
use sitebook_core::intake::IntakeService;
use sitebook_core::models::{ExpenseStatus, IntakeStatus, Role};
use sitebook_core::ocr::OcrPipeline;
use sitebook_core::reconcile::Reconciler;
use sitebook_core::{Config, Database, LlmClient, Money};

struct Pipeline {
    db: Database,
    config: Config,
    llm: LlmClient,
    intake: Arc<IntakeService>,
    engine: AutoAuthEngine,
}

fn pipeline() -> Pipeline {
    let db = Database::in_memory().unwrap();
    db.seed_default_capabilities().unwrap();
    let mut config = Config::default();
    config.blob_dir = std::env::temp_dir().join(format!("sb_it_{}", Uuid::new_v4()));

    let llm = LlmClient::mock();
    let classifier = Arc::new(Classifier::new(config.retrain_interval_hours));
    let ocr = OcrPipeline::new(db.clone(), Some(llm.clone()), config.clone());
    let categorizer =
        CategorizationEngine::new(db.clone(), Some(llm.clone()), classifier, config.clone());
    let intake = Arc::new(IntakeService::new(
        db.clone(),
        ocr,
        categorizer,
        config.clone(),
    ));
    let engine = AutoAuthEngine::new(db.clone(), config.clone());

    Pipeline {
        db,
        config,
        llm,
        intake,
        engine,
    }
}

/// A text-bearing receipt (fast OCR mode): two line items, clean totals.
const RECEIPT_R1: &str = "\
THE HOME DEPOT #1234
1234 BUILDER WAY, SPRINGFIELD
Invoice # HD-88421
2026-07-15

2X4 LUMBER                          12.00
WOOD SCREWS                          4.50
SUBTOTAL                            16.50
TOTAL                              $16.50
THANK YOU FOR SHOPPING WITH US
";

#[tokio::test]
async fn test_happy_path_upload_to_digest() {
    let p = pipeline();
    let uploader = p
        .db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
        .unwrap();
    let project = p.db.upsert_project("Maple St", "Framing").unwrap();
    let lumber = p.db.upsert_account("Lumber & Materials", None).unwrap();
    p.db.upsert_vendor("Home Depot").unwrap();

    // categorization via the small tier for both rows
    p.llm.as_mock().unwrap().push_response(
        "categorize_small",
        json!({"categorizations": [
            {"row_index": 0, "account_id": lumber.to_string(), "confidence": 95,
             "reasoning": "framing lumber"},
            {"row_index": 1, "account_id": lumber.to_string(), "confidence": 88,
             "reasoning": "fasteners"},
        ]}),
    );

    // upload -> pending
    let upload = p
        .intake
        .upload(project, uploader, RECEIPT_R1.as_bytes(), "text/plain")
        .unwrap();
    assert_eq!(upload.status, IntakeStatus::Pending);

    // process -> linked with two expenses
    let outcome = p.intake.process(upload.intake_id).await.unwrap();
    assert_eq!(outcome.status, IntakeStatus::Linked);
    assert_eq!(outcome.created, 2);
    assert_eq!(outcome.skipped, 0);

    let intake = p.db.get_intake(upload.intake_id).unwrap().unwrap();
    assert_eq!(intake.created_expense_ids.len(), 2);

    // every created expense: pending, categorized, amount preserved
    let mut amounts = Vec::new();
    for id in &intake.created_expense_ids {
        let e = p.db.get_expense(*id).unwrap().unwrap();
        assert_eq!(e.status, ExpenseStatus::Pending);
        assert_eq!(e.project_id, project);
        assert!(e.source.is_some());
        assert_eq!(e.account_id, Some(lumber));
        amounts.push(e.amount);
    }
    let total: Money = amounts.into_iter().sum();
    assert_eq!(total, Money::parse("16.50").unwrap());

    // auto-auth: R3 moves both to authorized under the bot identity
    let run = p.engine.run(project, None, false).await.unwrap();
    assert_eq!(run.summary.authorized, 2);
    assert!(run
        .decisions
        .iter()
        .all(|d| d.rule == "R3_RECEIPT_SUFFICIENT"));

    let bot = p.db.bot_user_id().unwrap();
    for id in &intake.created_expense_ids {
        let e = p.db.get_expense(*id).unwrap().unwrap();
        assert_eq!(e.status, ExpenseStatus::Authorized);
        assert_eq!(e.authorized_by, Some(bot));
    }

    // digest posted exactly once
    assert_eq!(p.engine.flush_digest(project).unwrap(), 1);
    assert_eq!(p.engine.flush_digest(project).unwrap(), 0);
    let msgs = p
        .db
        .recent_messages(&format!("project_general:{}", project), 20)
        .unwrap();
    let digests: Vec<_> = msgs
        .iter()
        .filter(|m| m.body.contains("Expense Digest"))
        .collect();
    assert_eq!(digests.len(), 1);
    assert!(digests[0].body.contains("**2** authorized"));
}

#[tokio::test]
async fn test_duplicate_by_hash_creates_no_expenses() {
    let p = pipeline();
    let uploader = p
        .db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
        .unwrap();
    let project = p.db.upsert_project("Maple St", "Framing").unwrap();
    let lumber = p.db.upsert_account("Lumber & Materials", None).unwrap();

    p.llm.as_mock().unwrap().push_response(
        "categorize_small",
        json!({"categorizations": [
            {"row_index": 0, "account_id": lumber.to_string(), "confidence": 95, "reasoning": "x"},
            {"row_index": 1, "account_id": lumber.to_string(), "confidence": 95, "reasoning": "x"},
        ]}),
    );

    let first = p
        .intake
        .upload(project, uploader, RECEIPT_R1.as_bytes(), "text/plain")
        .unwrap();
    p.intake.process(first.intake_id).await.unwrap();

    // re-upload the same bytes
    let second = p
        .intake
        .upload(project, uploader, RECEIPT_R1.as_bytes(), "text/plain")
        .unwrap();
    assert_eq!(second.status, IntakeStatus::Duplicate);

    // no further expenses were created
    let all = p
        .db
        .page_all_expenses(&sitebook_core::db::ExpenseFilter {
            project_id: Some(project),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_power_tool_guard_skips_item_and_r5_escalates() {
    let p = pipeline();
    let uploader = p
        .db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
        .unwrap();
    let project = p.db.upsert_project("Maple St", "Framing").unwrap();
    let materials = p.db.upsert_account("Lumber & Materials", None).unwrap();
    let tools = p.db.upsert_account("Tools", None).unwrap();
    let vendor = p.db.upsert_vendor("Home Depot").unwrap();

    // the drill row never reaches the LLM; only the lumber row does
    p.llm.as_mock().unwrap().push_response(
        "categorize_small",
        json!({"categorizations": [
            {"row_index": 1, "account_id": materials.to_string(), "confidence": 95,
             "reasoning": "lumber"},
        ]}),
    );

    let receipt = "\
THE HOME DEPOT #1234
Invoice # HD-99
2026-07-16

DEWALT 20V DRILL                   199.00
2X4 LUMBER                          12.00
TOTAL                             $211.00
PLEASE COME AGAIN SOON, BUILDER FRIEND
";
    let upload = p
        .intake
        .upload(project, uploader, receipt.as_bytes(), "text/plain")
        .unwrap();
    let outcome = p.intake.process(upload.intake_id).await.unwrap();

    // partial creation: lumber landed, the drill was skipped with a warning
    assert_eq!(outcome.status, IntakeStatus::Linked);
    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.skipped, 1);
    assert!(outcome.reasons[0].to_lowercase().contains("power tool"));

    // a manually entered tool purchase with complete fields escalates under
    // R5 (the Tools account is on the default escalation list) instead of
    // authorizing
    let drill = p
        .db
        .create_expense(
            &sitebook_core::models::NewExpense {
                project_id: project,
                txn_date: "2026-07-16".parse().unwrap(),
                amount: Money::parse("199.00").unwrap(),
                vendor_id: Some(vendor),
                account_id: Some(tools),
                description: "DeWalt 20V drill".into(),
                payment_method_id: None,
                bill_ref: None,
                external_ref: None,
                confidence: Some(0),
                source: None,
            },
            uploader,
        )
        .unwrap();

    let run = p.engine.run(project, None, false).await.unwrap();
    let drill_decision = run
        .decisions
        .iter()
        .find(|d| d.expense_id == drill)
        .unwrap();
    assert_eq!(drill_decision.rule, "R5_POLICY_ESCALATE");
    assert_eq!(
        p.db.get_expense(drill).unwrap().unwrap().status,
        ExpenseStatus::Pending
    );
}

#[tokio::test]
async fn test_mismatch_reconciliation_proposes_without_applying() {
    let p = pipeline();
    let uploader = p
        .db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
        .unwrap();
    let project = p.db.upsert_project("Maple St", "Roofing").unwrap();
    let materials = p.db.upsert_account("Roofing Materials", None).unwrap();

    p.llm.as_mock().unwrap().push_response(
        "categorize_small",
        json!({"categorizations": [
            {"row_index": 0, "account_id": materials.to_string(), "confidence": 95,
             "reasoning": "shingles"},
        ]}),
    );

    // receipt total 1048.05 but only one 850.00 line extracted
    let receipt = "\
LOWES #221
Invoice # LW-500
2026-07-20

ARCHITECTURAL SHINGLES BUNDLE      850.00
TOTAL                            $1,048.05
CUSTOMER COPY - RETAIN FOR RECORDS
";
    let upload = p
        .intake
        .upload(project, uploader, receipt.as_bytes(), "text/plain")
        .unwrap();

    // total mismatch routes to check_review first
    let outcome = p.intake.process(upload.intake_id).await.unwrap();
    assert_eq!(outcome.status, IntakeStatus::CheckReview);

    // a human confirms the total is right and releases it
    let outcome = p
        .intake
        .answer_missing_field(upload.intake_id, "total", "1048.05")
        .await
        .unwrap();
    assert_eq!(outcome.status, IntakeStatus::Linked);
    assert_eq!(outcome.created, 1);

    // reconciler finds the gap and proposes, but does not write
    p.llm.as_mock().unwrap().push_response(
        "reconcile_reread",
        json!({
            "finding": "missing_items",
            "missing_items": [
                {"description": "ridge cap shingles", "amount": "198.05", "confidence": 92}
            ],
            "explanation": "Second section of the invoice was missed."
        }),
    );
    let reconciler = Reconciler::new(p.db.clone(), Some(p.llm.clone()), p.config.clone());
    let outcome = reconciler
        .reconcile(upload.intake_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.finding.as_str(), "missing_items");
    let proposed: Money = outcome.suggested_items.iter().map(|i| i.amount).sum();
    assert_eq!(proposed, Money::parse("198.05").unwrap());
    assert!(!outcome.applied);

    // intake still linked; the only ledger rows are the original ones
    assert_eq!(
        p.db.get_intake(upload.intake_id).unwrap().unwrap().status,
        IntakeStatus::Linked
    );
    let all = p
        .db
        .page_all_expenses(&sitebook_core::db::ExpenseFilter {
            project_id: Some(project),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_change_log_reconstructs_field_history() {
    let p = pipeline();
    let user = p
        .db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
        .unwrap();
    let project = p.db.upsert_project("Maple St", "Framing").unwrap();

    let id = p
        .db
        .create_expense(
            &sitebook_core::models::NewExpense {
                project_id: project,
                txn_date: "2026-07-01".parse().unwrap(),
                amount: Money::parse("30.00").unwrap(),
                vendor_id: None,
                account_id: None,
                description: "paint".into(),
                payment_method_id: None,
                bill_ref: None,
                external_ref: None,
                confidence: None,
                source: None,
            },
            user,
        )
        .unwrap();

    // three successive edits to the same field
    for desc in ["interior paint", "exterior paint", "exterior paint gallon"] {
        let e = p.db.get_expense(id).unwrap().unwrap();
        let (_, changes) = p
            .db
            .update_expense(
                id,
                &sitebook_core::models::ExpensePatch {
                    description: Some(desc.into()),
                    ..Default::default()
                },
                e.version_token,
                user,
                Role::Bookkeeper,
            )
            .unwrap();
        p.db.insert_change_rows(&changes).unwrap();
    }

    // replaying the change log reconstructs the current value
    let log = p.db.change_log(id).unwrap();
    let desc_chain: Vec<_> = log.iter().filter(|r| r.field == "description").collect();
    assert_eq!(desc_chain.len(), 3);
    assert_eq!(desc_chain[0].old_value.as_deref(), Some("paint"));
    for pair in desc_chain.windows(2) {
        assert_eq!(pair[0].new_value, pair[1].old_value);
    }
    let current = p.db.get_expense(id).unwrap().unwrap();
    assert_eq!(
        desc_chain.last().unwrap().new_value.as_deref(),
        Some(current.description.as_str())
    );
}

#[tokio::test]
async fn test_no_duplicate_pair_in_active_statuses() {
    let p = pipeline();
    let user = p
        .db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
        .unwrap();
    let project = p.db.upsert_project("Maple St", "Framing").unwrap();
    let vendor = p.db.upsert_vendor("Home Depot").unwrap();
    let account = p.db.upsert_account("Materials", None).unwrap();

    let make = |desc: &str| sitebook_core::models::NewExpense {
        project_id: project,
        txn_date: "2026-07-01".parse().unwrap(),
        amount: Money::parse("12.00").unwrap(),
        vendor_id: Some(vendor),
        account_id: Some(account),
        description: desc.into(),
        payment_method_id: None,
        bill_ref: None,
        external_ref: None,
        confidence: None,
        source: None,
    };
    let a = p.db.create_expense(&make("2x4 lumber"), user).unwrap();
    let b = p.db.create_expense(&make("2x4 lumber"), user).unwrap();

    // after a run, at most one of the identical pair can ever be authorized:
    // both are flagged duplicates, neither mutates
    let run = p.engine.run(project, None, false).await.unwrap();
    assert_eq!(run.summary.authorized, 0);
    assert_eq!(run.summary.duplicates, 2);

    let sa = p.db.get_expense(a).unwrap().unwrap().status;
    let sb = p.db.get_expense(b).unwrap().unwrap().status;
    assert!(!(sa == ExpenseStatus::Authorized && sb == ExpenseStatus::Authorized));
}

#[tokio::test]
async fn test_receipt_agent_dialog_flow() {
    let p = pipeline();
    let user = p
        .db
        .create_user("pm@example.com", "PM", Role::ProjectManager, None)
        .unwrap();
    let project = p.db.upsert_project("Maple St", "Framing").unwrap();
    let lumber = p.db.upsert_account("Lumber & Materials", None).unwrap();

    let mock = p.llm.as_mock().unwrap();
    mock.push_response(
        "categorize_small",
        json!({"categorizations": [
            {"row_index": 0, "account_id": lumber.to_string(), "confidence": 95, "reasoning": "x"},
            {"row_index": 1, "account_id": lumber.to_string(), "confidence": 95, "reasoning": "x"},
        ]}),
    );

    let upload = p
        .intake
        .upload(project, user, RECEIPT_R1.as_bytes(), "text/plain")
        .unwrap();

    // the agent routes the mention to process_receipt
    mock.push_response(
        "agent_route",
        json!({"action": "function_call", "function": "process_receipt",
               "arguments": {"intake_id": upload.intake_id.to_string()},
               "ack_message": "Reading it now."}),
    );

    let dispatcher = sitebook_core::agents::AgentDispatcher::new(
        p.db.clone(),
        Some(p.llm.clone()),
        p.intake.clone(),
        Arc::new(AutoAuthEngine::new(p.db.clone(), p.config.clone())),
        p.config.clone(),
    );
    let event = sitebook_core::agents::InboundEvent {
        user_id: user,
        channel_key: format!("project_general:{}", project),
        project_id: Some(project),
        text: "@scanner process my receipt".into(),
        message_id: None,
    };
    dispatcher
        .dispatch(AgentKind::Receipts, &event)
        .await
        .unwrap();

    // the dialog reached its terminal state and the result was posted
    assert_eq!(
        dispatcher.flow_state(user, &event.channel_key),
        Some(sitebook_core::agents::ReceiptFlowState::Done)
    );
    let msgs = p
        .db
        .recent_messages(&event.channel_key, 10)
        .unwrap();
    assert!(msgs.iter().any(|m| m.body.contains("2 expense(s) created")));
    assert_eq!(
        p.db.get_intake(upload.intake_id).unwrap().unwrap().status,
        IntakeStatus::Linked
    );
}

#[tokio::test]
async fn test_cache_learns_across_intakes() {
    let p = pipeline();
    let uploader = p
        .db
        .create_user("bk@example.com", "BK", Role::Bookkeeper, None)
        .unwrap();
    let project_a = p.db.upsert_project("Maple St", "Framing").unwrap();
    let project_b = p.db.upsert_project("Oak Ave", "Framing").unwrap();
    let lumber = p.db.upsert_account("Lumber & Materials", None).unwrap();

    // only ONE small-tier reply queued; the second intake must hit the cache
    p.llm.as_mock().unwrap().push_response(
        "categorize_small",
        json!({"categorizations": [
            {"row_index": 0, "account_id": lumber.to_string(), "confidence": 95, "reasoning": "x"},
            {"row_index": 1, "account_id": lumber.to_string(), "confidence": 95, "reasoning": "x"},
        ]}),
    );

    let first = p
        .intake
        .upload(project_a, uploader, RECEIPT_R1.as_bytes(), "text/plain")
        .unwrap();
    p.intake.process(first.intake_id).await.unwrap();

    let second = p
        .intake
        .upload(project_b, uploader, RECEIPT_R1.as_bytes(), "text/plain")
        .unwrap();
    let outcome = p.intake.process(second.intake_id).await.unwrap();
    assert_eq!(outcome.created, 2);

    // second intake's expenses came from the cache tier
    let intake = p.db.get_intake(second.intake_id).unwrap().unwrap();
    for id in &intake.created_expense_ids {
        let e = p.db.get_expense(*id).unwrap().unwrap();
        assert_eq!(
            e.source,
            Some(sitebook_core::models::CategorizationSource::Cache)
        );
    }
    // one routing call total to the small tier
    let calls = p.llm.as_mock().unwrap().calls();
    assert_eq!(
        calls.iter().filter(|c| *c == &"categorize_small").count(),
        1
    );
}
