//! Mismatch reconciler
//!
//! When a linked intake's receipt total disagrees with the sum of the
//! expenses it produced, the reconciler re-reads the receipt with a vision
//! prompt biased toward finding what the first pass missed, compares, and
//! persists a suggested correction. Suggestions never auto-apply unless the
//! operator has opted in, and then only high-confidence missing items.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::{ImagePayload, LlmBackend, LlmClient};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{ExtractedReceipt, IntakeStatus, NewExpense};
use crate::money::Money;

use base64::Engine as _;

/// What the re-read concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileFinding {
    /// The first pass missed line items.
    MissingItems,
    /// A line was extracted twice.
    DuplicatedLine,
    /// The receipt total itself was misread.
    TotalWrong,
    /// Several lines were collapsed into one amount.
    AmountsConsolidated,
}

impl ReconcileFinding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingItems => "missing_items",
            Self::DuplicatedLine => "duplicated_line",
            Self::TotalWrong => "total_wrong",
            Self::AmountsConsolidated => "amounts_consolidated",
        }
    }
}

/// A proposed new line item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedItem {
    pub description: String,
    pub amount: Money,
    pub confidence: i64,
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub intake_id: Uuid,
    pub finding: ReconcileFinding,
    pub receipt_total: Money,
    pub expenses_sum: Money,
    pub suggested_items: Vec<SuggestedItem>,
    pub suggestion_id: Uuid,
    pub applied: bool,
}

#[derive(Debug, Deserialize)]
struct VisionVerdict {
    finding: String,
    #[serde(default)]
    missing_items: Vec<VisionMissingItem>,
    #[serde(default)]
    explanation: String,
}

#[derive(Debug, Deserialize)]
struct VisionMissingItem {
    description: String,
    amount: String,
    #[serde(default)]
    confidence: i64,
}

pub struct Reconciler {
    db: Database,
    llm: Option<LlmClient>,
    config: Config,
}

impl Reconciler {
    pub fn new(db: Database, llm: Option<LlmClient>, config: Config) -> Self {
        Self { db, llm, config }
    }

    /// Reconcile a linked intake. Returns None when the totals already
    /// agree within tolerance.
    pub async fn reconcile(&self, intake_id: Uuid) -> Result<Option<ReconcileOutcome>> {
        let intake = self
            .db
            .get_intake(intake_id)?
            .ok_or_else(|| Error::NotFound(format!("Intake {}", intake_id)))?;
        if intake.status != IntakeStatus::Linked {
            return Err(Error::BusinessRule(format!(
                "Intake {} is {}, expected linked",
                intake_id, intake.status
            )));
        }

        let receipt: ExtractedReceipt = match &intake.parsed {
            Some(v) => serde_json::from_value(v.clone())?,
            None => return Err(Error::BusinessRule("Intake has no extraction".into())),
        };
        let Some(receipt_total) = receipt.total else {
            return Err(Error::BusinessRule("Receipt has no total".into()));
        };

        let mut expenses_sum = Money::ZERO;
        let mut existing = Vec::new();
        for id in &intake.created_expense_ids {
            if let Some(e) = self.db.get_expense(*id)? {
                expenses_sum += e.amount;
                existing.push((e.description, e.amount));
            }
        }

        if expenses_sum.within_tolerance(
            receipt_total,
            self.config.amount_tolerance_cents,
            self.config.amount_tolerance_pct,
        ) {
            return Ok(None);
        }

        let gap = receipt_total - expenses_sum;
        let verdict = self
            .vision_reread(&intake.storage_key, &intake.mime_type, &existing, receipt_total, expenses_sum)
            .await?;

        let finding = match verdict.finding.as_str() {
            "missing_items" => ReconcileFinding::MissingItems,
            "duplicated_line" => ReconcileFinding::DuplicatedLine,
            "total_wrong" => ReconcileFinding::TotalWrong,
            _ => ReconcileFinding::AmountsConsolidated,
        };

        let suggested_items: Vec<SuggestedItem> = verdict
            .missing_items
            .into_iter()
            .filter_map(|i| {
                Money::parse(&i.amount).ok().map(|amount| SuggestedItem {
                    description: i.description,
                    amount,
                    confidence: i.confidence.clamp(0, 100),
                })
            })
            .collect();

        let suggestion = json!({
            "finding": finding.as_str(),
            "receipt_total": receipt_total,
            "expenses_sum": expenses_sum,
            "difference": gap,
            "items": suggested_items,
            "explanation": verdict.explanation,
            "action": match finding {
                ReconcileFinding::MissingItems => "create_additional_expenses",
                ReconcileFinding::DuplicatedLine => "remove_duplicate_line",
                ReconcileFinding::TotalWrong => "manual_review",
                ReconcileFinding::AmountsConsolidated => "split_existing_expense",
            },
        });
        let suggestion_id = self
            .db
            .save_reconcile_suggestion(intake_id, finding.as_str(), &suggestion)?;

        // Notify the project channel; the intake stays linked.
        let bot = self.db.bot_user_id()?;
        let body = format!(
            "**Receipt total mismatch** on intake {}\n\
             Receipt says **${}** but the created expenses sum to **${}** (gap ${}).\n\
             Finding: {}. A correction is waiting for review.",
            intake_id,
            receipt_total,
            expenses_sum,
            gap,
            finding.as_str()
        );
        let channel = format!("project_general:{}", intake.project_id);
        if let Err(e) = self.db.post_message(
            &channel,
            bot,
            &body,
            None,
            Some(&json!({"type": "reconcile_mismatch", "intake_id": intake_id.to_string(),
                         "suggestion_id": suggestion_id.to_string()})),
            None,
            &[],
        ) {
            warn!(error = %e, "Mismatch notice failed to post");
        }

        // Optional auto-apply, high-confidence missing items only.
        let mut applied = false;
        if self.config.auto_apply_reconcile
            && finding == ReconcileFinding::MissingItems
            && !suggested_items.is_empty()
            && suggested_items.iter().all(|i| i.confidence >= 90)
        {
            let proposed_sum: Money = suggested_items.iter().map(|i| i.amount).sum();
            if proposed_sum == gap {
                applied = self.apply_missing_items(&intake, &suggested_items, suggestion_id)?;
            }
        }

        info!(
            intake = %intake_id,
            finding = finding.as_str(),
            applied,
            "Reconciliation recorded"
        );
        Ok(Some(ReconcileOutcome {
            intake_id,
            finding,
            receipt_total,
            expenses_sum,
            suggested_items,
            suggestion_id,
            applied,
        }))
    }

    async fn vision_reread(
        &self,
        storage_key: &str,
        mime_type: &str,
        existing: &[(String, Money)],
        receipt_total: Money,
        expenses_sum: Money,
    ) -> Result<VisionVerdict> {
        let Some(llm) = &self.llm else {
            return Err(Error::UpstreamUnavailable(
                "Reconciliation requires the LLM gateway".into(),
            ));
        };

        let bytes = std::fs::read(self.config.blob_dir.join(storage_key))?;
        let images = vec![ImagePayload {
            base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            media_type: mime_type.to_string(),
        }];
        drop(bytes);

        let existing_lines: Vec<String> = existing
            .iter()
            .map(|(desc, amount)| format!("- {} : ${}", desc, amount))
            .collect();
        let prompt = format!(
            "This receipt was already processed, but the numbers do not add up.\n\
             RECEIPT TOTAL (printed): ${}\n\
             EXPENSES ALREADY CREATED (sum ${}):\n{}\n\n\
             Re-read the receipt carefully and determine what went wrong. Look especially \
             for items the first pass MISSED.\n\n\
             Return ONLY JSON:\n{}",
            receipt_total,
            expenses_sum,
            existing_lines.join("\n"),
            json!({
                "finding": "missing_items | duplicated_line | total_wrong | amounts_consolidated",
                "missing_items": [{"description": "...", "amount": "0.00", "confidence": 90}],
                "explanation": "one sentence"
            })
        );

        let reply = llm
            .extract_vision("reconcile_reread", &prompt, &images)
            .await
            .map_err(Error::from)?;
        drop(images);

        serde_json::from_value(reply.value)
            .map_err(|e| Error::UpstreamInvalid(format!("Reconcile schema mismatch: {}", e)))
    }

    fn apply_missing_items(
        &self,
        intake: &crate::models::ReceiptIntake,
        items: &[SuggestedItem],
        suggestion_id: Uuid,
    ) -> Result<bool> {
        let bot = self.db.bot_user_id()?;
        let txn_date = chrono::Utc::now().date_naive();
        let new_expenses: Vec<NewExpense> = items
            .iter()
            .map(|i| NewExpense {
                project_id: intake.project_id,
                txn_date,
                amount: i.amount,
                vendor_id: None,
                account_id: None,
                description: i.description.clone(),
                payment_method_id: None,
                bill_ref: None,
                external_ref: None,
                confidence: Some(i.confidence),
                source: None,
            })
            .collect();
        let key = format!("reconcile:{}", suggestion_id);
        self.db.create_expense_batch(&new_expenses, bot, Some(&key))?;
        self.db.mark_suggestion_applied(suggestion_id)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewExpense, Role, TotalMatch};
    use chrono::NaiveDate;
    use serde_json::json;

    async fn linked_intake_with_gap(
        db: &Database,
        config: &Config,
    ) -> (Uuid, Uuid) {
        let user = db
            .create_user("u@example.com", "U", Role::Bookkeeper, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();

        std::fs::create_dir_all(&config.blob_dir).unwrap();
        std::fs::write(config.blob_dir.join("gap.pdf"), b"receipt bytes").unwrap();

        let hash = crate::fingerprint::file_hash(b"receipt bytes");
        let intake = db
            .create_intake(project, user, "gap.pdf", &hash, "application/pdf", None)
            .unwrap();
        db.set_intake_status(intake, IntakeStatus::Processing, None)
            .unwrap();

        let receipt = ExtractedReceipt {
            vendor: Some("Home Depot".into()),
            vendor_confidence: 95,
            date: NaiveDate::from_ymd_opt(2026, 7, 1),
            date_confidence: 95,
            bill_ref: None,
            subtotal: None,
            tax: None,
            total: Some(Money::parse("1048.05").unwrap()),
            total_confidence: 95,
            line_items: vec![],
            total_match: TotalMatch::Total,
        };
        db.set_intake_extraction(intake, None, &serde_json::to_value(&receipt).unwrap())
            .unwrap();
        db.set_intake_status(intake, IntakeStatus::Ready, None)
            .unwrap();

        let expense = db
            .create_expense(
                &NewExpense {
                    project_id: project,
                    txn_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                    amount: Money::parse("850.00").unwrap(),
                    vendor_id: None,
                    account_id: None,
                    description: "framing package".into(),
                    payment_method_id: None,
                    bill_ref: None,
                    external_ref: None,
                    confidence: None,
                    source: None,
                },
                user,
            )
            .unwrap();
        db.link_intake_expenses(intake, &[expense]).unwrap();
        (intake, project)
    }

    #[tokio::test]
    async fn test_mismatch_produces_persisted_suggestion() {
        let db = Database::in_memory().unwrap();
        let mut config = Config::default();
        config.blob_dir = std::env::temp_dir().join(format!("sb_rec_{}", Uuid::new_v4()));
        let (intake, project) = linked_intake_with_gap(&db, &config).await;

        let llm = LlmClient::mock();
        llm.as_mock().unwrap().push_response(
            "reconcile_reread",
            json!({
                "finding": "missing_items",
                "missing_items": [
                    {"description": "roof sheathing", "amount": "198.05", "confidence": 93}
                ],
                "explanation": "One delivery section was skipped."
            }),
        );
        let reconciler = Reconciler::new(db.clone(), Some(llm), config);

        let outcome = reconciler.reconcile(intake).await.unwrap().unwrap();
        assert_eq!(outcome.finding, ReconcileFinding::MissingItems);
        assert_eq!(outcome.suggested_items.len(), 1);
        assert_eq!(
            outcome.suggested_items[0].amount,
            Money::parse("198.05").unwrap()
        );
        // no auto-apply by default
        assert!(!outcome.applied);

        // suggestion persisted, intake stays linked, mismatch notice posted
        let suggestions = db.suggestions_for_intake(intake).unwrap();
        assert_eq!(suggestions.len(), 1);
        assert!(!suggestions[0].3);
        assert_eq!(
            db.get_intake(intake).unwrap().unwrap().status,
            IntakeStatus::Linked
        );
        let msgs = db
            .recent_messages(&format!("project_general:{}", project), 5)
            .unwrap();
        assert!(msgs.iter().any(|m| m.body.contains("mismatch")));
    }

    #[tokio::test]
    async fn test_no_gap_is_a_noop() {
        let db = Database::in_memory().unwrap();
        let mut config = Config::default();
        config.blob_dir = std::env::temp_dir().join(format!("sb_rec_{}", Uuid::new_v4()));
        let (intake, _) = linked_intake_with_gap(&db, &config).await;

        // overwrite the extraction so the total matches the expense sum
        let receipt = ExtractedReceipt {
            vendor: Some("Home Depot".into()),
            vendor_confidence: 95,
            date: NaiveDate::from_ymd_opt(2026, 7, 1),
            date_confidence: 95,
            bill_ref: None,
            subtotal: None,
            tax: None,
            total: Some(Money::parse("850.00").unwrap()),
            total_confidence: 95,
            line_items: vec![],
            total_match: TotalMatch::Total,
        };
        db.set_intake_extraction(intake, None, &serde_json::to_value(&receipt).unwrap())
            .unwrap();

        let reconciler = Reconciler::new(db.clone(), Some(LlmClient::mock()), config);
        assert!(reconciler.reconcile(intake).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_apply_when_enabled_and_confident() {
        let db = Database::in_memory().unwrap();
        let mut config = Config::default();
        config.blob_dir = std::env::temp_dir().join(format!("sb_rec_{}", Uuid::new_v4()));
        config.auto_apply_reconcile = true;
        let (intake, _) = linked_intake_with_gap(&db, &config).await;

        let llm = LlmClient::mock();
        llm.as_mock().unwrap().push_response(
            "reconcile_reread",
            json!({
                "finding": "missing_items",
                "missing_items": [
                    {"description": "roof sheathing", "amount": "198.05", "confidence": 95}
                ],
                "explanation": "Missed section."
            }),
        );
        let reconciler = Reconciler::new(db.clone(), Some(llm), config);

        let outcome = reconciler.reconcile(intake).await.unwrap().unwrap();
        assert!(outcome.applied);
        let suggestions = db.suggestions_for_intake(intake).unwrap();
        assert!(suggestions[0].3);
    }
}
