//! Receipt intake orchestration
//!
//! The path from an uploaded blob to ledger rows: persist the file, dedupe,
//! extract, categorize, create expenses inside one unit of work, and link
//! the intake. Partial creation is allowed: line items that come back
//! without an account are skipped and counted, and the intake still links
//! when at least one expense landed.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::categorize::{CategorizationEngine, CategorizeRequest};
use crate::config::Config;
use crate::db::{Database, IntakeDuplicate};
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::models::{ExtractedReceipt, IntakeStatus, NewExpense, TotalMatch};
use crate::ocr::{OcrPipeline, ReceiptFile};

/// Result of an upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub intake_id: Uuid,
    pub file_hash: String,
    pub status: IntakeStatus,
}

/// Result of processing an intake
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub intake_id: Uuid,
    pub status: IntakeStatus,
    pub created: usize,
    pub skipped: usize,
    pub reasons: Vec<String>,
    pub expense_ids: Vec<Uuid>,
}

pub struct IntakeService {
    db: Database,
    ocr: OcrPipeline,
    categorizer: CategorizationEngine,
    config: Config,
}

impl IntakeService {
    pub fn new(
        db: Database,
        ocr: OcrPipeline,
        categorizer: CategorizationEngine,
        config: Config,
    ) -> Self {
        Self {
            db,
            ocr,
            categorizer,
            config,
        }
    }

    /// Persist an uploaded file and create the intake row. The SHA-256 is
    /// computed here, exactly once; hash duplicates short-circuit before any
    /// processing.
    pub fn upload(
        &self,
        project_id: Uuid,
        uploader_id: Uuid,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<UploadOutcome> {
        if bytes.is_empty() {
            return Err(Error::Validation("Uploaded file is empty".into()));
        }
        if bytes.len() > self.config.max_upload_bytes {
            return Err(Error::Validation(format!(
                "File exceeds the {} byte limit",
                self.config.max_upload_bytes
            )));
        }

        let file_hash = fingerprint::file_hash(bytes);
        let duplicate = self
            .db
            .find_intake_duplicate(project_id, &file_hash, None, None, None)?;

        let ext = match mime_type {
            "application/pdf" => "pdf",
            "image/png" => "png",
            _ => "jpg",
        };
        let storage_key = format!("{}-{}.{}", &file_hash[..12], Uuid::new_v4(), ext);
        let path = self.blob_path(&storage_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;

        let intake_id = self.db.create_intake(
            project_id,
            uploader_id,
            &storage_key,
            &file_hash,
            mime_type,
            None,
        )?;

        if let Some(dup) = duplicate {
            let reason = match dup {
                IntakeDuplicate::FileHash(id) => format!("Same file as intake {}", id),
                IntakeDuplicate::RecentExpense(id) => {
                    format!("Matches expense {} from a recent intake", id)
                }
            };
            self.db
                .set_intake_status(intake_id, IntakeStatus::Duplicate, Some(&reason))?;
            return Ok(UploadOutcome {
                intake_id,
                file_hash,
                status: IntakeStatus::Duplicate,
            });
        }

        Ok(UploadOutcome {
            intake_id,
            file_hash,
            status: IntakeStatus::Pending,
        })
    }

    /// Run the full pipeline on a pending intake.
    pub async fn process(&self, intake_id: Uuid) -> Result<ProcessOutcome> {
        let intake = self
            .db
            .get_intake(intake_id)?
            .ok_or_else(|| Error::NotFound(format!("Intake {}", intake_id)))?;
        if intake.status != IntakeStatus::Pending {
            return Err(Error::BusinessRule(format!(
                "Intake {} is {}, expected pending",
                intake_id, intake.status
            )));
        }

        self.db
            .set_intake_status(intake_id, IntakeStatus::Processing, None)?;

        let bytes = std::fs::read(self.blob_path(&intake.storage_key))?;
        let file = ReceiptFile {
            bytes,
            mime_type: intake.mime_type.clone(),
            pre_extracted_text: intake.extracted_text.clone(),
            page_images: None,
        };

        let (receipt, text) = match self.ocr.extract(file, Some(intake.project_id)).await {
            Ok(out) => out,
            Err(e) => {
                self.db.set_intake_status(
                    intake_id,
                    IntakeStatus::Error,
                    Some(&format!("Extraction failed: {}", e)),
                )?;
                return Err(e);
            }
        };

        self.db.set_intake_extraction(
            intake_id,
            text.as_deref(),
            &serde_json::to_value(&receipt)?,
        )?;

        // Content-level duplicate: (project, vendor, amount, date) against
        // expenses produced by recent intakes.
        let vendor_id = match &receipt.vendor {
            Some(name) => self
                .db
                .match_vendor(name, self.config.fuzzy_threshold)?
                .map(|v| v.id),
            None => None,
        };
        if let Some(dup) = self.db.find_intake_duplicate(
            intake.project_id,
            "", // hash already checked at upload
            vendor_id,
            receipt.total,
            receipt.date,
        )? {
            if let IntakeDuplicate::RecentExpense(id) = dup {
                let reason = format!("Matches expense {} from a recent intake", id);
                self.db
                    .set_intake_status(intake_id, IntakeStatus::Duplicate, Some(&reason))?;
                return Ok(ProcessOutcome {
                    intake_id,
                    status: IntakeStatus::Duplicate,
                    created: 0,
                    skipped: 0,
                    reasons: vec![reason],
                    expense_ids: vec![],
                });
            }
        }

        // Human-in-the-loop gate: weak extraction or totals that disagree.
        if receipt.min_confidence() < self.config.review_confidence
            || receipt.total_match == TotalMatch::Mismatch
        {
            let reason = if receipt.total_match == TotalMatch::Mismatch {
                "Line totals disagree with the receipt total".to_string()
            } else {
                format!(
                    "Extraction confidence {} below review threshold",
                    receipt.min_confidence()
                )
            };
            self.db
                .set_intake_status(intake_id, IntakeStatus::CheckReview, Some(&reason))?;
            return Ok(ProcessOutcome {
                intake_id,
                status: IntakeStatus::CheckReview,
                created: 0,
                skipped: receipt.line_items.len(),
                reasons: vec![reason],
                expense_ids: vec![],
            });
        }

        self.db
            .set_intake_status(intake_id, IntakeStatus::Ready, None)?;
        self.create_expenses(intake_id, &receipt, vendor_id).await
    }

    /// Categorize line items and write expenses. Called from `process` and
    /// again when a check_review intake is approved.
    pub async fn create_expenses(
        &self,
        intake_id: Uuid,
        receipt: &ExtractedReceipt,
        vendor_id: Option<Uuid>,
    ) -> Result<ProcessOutcome> {
        let intake = self
            .db
            .get_intake(intake_id)?
            .ok_or_else(|| Error::NotFound(format!("Intake {}", intake_id)))?;
        let stage = self.db.project_stage(intake.project_id)?;

        let requests: Vec<CategorizeRequest> = receipt
            .line_items
            .iter()
            .enumerate()
            .map(|(i, item)| CategorizeRequest {
                row_index: i,
                description: item.description.clone(),
                vendor_id,
            })
            .collect();

        let (categorizations, _metrics) = self
            .categorizer
            .categorize(Some(intake.project_id), Some(intake_id), &stage, &requests)
            .await?;

        let txn_date = receipt
            .date
            .unwrap_or_else(|| chrono::Utc::now().date_naive());

        let mut new_expenses = Vec::new();
        let mut skipped = 0usize;
        let mut reasons = Vec::new();
        for (item, cat) in receipt.line_items.iter().zip(&categorizations) {
            match cat.account_id {
                Some(account_id) => {
                    new_expenses.push(NewExpense {
                        project_id: intake.project_id,
                        txn_date,
                        amount: item.line_total,
                        vendor_id,
                        account_id: Some(account_id),
                        description: item.description.clone(),
                        payment_method_id: None,
                        bill_ref: receipt.bill_ref.clone(),
                        external_ref: None,
                        confidence: Some(cat.confidence),
                        source: cat.source,
                    });
                }
                None => {
                    skipped += 1;
                    reasons.push(format!(
                        "'{}' skipped: {}",
                        item.description,
                        cat.warning.as_deref().unwrap_or("no account assigned")
                    ));
                }
            }
        }

        if new_expenses.is_empty() {
            let reason = "No line items could be categorized".to_string();
            self.db
                .set_intake_status(intake_id, IntakeStatus::CheckReview, Some(&reason))?;
            reasons.push(reason);
            return Ok(ProcessOutcome {
                intake_id,
                status: IntakeStatus::CheckReview,
                created: 0,
                skipped,
                reasons,
                expense_ids: vec![],
            });
        }

        let bot = self.db.bot_user_id()?;
        let idempotency_key = format!("intake:{}", intake_id);
        let expense_ids =
            self.db
                .create_expense_batch(&new_expenses, bot, Some(&idempotency_key))?;
        self.db.link_intake_expenses(intake_id, &expense_ids)?;

        if let Some(vendor) = vendor_id {
            if let Err(e) = self.db.refresh_affinity(vendor) {
                warn!(vendor = %vendor, error = %e, "Affinity refresh failed");
            }
        }

        info!(
            intake = %intake_id,
            created = expense_ids.len(),
            skipped,
            "Intake linked"
        );
        Ok(ProcessOutcome {
            intake_id,
            status: IntakeStatus::Linked,
            created: expense_ids.len(),
            skipped,
            reasons,
            expense_ids,
        })
    }

    /// Manual override: reject an intake from any non-terminal state.
    pub fn reject(&self, intake_id: Uuid, reason: &str) -> Result<()> {
        self.db
            .set_intake_status(intake_id, IntakeStatus::Rejected, Some(reason))
    }

    /// Fill a field a human supplied (vendor name or date) on a
    /// check_review intake, then retry expense creation.
    pub async fn answer_missing_field(
        &self,
        intake_id: Uuid,
        field: &str,
        value: &str,
    ) -> Result<ProcessOutcome> {
        let intake = self
            .db
            .get_intake(intake_id)?
            .ok_or_else(|| Error::NotFound(format!("Intake {}", intake_id)))?;
        if intake.status != IntakeStatus::CheckReview {
            return Err(Error::BusinessRule(format!(
                "Intake {} is {}, expected check_review",
                intake_id, intake.status
            )));
        }
        let mut receipt: ExtractedReceipt = match intake.parsed {
            Some(v) => serde_json::from_value(v)?,
            None => return Err(Error::BusinessRule("Intake has no extraction".into())),
        };

        match field {
            "vendor" => {
                receipt.vendor = Some(value.to_string());
                receipt.vendor_confidence = 100;
            }
            "date" => {
                receipt.date = Some(value.parse().map_err(|_| {
                    Error::Validation(format!("Invalid date '{}', expected YYYY-MM-DD", value))
                })?);
                receipt.date_confidence = 100;
            }
            "total" => {
                receipt.total = Some(value.parse()?);
                receipt.total_confidence = 100;
            }
            other => {
                return Err(Error::Validation(format!("Unknown field '{}'", other)));
            }
        }

        self.db
            .set_intake_extraction(intake_id, None, &serde_json::to_value(&receipt)?)?;

        let vendor_id = match &receipt.vendor {
            Some(name) => Some(self.db.upsert_vendor(name)?),
            None => None,
        };
        self.create_expenses(intake_id, &receipt, vendor_id).await
    }

    fn blob_path(&self, storage_key: &str) -> PathBuf {
        self.config.blob_dir.join(storage_key)
    }
}
