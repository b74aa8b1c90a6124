//! Receipt intake queue operations
//!
//! Rows move through {pending, processing, ready, linked, duplicate,
//! check_review, rejected, error}. Terminal states take exactly one
//! transition; duplicate detection runs before any processing starts.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{IntakeStatus, ReceiptIntake};
use crate::money::Money;

/// Why an upload was ruled a duplicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeDuplicate {
    /// Same file hash already uploaded to this project.
    FileHash(Uuid),
    /// An expense with the same (project, vendor, amount, date) was created
    /// from a recent intake.
    RecentExpense(Uuid),
}

const INTAKE_COLS: &str = "id, project_id, uploader_id, storage_key, file_hash, mime_type, \
     extracted_text, parsed, status, status_reason, batch_id, thumbnail_key, vault_ref, \
     created_at, updated_at";

fn row_to_intake(row: &Row) -> rusqlite::Result<ReceiptIntake> {
    let parse_uuid = |s: String| Uuid::parse_str(&s).unwrap_or_default();
    Ok(ReceiptIntake {
        id: parse_uuid(row.get(0)?),
        project_id: parse_uuid(row.get(1)?),
        uploader_id: parse_uuid(row.get(2)?),
        storage_key: row.get(3)?,
        file_hash: row.get(4)?,
        mime_type: row.get(5)?,
        extracted_text: row.get(6)?,
        parsed: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        status: row
            .get::<_, String>(8)?
            .parse()
            .unwrap_or(IntakeStatus::Pending),
        status_reason: row.get(9)?,
        created_expense_ids: Vec::new(), // populated below
        batch_id: row
            .get::<_, Option<String>>(10)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        thumbnail_key: row.get(11)?,
        vault_ref: row.get(12)?,
        created_at: parse_datetime(&row.get::<_, String>(13)?),
        updated_at: parse_datetime(&row.get::<_, String>(14)?),
    })
}

impl Database {
    /// Insert a new intake row in `pending`. The file hash must already be
    /// computed (exactly once, at upload).
    pub fn create_intake(
        &self,
        project_id: Uuid,
        uploader_id: Uuid,
        storage_key: &str,
        file_hash: &str,
        mime_type: &str,
        batch_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = fmt_datetime(Utc::now());
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO receipt_intake (id, project_id, uploader_id, storage_key, file_hash,
                mime_type, status, batch_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
            params![
                id.to_string(),
                project_id.to_string(),
                uploader_id.to_string(),
                storage_key,
                file_hash,
                mime_type,
                batch_id.map(|b| b.to_string()),
                now,
                now,
            ],
        )?;
        Ok(id)
    }

    /// Fetch one intake with its created-expense ids (in insertion order).
    pub fn get_intake(&self, id: Uuid) -> Result<Option<ReceiptIntake>> {
        let conn = self.conn()?;
        let intake = conn
            .query_row(
                &format!("SELECT {} FROM receipt_intake WHERE id = ?", INTAKE_COLS),
                params![id.to_string()],
                row_to_intake,
            )
            .optional()?;

        let Some(mut intake) = intake else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT expense_id FROM intake_expenses WHERE intake_id = ? ORDER BY position",
        )?;
        intake.created_expense_ids = stmt
            .query_map(params![id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect();

        Ok(Some(intake))
    }

    /// List intakes for a project, optionally filtered by status.
    pub fn list_intakes(
        &self,
        project_id: Option<Uuid>,
        status: Option<IntakeStatus>,
    ) -> Result<Vec<ReceiptIntake>> {
        let conn = self.conn()?;
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(p) = project_id {
            conditions.push("project_id = ?".into());
            params.push(Box::new(p.to_string()));
        }
        if let Some(s) = status {
            conditions.push("status = ?".into());
            params.push(Box::new(s.as_str().to_string()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM receipt_intake {} ORDER BY created_at DESC",
            INTAKE_COLS, where_clause
        );
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(refs.as_slice(), row_to_intake)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Duplicate check before processing: by file hash within the project,
    /// then by (project, vendor, amount, date) of expenses produced from
    /// intakes in the last 30 days.
    pub fn find_intake_duplicate(
        &self,
        project_id: Uuid,
        file_hash: &str,
        vendor_id: Option<Uuid>,
        amount: Option<Money>,
        txn_date: Option<chrono::NaiveDate>,
    ) -> Result<Option<IntakeDuplicate>> {
        let conn = self.conn()?;

        // Hash collision against any intake that is not rejected/error; a
        // prior linked upload of the same file is still a duplicate.
        let existing: Option<String> = conn
            .query_row(
                r#"
                SELECT id FROM receipt_intake
                 WHERE project_id = ? AND file_hash = ?
                   AND status NOT IN ('rejected', 'error')
                 LIMIT 1
                "#,
                params![project_id.to_string(), file_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(Some(IntakeDuplicate::FileHash(
                Uuid::parse_str(&id).unwrap_or_default(),
            )));
        }

        let (Some(vendor), Some(amount), Some(date)) = (vendor_id, amount, txn_date) else {
            return Ok(None);
        };

        let cutoff = fmt_datetime(Utc::now() - Duration::days(30));
        let hit: Option<String> = conn
            .query_row(
                r#"
                SELECT e.id FROM expenses e
                  JOIN intake_expenses ie ON ie.expense_id = e.id
                  JOIN receipt_intake ri ON ri.id = ie.intake_id
                 WHERE e.project_id = ? AND e.vendor_id = ? AND e.amount = ? AND e.txn_date = ?
                   AND ri.created_at > ?
                 LIMIT 1
                "#,
                params![
                    project_id.to_string(),
                    vendor.to_string(),
                    amount.to_string(),
                    date.to_string(),
                    cutoff,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.map(|id| IntakeDuplicate::RecentExpense(Uuid::parse_str(&id).unwrap_or_default())))
    }

    /// Transition an intake. Enforces single-terminal-transition and the
    /// state machine edges; manual override to `rejected` is allowed from
    /// any non-terminal state.
    pub fn set_intake_status(
        &self,
        id: Uuid,
        new_status: IntakeStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let current = self
            .get_intake(id)?
            .ok_or_else(|| Error::NotFound(format!("Intake {}", id)))?;

        if current.status.is_terminal() {
            return Err(Error::BusinessRule(format!(
                "Intake {} already terminal ({})",
                id, current.status
            )));
        }

        use IntakeStatus::{
            CheckReview, Duplicate, Error as IntakeError, Linked, Pending, Processing, Ready,
            Rejected,
        };
        let legal = matches!(
            (current.status, new_status),
            (Pending, Processing)
                | (Pending, Duplicate)
                | (Processing, Ready)
                | (Processing, CheckReview)
                | (Processing, Duplicate)
                | (Processing, IntakeError)
                | (Ready, Linked)
                | (Ready, CheckReview)
                | (CheckReview, Linked)
                | (CheckReview, Ready)
                | (CheckReview, CheckReview)
                | (_, Rejected)
        );
        if !legal {
            return Err(Error::BusinessRule(format!(
                "Illegal intake transition {} -> {}",
                current.status, new_status
            )));
        }

        if new_status == Linked && current.created_expense_ids.is_empty() {
            // Callers must link expenses first (see link_intake_expenses).
            return Err(Error::BusinessRule(
                "Intake cannot be linked without created expenses".into(),
            ));
        }

        let conn = self.conn()?;
        conn.execute(
            "UPDATE receipt_intake SET status = ?, status_reason = ?, updated_at = ? WHERE id = ?",
            params![
                new_status.as_str(),
                reason,
                fmt_datetime(Utc::now()),
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Store the extraction output on the intake row.
    pub fn set_intake_extraction(
        &self,
        id: Uuid,
        extracted_text: Option<&str>,
        parsed: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE receipt_intake SET extracted_text = ?, parsed = ?, updated_at = ? WHERE id = ?",
            params![
                extracted_text,
                serde_json::to_string(parsed)?,
                fmt_datetime(Utc::now()),
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Record which expenses an intake produced and transition it to linked.
    /// Only actually-written expense ids belong here.
    pub fn link_intake_expenses(&self, id: Uuid, expense_ids: &[Uuid]) -> Result<()> {
        if expense_ids.is_empty() {
            return Err(Error::BusinessRule(
                "Cannot link an intake to zero expenses".into(),
            ));
        }
        let current = self
            .get_intake(id)?
            .ok_or_else(|| Error::NotFound(format!("Intake {}", id)))?;
        if current.status.is_terminal() {
            return Err(Error::BusinessRule(format!(
                "Intake {} already terminal ({})",
                id, current.status
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (pos, eid) in expense_ids.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO intake_expenses (intake_id, expense_id, position) VALUES (?, ?, ?)",
                params![id.to_string(), eid.to_string(), pos as i64],
            )?;
        }
        tx.execute(
            "UPDATE receipt_intake SET status = 'linked', updated_at = ? WHERE id = ?",
            params![fmt_datetime(Utc::now()), id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The intake that produced a given expense, if any (used by R3).
    pub fn intake_for_expense(&self, expense_id: Uuid) -> Result<Option<ReceiptIntake>> {
        let conn = self.conn()?;
        let intake_id: Option<String> = conn
            .query_row(
                "SELECT intake_id FROM intake_expenses WHERE expense_id = ?",
                params![expense_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        match intake_id.and_then(|s| Uuid::parse_str(&s).ok()) {
            Some(id) => self.get_intake(id),
            None => Ok(None),
        }
    }
}
