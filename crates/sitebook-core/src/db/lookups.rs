//! Master-data lookups: projects, vendors, accounts, payment methods, and
//! the bills staging table
//!
//! These are read-only collaborators from the core's point of view. Names
//! are resolved per operation and never cached beyond it.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::Database;
use crate::error::Result;
use crate::models::NamedRef;
use crate::money::Money;

/// A staged bill imported from the reference accounting system
#[derive(Debug, Clone)]
pub struct BillRow {
    pub id: Uuid,
    pub bill_ref: String,
    pub vendor_name: Option<String>,
    pub total: Option<Money>,
    pub bill_date: Option<NaiveDate>,
    pub expense_id: Option<Uuid>,
    pub receipt_key: Option<String>,
    pub status: String,
}

impl Database {
    pub fn upsert_project(&self, name: &str, stage: &str) -> Result<Uuid> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM projects WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            conn.execute(
                "UPDATE projects SET stage = ? WHERE id = ?",
                params![stage, id],
            )?;
            return Ok(Uuid::parse_str(&id).unwrap_or_default());
        }
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO projects (id, name, stage) VALUES (?, ?, ?)",
            params![id.to_string(), name, stage],
        )?;
        Ok(id)
    }

    /// Current construction stage for a project, defaulting to General.
    pub fn project_stage(&self, project_id: Uuid) -> Result<String> {
        let conn = self.conn()?;
        let stage: Option<String> = conn
            .query_row(
                "SELECT stage FROM projects WHERE id = ?",
                params![project_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stage.unwrap_or_else(|| "General".to_string()))
    }

    pub fn project_name(&self, project_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn()?;
        let name = conn
            .query_row(
                "SELECT name FROM projects WHERE id = ?",
                params![project_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn upsert_vendor(&self, name: &str) -> Result<Uuid> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM vendors WHERE name = ? COLLATE NOCASE",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(Uuid::parse_str(&id).unwrap_or_default());
        }
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO vendors (id, name) VALUES (?, ?)",
            params![id.to_string(), name],
        )?;
        Ok(id)
    }

    pub fn list_vendors(&self) -> Result<Vec<NamedRef>> {
        self.list_named("vendors")
    }

    /// Find a vendor whose name fuzzy-matches the given string, using
    /// Levenshtein-based similarity against the threshold (0-100).
    pub fn match_vendor(&self, name: &str, threshold: f64) -> Result<Option<NamedRef>> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let mut best: Option<(NamedRef, f64)> = None;
        for vendor in self.list_vendors()? {
            let candidate = vendor.name.trim().to_lowercase();
            let max_len = needle.len().max(candidate.len());
            if max_len == 0 {
                continue;
            }
            let dist = strsim::levenshtein(&needle, &candidate) as f64;
            let similarity = (1.0 - dist / max_len as f64) * 100.0;
            if similarity >= threshold
                && best.as_ref().map_or(true, |(_, s)| similarity > *s)
            {
                best = Some((vendor, similarity));
            }
        }
        Ok(best.map(|(v, _)| v))
    }

    pub fn upsert_account(&self, name: &str, acct_num: Option<&str>) -> Result<Uuid> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM accounts WHERE name = ? COLLATE NOCASE",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(Uuid::parse_str(&id).unwrap_or_default());
        }
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO accounts (id, name, acct_num) VALUES (?, ?, ?)",
            params![id.to_string(), name, acct_num],
        )?;
        Ok(id)
    }

    /// Ordered account list for categorization prompts. Labor accounts are
    /// excluded: labor never auto-categorizes from receipt text.
    pub fn categorization_accounts(&self) -> Result<Vec<NamedRef>> {
        Ok(self
            .list_named("accounts")?
            .into_iter()
            .filter(|a| !a.name.to_lowercase().contains("labor"))
            .collect())
    }

    pub fn account_name(&self, account_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn()?;
        let name = conn
            .query_row(
                "SELECT name FROM accounts WHERE id = ?",
                params![account_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn vendor_name(&self, vendor_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn()?;
        let name = conn
            .query_row(
                "SELECT name FROM vendors WHERE id = ?",
                params![vendor_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn upsert_payment_method(&self, name: &str) -> Result<Uuid> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM payment_methods WHERE name = ? COLLATE NOCASE",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(Uuid::parse_str(&id).unwrap_or_default());
        }
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO payment_methods (id, name) VALUES (?, ?)",
            params![id.to_string(), name],
        )?;
        Ok(id)
    }

    fn list_named(&self, table: &str) -> Result<Vec<NamedRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT id, name FROM {} ORDER BY name", table))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, name)| {
                Uuid::parse_str(&id).ok().map(|id| NamedRef { id, name })
            })
            .collect())
    }

    /// Bills that reference an expense directly or whose (vendor, total,
    /// date) could hint at one. Used by R2_BILL_HINT.
    pub fn bills_for_hint(&self, expense_id: Uuid) -> Result<Vec<BillRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, bill_ref, vendor_name, total, bill_date, expense_id, receipt_key, status
              FROM bills WHERE expense_id = ? OR expense_id IS NULL
            "#,
        )?;
        let rows = stmt
            .query_map(params![expense_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(
                |(id, bill_ref, vendor_name, total, bill_date, expense_id, receipt_key, status)| {
                    BillRow {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        bill_ref,
                        vendor_name,
                        total: total.and_then(|t| Money::parse(&t).ok()),
                        bill_date: bill_date.and_then(|d| d.parse().ok()),
                        expense_id: expense_id.and_then(|e| Uuid::parse_str(&e).ok()),
                        receipt_key,
                        status,
                    }
                },
            )
            .collect())
    }

    /// Insert a staged bill (QuickBooks import path).
    pub fn stage_bill(
        &self,
        bill_ref: &str,
        vendor_name: Option<&str>,
        total: Option<Money>,
        bill_date: Option<NaiveDate>,
        expense_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO bills (id, bill_ref, vendor_name, total, bill_date, expense_id, status)
            VALUES (?, ?, ?, ?, ?, ?, 'open')
            "#,
            params![
                id.to_string(),
                bill_ref,
                vendor_name,
                total.map(|t| t.to_string()),
                bill_date.map(|d| d.to_string()),
                expense_id.map(|e| e.to_string()),
            ],
        )?;
        Ok(id)
    }
}
