//! Expense store and state machine
//!
//! All writes go through here. Invariants enforced at this boundary:
//! - amounts are fixed-point (`Money`) end to end
//! - every mutation sets `updated_by` and rotates the version token
//! - status transitions follow the allowed table and always produce a
//!   status-log row in the same transaction
//! - field changes produce one change-log row per field; callers enqueue the
//!   rows as post-commit work (see `jobs::Job::WriteChangeLog`)
//! - batch inserts are all-or-nothing

use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::models::{
    ChangeLogRow, Expense, ExpensePatch, ExpenseStatus, NewExpense, Role, StatusLogRow,
};
use crate::money::Money;

/// Filters for listing expenses
#[derive(Debug, Clone, Default)]
pub struct ExpenseFilter {
    pub project_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<ExpenseStatus>,
    pub vendor_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
}

/// One page of expenses
#[derive(Debug, Clone, Serialize)]
pub struct ExpensePage {
    pub items: Vec<Expense>,
    pub page: i64,
    pub total: i64,
}

/// Aggregate row grouped by a key (project, payment method, ...)
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub key: String,
    pub count: i64,
    pub total: Money,
}

/// Aggregate by authorization state
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusSummary {
    pub pending: SummaryCell,
    pub authorized: SummaryCell,
    pub review: SummaryCell,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SummaryCell {
    pub count: i64,
    pub total: Money,
}

/// A change captured during an update, to be written to the change log
/// after the commit.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ChangeEntry {
    pub expense_id: Uuid,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: Uuid,
    pub status_at_change: ExpenseStatus,
}

const EXPENSE_COLS: &str = "id, project_id, txn_date, amount, vendor_id, account_id, description, \
     payment_method_id, bill_ref, external_ref, status, authorized_by, status_reason, \
     updated_by, confidence, source, version_token, created_at, updated_at";

fn row_to_expense(row: &Row) -> rusqlite::Result<Expense> {
    let parse_uuid = |s: String| Uuid::parse_str(&s).unwrap_or_default();
    let opt_uuid = |s: Option<String>| s.and_then(|v| Uuid::parse_str(&v).ok());

    Ok(Expense {
        id: parse_uuid(row.get(0)?),
        project_id: parse_uuid(row.get(1)?),
        txn_date: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or_else(|_| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        amount: Money::parse(&row.get::<_, String>(3)?).unwrap_or(Money::ZERO),
        vendor_id: opt_uuid(row.get(4)?),
        account_id: opt_uuid(row.get(5)?),
        description: row.get(6)?,
        payment_method_id: opt_uuid(row.get(7)?),
        bill_ref: row.get(8)?,
        external_ref: row.get(9)?,
        status: row
            .get::<_, String>(10)?
            .parse()
            .unwrap_or(ExpenseStatus::Pending),
        authorized_by: opt_uuid(row.get(11)?),
        status_reason: row.get(12)?,
        updated_by: parse_uuid(row.get(13)?),
        confidence: row.get(14)?,
        source: row
            .get::<_, Option<String>>(15)?
            .and_then(|s| s.parse().ok()),
        version_token: parse_uuid(row.get(16)?),
        created_at: parse_datetime(&row.get::<_, String>(17)?),
        updated_at: parse_datetime(&row.get::<_, String>(18)?),
    })
}

impl Database {
    /// Insert a single expense in status `pending`.
    pub fn create_expense(&self, new: &NewExpense, updated_by: Uuid) -> Result<Uuid> {
        let ids = self.create_expense_batch(std::slice::from_ref(new), updated_by, None)?;
        Ok(ids[0])
    }

    /// Insert a batch of expenses atomically. Either every row lands or none.
    ///
    /// When an idempotency key is supplied and a previous batch used the same
    /// key, the original ids are returned and nothing is written.
    pub fn create_expense_batch(
        &self,
        items: &[NewExpense],
        updated_by: Uuid,
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Uuid>> {
        if items.is_empty() {
            return Err(Error::Validation("Batch is empty".into()));
        }

        let mut conn = self.conn()?;

        if let Some(key) = idempotency_key {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT expense_ids FROM expense_batch_keys WHERE idempotency_key = ?",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(json) = existing {
                let ids: Vec<Uuid> = serde_json::from_str(&json)?;
                return Ok(ids);
            }
        }

        let tx = conn.transaction()?;
        let now = fmt_datetime(Utc::now());
        let mut ids = Vec::with_capacity(items.len());

        for new in items {
            if new.description.trim().is_empty() {
                return Err(Error::Validation("Expense description is empty".into()));
            }
            if !new.amount.is_positive() {
                return Err(Error::Validation(format!(
                    "Expense amount must be positive, got {}",
                    new.amount
                )));
            }

            let id = Uuid::new_v4();
            let version = Uuid::new_v4();
            tx.execute(
                r#"
                INSERT INTO expenses (id, project_id, txn_date, amount, vendor_id, account_id,
                    description, payment_method_id, bill_ref, external_ref, status,
                    updated_by, confidence, source, version_token, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    id.to_string(),
                    new.project_id.to_string(),
                    new.txn_date.to_string(),
                    new.amount.to_string(),
                    new.vendor_id.map(|v| v.to_string()),
                    new.account_id.map(|v| v.to_string()),
                    new.description,
                    new.payment_method_id.map(|v| v.to_string()),
                    new.bill_ref,
                    new.external_ref,
                    updated_by.to_string(),
                    new.confidence,
                    new.source.map(|s| s.as_str()),
                    version.to_string(),
                    now,
                    now,
                ],
            )?;
            ids.push(id);
        }

        if let Some(key) = idempotency_key {
            tx.execute(
                "INSERT INTO expense_batch_keys (idempotency_key, expense_ids, created_at) VALUES (?, ?, ?)",
                params![key, serde_json::to_string(&ids)?, now],
            )?;
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Fetch one expense by id (soft-deleted rows included; they live in
    /// `review` and remain addressable for audit).
    pub fn get_expense(&self, id: Uuid) -> Result<Option<Expense>> {
        let conn = self.conn()?;
        let expense = conn
            .query_row(
                &format!("SELECT {} FROM expenses WHERE id = ?", EXPENSE_COLS),
                params![id.to_string()],
                row_to_expense,
            )
            .optional()?;
        Ok(expense)
    }

    /// Apply a field patch guarded by the version token.
    ///
    /// Returns the updated row plus the change entries to be written to the
    /// change log post-commit. A bookkeeper editing non-status fields of an
    /// authorized expense moves it to `review` in the same transaction.
    pub fn update_expense(
        &self,
        id: Uuid,
        patch: &ExpensePatch,
        version_token: Uuid,
        updated_by: Uuid,
        actor_role: Role,
    ) -> Result<(Expense, Vec<ChangeEntry>)> {
        let current = self
            .get_expense(id)?
            .ok_or_else(|| Error::NotFound(format!("Expense {}", id)))?;

        if current.version_token != version_token {
            return Err(Error::Conflict(format!(
                "Stale version token for expense {}",
                id
            )));
        }

        let mut changes: Vec<ChangeEntry> = Vec::new();
        let mut record = |field: &str, old: Option<String>, new: Option<String>| {
            if old != new {
                changes.push(ChangeEntry {
                    expense_id: id,
                    field: field.to_string(),
                    old_value: old,
                    new_value: new,
                    changed_by: updated_by,
                    status_at_change: current.status,
                });
            }
        };

        let txn_date = patch.txn_date.unwrap_or(current.txn_date);
        record(
            "txn_date",
            Some(current.txn_date.to_string()),
            Some(txn_date.to_string()),
        );
        let amount = patch.amount.unwrap_or(current.amount);
        record(
            "amount",
            Some(current.amount.to_string()),
            Some(amount.to_string()),
        );
        let vendor_id = patch.vendor_id.or(current.vendor_id);
        record(
            "vendor_id",
            current.vendor_id.map(|v| v.to_string()),
            vendor_id.map(|v| v.to_string()),
        );
        let account_id = patch.account_id.or(current.account_id);
        record(
            "account_id",
            current.account_id.map(|v| v.to_string()),
            account_id.map(|v| v.to_string()),
        );
        let description = patch
            .description
            .clone()
            .unwrap_or_else(|| current.description.clone());
        record(
            "description",
            Some(current.description.clone()),
            Some(description.clone()),
        );
        let payment_method_id = patch.payment_method_id.or(current.payment_method_id);
        record(
            "payment_method_id",
            current.payment_method_id.map(|v| v.to_string()),
            payment_method_id.map(|v| v.to_string()),
        );
        let bill_ref = patch.bill_ref.clone().or_else(|| current.bill_ref.clone());
        record(
            "bill_ref",
            current.bill_ref.clone(),
            bill_ref.clone(),
        );

        if changes.is_empty() {
            return Ok((current, changes));
        }

        // Bookkeeper edits of an authorized row force it back into review.
        let demote = current.status == ExpenseStatus::Authorized && actor_role == Role::Bookkeeper;
        let (new_status, authorized_by, status_reason) = if demote {
            (
                ExpenseStatus::Review,
                None,
                Some("Bookkeeper edit after authorization".to_string()),
            )
        } else {
            (
                current.status,
                current.authorized_by,
                current.status_reason.clone(),
            )
        };

        let new_version = Uuid::new_v4();
        let now = fmt_datetime(Utc::now());

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            r#"
            UPDATE expenses
               SET txn_date = ?, amount = ?, vendor_id = ?, account_id = ?, description = ?,
                   payment_method_id = ?, bill_ref = ?, status = ?, authorized_by = ?,
                   status_reason = ?, updated_by = ?, version_token = ?, updated_at = ?
             WHERE id = ? AND version_token = ?
            "#,
            params![
                txn_date.to_string(),
                amount.to_string(),
                vendor_id.map(|v| v.to_string()),
                account_id.map(|v| v.to_string()),
                description,
                payment_method_id.map(|v| v.to_string()),
                bill_ref,
                new_status.as_str(),
                authorized_by.map(|v| v.to_string()),
                status_reason,
                updated_by.to_string(),
                new_version.to_string(),
                now,
                id.to_string(),
                version_token.to_string(),
            ],
        )?;

        if updated == 0 {
            return Err(Error::Conflict(format!(
                "Concurrent update on expense {}",
                id
            )));
        }

        if demote {
            tx.execute(
                r#"
                INSERT INTO expense_status_log (expense_id, old_status, new_status, changed_by, reason, created_at)
                VALUES (?, 'authorized', 'review', ?, 'Bookkeeper edit after authorization', ?)
                "#,
                params![id.to_string(), updated_by.to_string(), now],
            )?;
        }

        tx.commit()?;

        let after = self
            .get_expense(id)?
            .ok_or_else(|| Error::Internal(format!("Expense {} vanished after update", id)))?;
        Ok((after, changes))
    }

    /// Transition an expense between statuses.
    ///
    /// Validates the transition table, requires the version token, writes the
    /// status-log row in the same transaction, and maintains the authorizer
    /// reference (set on entry to authorized, cleared on exit).
    pub fn set_expense_status(
        &self,
        id: Uuid,
        new_status: ExpenseStatus,
        reason: Option<&str>,
        version_token: Uuid,
        updated_by: Uuid,
    ) -> Result<Expense> {
        let current = self
            .get_expense(id)?
            .ok_or_else(|| Error::NotFound(format!("Expense {}", id)))?;

        if current.version_token != version_token {
            return Err(Error::Conflict(format!(
                "Stale version token for expense {}",
                id
            )));
        }

        if !current.status.can_transition_to(new_status) {
            return Err(Error::BusinessRule(format!(
                "Illegal transition {} -> {}",
                current.status, new_status
            )));
        }

        if new_status == ExpenseStatus::Review && reason.map_or(true, |r| r.trim().is_empty()) {
            return Err(Error::Validation(
                "A reason is required when moving an expense to review".into(),
            ));
        }

        let authorized_by = match new_status {
            ExpenseStatus::Authorized => Some(updated_by),
            _ => None,
        };

        let new_version = Uuid::new_v4();
        let now = fmt_datetime(Utc::now());

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            r#"
            UPDATE expenses
               SET status = ?, authorized_by = ?, status_reason = ?,
                   updated_by = ?, version_token = ?, updated_at = ?
             WHERE id = ? AND version_token = ?
            "#,
            params![
                new_status.as_str(),
                authorized_by.map(|v| v.to_string()),
                reason,
                updated_by.to_string(),
                new_version.to_string(),
                now,
                id.to_string(),
                version_token.to_string(),
            ],
        )?;

        if updated == 0 {
            return Err(Error::Conflict(format!(
                "Concurrent status change on expense {}",
                id
            )));
        }

        tx.execute(
            r#"
            INSERT INTO expense_status_log (expense_id, old_status, new_status, changed_by, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                id.to_string(),
                current.status.as_str(),
                new_status.as_str(),
                updated_by.to_string(),
                reason,
                now,
            ],
        )?;
        tx.commit()?;

        // Capture human overrides of engine decisions for offline learning.
        if let Err(e) = self.capture_override_if_engine_acted(id, &current, new_status, updated_by)
        {
            warn!(expense = %id, error = %e, "Override capture failed");
        }

        self.get_expense(id)?
            .ok_or_else(|| Error::Internal(format!("Expense {} vanished after update", id)))
    }

    /// Conditional authorize for the auto-auth engine: only flips rows that
    /// are still pending, so a concurrent human action wins the race.
    /// Returns false when the row was not in `pending` anymore.
    pub fn authorize_if_pending(&self, id: Uuid, bot_user: Uuid, reason: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_datetime(Utc::now());
        let updated = tx.execute(
            r#"
            UPDATE expenses
               SET status = 'authorized', authorized_by = ?, status_reason = ?,
                   updated_by = ?, version_token = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'
            "#,
            params![
                bot_user.to_string(),
                reason,
                bot_user.to_string(),
                Uuid::new_v4().to_string(),
                now,
                id.to_string(),
            ],
        )?;
        if updated == 1 {
            tx.execute(
                r#"
                INSERT INTO expense_status_log (expense_id, old_status, new_status, changed_by, reason, created_at)
                VALUES (?, 'pending', 'authorized', ?, ?, ?)
                "#,
                params![id.to_string(), bot_user.to_string(), reason, now],
            )?;
        }
        tx.commit()?;
        Ok(updated == 1)
    }

    /// Soft delete: move to review, clear the authorizer, record the reason.
    pub fn soft_delete_expense(&self, id: Uuid, reason: &str, updated_by: Uuid) -> Result<()> {
        let current = self
            .get_expense(id)?
            .ok_or_else(|| Error::NotFound(format!("Expense {}", id)))?;

        let now = fmt_datetime(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            UPDATE expenses
               SET status = 'review', authorized_by = NULL, status_reason = ?,
                   deleted = 1, updated_by = ?, version_token = ?, updated_at = ?
             WHERE id = ?
            "#,
            params![
                reason,
                updated_by.to_string(),
                Uuid::new_v4().to_string(),
                now,
                id.to_string(),
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO expense_status_log (expense_id, old_status, new_status, changed_by, reason, created_at)
            VALUES (?, ?, 'review', ?, ?, ?)
            "#,
            params![
                id.to_string(),
                current.status.as_str(),
                updated_by.to_string(),
                reason,
                now,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn filter_clauses(filter: &ExpenseFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = vec!["deleted = 0".to_string()];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(p) = filter.project_id {
            conditions.push("project_id = ?".into());
            params.push(Box::new(p.to_string()));
        }
        if let Some(from) = filter.from {
            conditions.push("txn_date >= ?".into());
            params.push(Box::new(from.to_string()));
        }
        if let Some(to) = filter.to {
            conditions.push("txn_date <= ?".into());
            params.push(Box::new(to.to_string()));
        }
        if let Some(s) = filter.status {
            conditions.push("status = ?".into());
            params.push(Box::new(s.as_str().to_string()));
        }
        if let Some(v) = filter.vendor_id {
            conditions.push("vendor_id = ?".into());
            params.push(Box::new(v.to_string()));
        }
        if let Some(a) = filter.account_id {
            conditions.push("account_id = ?".into());
            params.push(Box::new(a.to_string()));
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }

    /// One page of matching expenses, ordered by transaction date descending.
    pub fn list_expenses(
        &self,
        filter: &ExpenseFilter,
        page: i64,
        size: i64,
    ) -> Result<ExpensePage> {
        let size = size.clamp(1, 1000);
        let page = page.max(0);
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::filter_clauses(filter);

        let total: i64 = {
            let sql = format!("SELECT COUNT(*) FROM expenses {}", where_clause);
            let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
            conn.query_row(&sql, refs.as_slice(), |row| row.get(0))?
        };

        let sql = format!(
            "SELECT {} FROM expenses {} ORDER BY txn_date DESC, id DESC LIMIT ? OFFSET ?",
            EXPENSE_COLS, where_clause
        );
        params.push(Box::new(size));
        params.push(Box::new(page * size));
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(refs.as_slice(), row_to_expense)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ExpensePage { items, page, total })
    }

    /// Fetch every matching row via explicit pagination. All summation paths
    /// go through this so aggregates can never silently truncate.
    pub fn page_all_expenses(&self, filter: &ExpenseFilter) -> Result<Vec<Expense>> {
        const PAGE_SIZE: i64 = 500;
        let mut out = Vec::new();
        let mut page = 0;
        loop {
            let chunk = self.list_expenses(filter, page, PAGE_SIZE)?;
            let fetched = chunk.items.len() as i64;
            out.extend(chunk.items);
            if fetched < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    /// Aggregate by project.
    pub fn summarize_by_project(&self, filter: &ExpenseFilter) -> Result<Vec<SummaryRow>> {
        self.summarize_by_key(filter, |e| e.project_id.to_string())
    }

    /// Aggregate by payment method (the ledger's transaction type).
    pub fn summarize_by_payment_method(&self, filter: &ExpenseFilter) -> Result<Vec<SummaryRow>> {
        self.summarize_by_key(filter, |e| {
            e.payment_method_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unassigned".to_string())
        })
    }

    fn summarize_by_key<F: Fn(&Expense) -> String>(
        &self,
        filter: &ExpenseFilter,
        key_fn: F,
    ) -> Result<Vec<SummaryRow>> {
        let all = self.page_all_expenses(filter)?;
        let mut grouped: std::collections::BTreeMap<String, (i64, Money)> =
            std::collections::BTreeMap::new();
        for e in &all {
            let entry = grouped.entry(key_fn(e)).or_insert((0, Money::ZERO));
            entry.0 += 1;
            entry.1 += e.amount;
        }
        Ok(grouped
            .into_iter()
            .map(|(key, (count, total))| SummaryRow { key, count, total })
            .collect())
    }

    /// Aggregate by authorization state.
    pub fn summarize_by_status(&self, filter: &ExpenseFilter) -> Result<StatusSummary> {
        let mut filter = filter.clone();
        filter.status = None;
        let all = self.page_all_expenses(&filter)?;
        let mut out = StatusSummary::default();
        for e in &all {
            let cell = match e.status {
                ExpenseStatus::Pending => &mut out.pending,
                ExpenseStatus::Authorized => &mut out.authorized,
                ExpenseStatus::Review => &mut out.review,
            };
            cell.count += 1;
            cell.total += e.amount;
        }
        Ok(out)
    }

    /// Duplicate probe for R1: another expense in the project with identical
    /// (vendor, amount, date, description fingerprint) in pending/authorized.
    pub fn find_exact_duplicate(
        &self,
        project_id: Uuid,
        vendor_id: Option<Uuid>,
        amount: Money,
        txn_date: NaiveDate,
        description: &str,
        exclude_id: Option<Uuid>,
    ) -> Result<Option<Uuid>> {
        let vendor_id = match vendor_id {
            Some(v) => v,
            None => return Ok(None),
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, description FROM expenses
             WHERE project_id = ? AND vendor_id = ? AND amount = ? AND txn_date = ?
               AND status IN ('pending', 'authorized') AND deleted = 0
            "#,
        )?;
        let target = fingerprint::normalize(description);
        let rows = stmt.query_map(
            params![
                project_id.to_string(),
                vendor_id.to_string(),
                amount.to_string(),
                txn_date.to_string(),
            ],
            |row| {
                let id: String = row.get(0)?;
                let desc: String = row.get(1)?;
                Ok((id, desc))
            },
        )?;
        for row in rows {
            let (id, desc) = row?;
            let id = Uuid::parse_str(&id).unwrap_or_default();
            if Some(id) == exclude_id {
                continue;
            }
            if fingerprint::normalize(&desc) == target {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Pending expenses for a project, oldest first (auto-auth candidates).
    pub fn pending_expenses(&self, project_id: Uuid) -> Result<Vec<Expense>> {
        self.page_all_expenses(&ExpenseFilter {
            project_id: Some(project_id),
            status: Some(ExpenseStatus::Pending),
            ..Default::default()
        })
    }

    /// Write change-log rows (invoked by the background job post-commit).
    pub fn insert_change_rows(&self, entries: &[ChangeEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_datetime(Utc::now());
        for c in entries {
            tx.execute(
                r#"
                INSERT INTO expense_change_log (expense_id, field, old_value, new_value, changed_by, status_at_change, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    c.expense_id.to_string(),
                    c.field,
                    c.old_value,
                    c.new_value,
                    c.changed_by.to_string(),
                    c.status_at_change.as_str(),
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Change-log rows for one expense, oldest first.
    pub fn change_log(&self, expense_id: Uuid) -> Result<Vec<ChangeLogRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, expense_id, field, old_value, new_value, changed_by, status_at_change, created_at
              FROM expense_change_log WHERE expense_id = ? ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map(params![expense_id.to_string()], |row| {
                Ok(ChangeLogRow {
                    id: row.get(0)?,
                    expense_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
                    field: row.get(2)?,
                    old_value: row.get(3)?,
                    new_value: row.get(4)?,
                    changed_by: Uuid::parse_str(&row.get::<_, String>(5)?).unwrap_or_default(),
                    status_at_change: row
                        .get::<_, String>(6)?
                        .parse()
                        .unwrap_or(ExpenseStatus::Pending),
                    created_at: parse_datetime(&row.get::<_, String>(7)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Status-log rows for one expense, oldest first.
    pub fn status_log(&self, expense_id: Uuid) -> Result<Vec<StatusLogRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, expense_id, old_status, new_status, changed_by, reason, created_at
              FROM expense_status_log WHERE expense_id = ? ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map(params![expense_id.to_string()], |row| {
                Ok(StatusLogRow {
                    id: row.get(0)?,
                    expense_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
                    old_status: row
                        .get::<_, String>(2)?
                        .parse()
                        .unwrap_or(ExpenseStatus::Pending),
                    new_status: row
                        .get::<_, String>(3)?
                        .parse()
                        .unwrap_or(ExpenseStatus::Pending),
                    changed_by: Uuid::parse_str(&row.get::<_, String>(4)?).unwrap_or_default(),
                    reason: row.get(5)?,
                    created_at: parse_datetime(&row.get::<_, String>(6)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Reconciliation report: expenses whose updates produced no change-log
    /// rows at all (a change-log job was lost). Detection only; the commit
    /// itself is never undone.
    pub fn expenses_missing_change_log(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT e.id FROM expenses e
             WHERE e.updated_at > e.created_at
               AND NOT EXISTS (SELECT 1 FROM expense_change_log c WHERE c.expense_id = e.id)
               AND NOT EXISTS (SELECT 1 FROM expense_status_log s WHERE s.expense_id = e.id)
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect())
    }
}
