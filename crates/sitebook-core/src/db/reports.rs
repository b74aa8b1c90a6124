//! Auto-auth reports, override capture, pending-info tracking, and
//! reconciler suggestions

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{AuthReport, AuthSummary, DecisionRecord, Expense, ExpenseStatus};

/// An outstanding missing-info request
#[derive(Debug, Clone)]
pub struct PendingInfoRow {
    pub expense_id: Uuid,
    pub project_id: Uuid,
    pub missing_fields: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub message_id: Option<Uuid>,
}

/// Follow-up bucket for a pending-info row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowupAction {
    /// First reminder (24h).
    Followup,
    /// Second reminder plus escalation mention (48h).
    Escalate,
    /// Stop nagging, just record it (72h+).
    Stale,
}

impl Database {
    /// Persist one auto-auth run. The run id deduplicates digests: a rerun
    /// with the same id is dropped and the original report id returned.
    pub fn save_auth_report(
        &self,
        run_id: Uuid,
        project_id: Uuid,
        summary: &AuthSummary,
        decisions: &[DecisionRecord],
    ) -> Result<Uuid> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM auth_reports WHERE run_id = ?",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(Uuid::parse_str(&id).unwrap_or_default());
        }

        let id = Uuid::new_v4();
        conn.execute(
            r#"
            INSERT INTO auth_reports (id, run_id, project_id, summary, decisions, digested, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
            params![
                id.to_string(),
                run_id.to_string(),
                project_id.to_string(),
                serde_json::to_string(summary)?,
                serde_json::to_string(decisions)?,
                fmt_datetime(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    pub fn get_auth_report(&self, id: Uuid) -> Result<Option<AuthReport>> {
        let conn = self.conn()?;
        let report = conn
            .query_row(
                "SELECT id, run_id, project_id, summary, decisions, created_at FROM auth_reports WHERE id = ?",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, run_id, project_id, summary, decisions, created_at)) = report else {
            return Ok(None);
        };
        Ok(Some(AuthReport {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
            project_id: Uuid::parse_str(&project_id).unwrap_or_default(),
            summary: serde_json::from_str(&summary)?,
            decisions: serde_json::from_str(&decisions)?,
            created_at: parse_datetime(&created_at),
        }))
    }

    /// Reports for a project not yet folded into a digest.
    pub fn undigested_reports(&self, project_id: Uuid) -> Result<Vec<AuthReport>> {
        let conn = self.conn()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM auth_reports WHERE project_id = ? AND digested = 0 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![project_id.to_string()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        drop(conn);

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.get_auth_report(Uuid::parse_str(&id).unwrap_or_default())? {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Projects that have undigested reports waiting for a digest flush.
    pub fn projects_with_undigested_reports(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT project_id FROM auth_reports WHERE digested = 0")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect())
    }

    pub fn mark_reports_digested(&self, report_ids: &[Uuid]) -> Result<()> {
        let conn = self.conn()?;
        for id in report_ids {
            conn.execute(
                "UPDATE auth_reports SET digested = 1 WHERE id = ?",
                params![id.to_string()],
            )?;
        }
        Ok(())
    }

    /// The engine's most recent decision touching an expense, if any.
    pub fn last_decision_for_expense(
        &self,
        expense_id: Uuid,
    ) -> Result<Option<DecisionRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT decisions FROM auth_reports ORDER BY created_at DESC LIMIT 50")?;
        let blobs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for blob in blobs {
            let decisions: Vec<DecisionRecord> = serde_json::from_str(&blob)?;
            if let Some(d) = decisions.into_iter().find(|d| d.expense_id == expense_id) {
                return Ok(Some(d));
            }
        }
        Ok(None)
    }

    /// Record a human override when a status change lands on an expense the
    /// engine acted on most recently. Called from the status write path.
    pub(crate) fn capture_override_if_engine_acted(
        &self,
        expense_id: Uuid,
        before: &Expense,
        new_status: ExpenseStatus,
        changed_by: Uuid,
    ) -> Result<()> {
        // Only human actions count as overrides.
        let bot = self.bot_user_id()?;
        if changed_by == bot {
            return Ok(());
        }
        // The engine must have been the last actor on the row.
        if before.updated_by != bot && before.authorized_by != Some(bot) {
            return Ok(());
        }
        let Some(decision) = self.last_decision_for_expense(expense_id)? else {
            return Ok(());
        };

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO auth_overrides (expense_id, original_rule, original_decision, new_status, changed_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                expense_id.to_string(),
                decision.rule,
                decision.decision.as_str(),
                new_status.as_str(),
                changed_by.to_string(),
                fmt_datetime(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Track a missing-info request (upsert keyed by expense).
    pub fn track_pending_info(
        &self,
        expense_id: Uuid,
        project_id: Uuid,
        missing_fields: &[String],
        message_id: Option<Uuid>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO pending_info (expense_id, project_id, missing_fields, requested_at, resolved_at, message_id)
            VALUES (?, ?, ?, ?, NULL, ?)
            ON CONFLICT(expense_id) DO UPDATE SET
                missing_fields = excluded.missing_fields,
                resolved_at = NULL
            "#,
            params![
                expense_id.to_string(),
                project_id.to_string(),
                serde_json::to_string(missing_fields)?,
                fmt_datetime(Utc::now()),
                message_id.map(|m| m.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Resolve a pending-info row once the data arrives.
    pub fn resolve_pending_info(&self, expense_id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_info SET resolved_at = ? WHERE expense_id = ? AND resolved_at IS NULL",
            params![fmt_datetime(Utc::now()), expense_id.to_string()],
        )?;
        Ok(())
    }

    /// Unresolved pending-info rows bucketed by age: follow-up at 24h,
    /// escalate at 48h, stale at 72h.
    pub fn pending_info_followups(
        &self,
        followup_hours: i64,
        escalation_hours: i64,
    ) -> Result<Vec<(PendingInfoRow, FollowupAction)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT expense_id, project_id, missing_fields, requested_at, message_id
              FROM pending_info WHERE resolved_at IS NULL
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let now = Utc::now();
        let mut out = Vec::new();
        for (expense_id, project_id, fields, requested_at, message_id) in rows {
            let requested_at = parse_datetime(&requested_at);
            let age = now - requested_at;
            let action = if age >= Duration::hours(72) {
                FollowupAction::Stale
            } else if age >= Duration::hours(escalation_hours) {
                FollowupAction::Escalate
            } else if age >= Duration::hours(followup_hours) {
                FollowupAction::Followup
            } else {
                continue;
            };
            out.push((
                PendingInfoRow {
                    expense_id: Uuid::parse_str(&expense_id).unwrap_or_default(),
                    project_id: Uuid::parse_str(&project_id).unwrap_or_default(),
                    missing_fields: serde_json::from_str(&fields)?,
                    requested_at,
                    message_id: message_id.and_then(|s| Uuid::parse_str(&s).ok()),
                },
                action,
            ));
        }
        Ok(out)
    }

    /// Persist a reconciler suggestion (not applied).
    pub fn save_reconcile_suggestion(
        &self,
        intake_id: Uuid,
        finding: &str,
        suggestion: &serde_json::Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO reconcile_suggestions (id, intake_id, finding, suggestion, applied, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
            params![
                id.to_string(),
                intake_id.to_string(),
                finding,
                suggestion.to_string(),
                fmt_datetime(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    pub fn mark_suggestion_applied(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE reconcile_suggestions SET applied = 1 WHERE id = ?",
            params![id.to_string()],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("Suggestion {}", id)));
        }
        Ok(())
    }

    pub fn suggestions_for_intake(
        &self,
        intake_id: Uuid,
    ) -> Result<Vec<(Uuid, String, serde_json::Value, bool)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, finding, suggestion, applied FROM reconcile_suggestions
             WHERE intake_id = ? ORDER BY created_at
            "#,
        )?;
        let rows = stmt
            .query_map(params![intake_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? != 0,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, finding, suggestion, applied)| {
                (
                    Uuid::parse_str(&id).unwrap_or_default(),
                    finding,
                    serde_json::from_str(&suggestion).unwrap_or(serde_json::Value::Null),
                    applied,
                )
            })
            .collect())
    }
}
