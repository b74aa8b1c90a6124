//! Auto-authorization engine
//!
//! Scans pending expenses for a project and applies rules in order, first
//! match wins:
//!
//! - R1_EXACT_DUP         duplicate of an existing pending/authorized row
//! - R2_BILL_HINT         a staged bill vouches for the expense
//! - R3_RECEIPT_SUFFICIENT a linked intake produced the expense
//! - R4_MISSING_INFO      required fields absent; humans get a prompt
//! - R5_POLICY_ESCALATE   amount or account policy requires a human
//! - R6_HEALTH            stale pending rows escalate during sweeps
//!
//! Mutations are conditional updates (`... WHERE status='pending'`) so a
//! concurrent human action always wins; the lost race is recorded on the
//! decision. Each run persists one report; chat output is a consolidated
//! per-project digest flushed on a cadence, not one message per expense.

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::models::{
    AuthDecision, AuthReport, AuthSummary, DecisionRecord, Expense, ExpenseStatus,
};
use crate::money::Money;

/// Days within which a bill date corroborates an expense date.
const BILL_DATE_WINDOW_DAYS: i64 = 3;

/// Outcome of one engine run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub report_id: Uuid,
    pub summary: AuthSummary,
    pub decisions: Vec<DecisionRecord>,
}

pub struct AutoAuthEngine {
    db: Database,
    config: Config,
}

/// Levenshtein-based similarity, 0-100.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let max_len = a.len().max(b.len()) as f64;
    let dist = strsim::levenshtein(&a, &b) as f64;
    (1.0 - dist / max_len) * 100.0
}

impl AutoAuthEngine {
    pub fn new(db: Database, config: Config) -> Self {
        Self { db, config }
    }

    /// Process a project's pending expenses. `window` narrows by transaction
    /// date; `health_sweep` additionally escalates stale rows (R6).
    pub async fn run(
        &self,
        project_id: Uuid,
        window: Option<(NaiveDate, NaiveDate)>,
        health_sweep: bool,
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let bot = self.db.bot_user_id()?;

        let mut candidates = self.db.pending_expenses(project_id)?;
        if let Some((from, to)) = window {
            candidates.retain(|e| e.txn_date >= from && e.txn_date <= to);
        }

        let mut summary = AuthSummary::default();
        let mut decisions: Vec<DecisionRecord> = Vec::new();
        let mut missing_prompts: Vec<(Expense, Vec<String>)> = Vec::new();

        for expense in &candidates {
            let vendor_name = match expense.vendor_id {
                Some(v) => self.db.vendor_name(v)?.unwrap_or_default(),
                None => String::new(),
            };

            // R1: exact duplicate
            if let Some(paired) = self.db.find_exact_duplicate(
                project_id,
                expense.vendor_id,
                expense.amount,
                expense.txn_date,
                &expense.description,
                Some(expense.id),
            )? {
                summary.duplicates += 1;
                decisions.push(decision(
                    expense,
                    &vendor_name,
                    "R1_EXACT_DUP",
                    AuthDecision::Duplicate,
                    &format!("Duplicate of expense {}", paired),
                    vec![],
                    false,
                ));
                continue;
            }

            // R2: a staged bill vouches for this expense
            if let Some(bill_ref) = self.bill_hint(expense, &vendor_name)? {
                if self.config.bill_auth_enabled {
                    let reason = format!("Bill {} corroborates this expense", bill_ref);
                    let won = self.db.authorize_if_pending(expense.id, bot, &reason)?;
                    if won {
                        summary.authorized += 1;
                        summary.authorized_amount += expense.amount;
                    }
                    decisions.push(decision(
                        expense,
                        &vendor_name,
                        "R2_BILL_HINT",
                        AuthDecision::Authorized,
                        &reason,
                        vec![],
                        !won,
                    ));
                    continue;
                }
                // Bill authorization disabled: the hint is noted but the
                // row falls through to the remaining rules.
            }

            // R3: a linked intake produced this expense
            if let Some(intake) = self.db.intake_for_expense(expense.id)? {
                if intake.status == crate::models::IntakeStatus::Linked {
                    let reason = format!("Receipt intake {} is linked", intake.id);
                    let won = self.db.authorize_if_pending(expense.id, bot, &reason)?;
                    if won {
                        summary.authorized += 1;
                        summary.authorized_amount += expense.amount;
                    }
                    decisions.push(decision(
                        expense,
                        &vendor_name,
                        "R3_RECEIPT_SUFFICIENT",
                        AuthDecision::Authorized,
                        &reason,
                        vec![],
                        !won,
                    ));
                    continue;
                }
            }

            // R4: required fields
            let missing = missing_fields(expense);
            if !missing.is_empty() {
                summary.missing_info += 1;
                self.db
                    .track_pending_info(expense.id, project_id, &missing, None)?;
                decisions.push(decision(
                    expense,
                    &vendor_name,
                    "R4_MISSING_INFO",
                    AuthDecision::MissingInfo,
                    &format!("Missing: {}", missing.join(", ")),
                    missing.clone(),
                    false,
                ));
                missing_prompts.push(((*expense).clone(), missing));
                continue;
            }
            // Fields are complete now; clear any stale request.
            self.db.resolve_pending_info(expense.id)?;

            // R5: policy escalation
            if let Some(reason) = self.policy_escalation(expense)? {
                summary.escalated += 1;
                decisions.push(decision(
                    expense,
                    &vendor_name,
                    "R5_POLICY_ESCALATE",
                    AuthDecision::Escalated,
                    &reason,
                    vec![],
                    false,
                ));
                continue;
            }

            // R6: stale pending rows, health sweeps only
            if health_sweep {
                let age_days = (Utc::now() - expense.created_at).num_days();
                if age_days > self.config.pending_escalate_days {
                    summary.escalated += 1;
                    decisions.push(decision(
                        expense,
                        &vendor_name,
                        "R6_HEALTH",
                        AuthDecision::Escalated,
                        &format!("Pending for {} days with no qualifying rule", age_days),
                        vec![],
                        false,
                    ));
                }
            }
        }

        let report_id = self
            .db
            .save_auth_report(run_id, project_id, &summary, &decisions)?;

        // R4 prompts go out immediately; everything else waits for the
        // digest flush.
        if !missing_prompts.is_empty() {
            self.post_missing_info_prompt(project_id, bot, &missing_prompts)?;
        }

        info!(
            project = %project_id,
            authorized = summary.authorized,
            duplicates = summary.duplicates,
            missing = summary.missing_info,
            escalated = summary.escalated,
            "Auto-auth run complete"
        );

        Ok(RunOutcome {
            run_id,
            report_id,
            summary,
            decisions,
        })
    }

    /// R2 probe: a bill referencing the expense by id, or matching on
    /// (vendor similarity, amount within tolerance, date within ±3 days).
    fn bill_hint(&self, expense: &Expense, vendor_name: &str) -> Result<Option<String>> {
        let bills = self.db.bills_for_hint(expense.id)?;
        for bill in bills {
            if bill.expense_id == Some(expense.id) {
                return Ok(Some(bill.bill_ref));
            }

            let vendor_ok = match &bill.vendor_name {
                Some(name) if !vendor_name.is_empty() => {
                    string_similarity(name, vendor_name) >= self.config.fuzzy_threshold
                }
                _ => false,
            };
            if !vendor_ok {
                continue;
            }
            let amount_ok = bill.total.map_or(false, |t| {
                t.within_tolerance(
                    expense.amount,
                    self.config.amount_tolerance_cents,
                    self.config.amount_tolerance_pct,
                )
            });
            if !amount_ok {
                continue;
            }
            let date_ok = bill.bill_date.map_or(false, |d| {
                (d - expense.txn_date).num_days().abs() <= BILL_DATE_WINDOW_DAYS
            });
            if date_ok {
                return Ok(Some(bill.bill_ref));
            }
        }
        Ok(None)
    }

    /// R5 probe: amount ceiling and the escalation account list.
    fn policy_escalation(&self, expense: &Expense) -> Result<Option<String>> {
        if expense.amount.cents() > self.config.auth_amount_limit_cents {
            return Ok(Some(format!(
                "Amount {} exceeds the auto-authorization ceiling",
                expense.amount
            )));
        }

        if let Some(account_id) = expense.account_id {
            let name = self
                .db
                .account_name(account_id)?
                .unwrap_or_default()
                .to_lowercase();
            if self
                .config
                .escalation_accounts
                .iter()
                .any(|a| !a.is_empty() && name.contains(a))
            {
                return Ok(Some(format!("Account '{}' is on the escalation list", name)));
            }
        }

        Ok(None)
    }

    fn post_missing_info_prompt(
        &self,
        project_id: Uuid,
        bot: Uuid,
        prompts: &[(Expense, Vec<String>)],
    ) -> Result<()> {
        let mut lines = vec![format!(
            "{} expense{} need additional info before authorization:",
            prompts.len(),
            if prompts.len() == 1 { "" } else { "s" }
        )];
        for (expense, missing) in prompts.iter().take(20) {
            lines.push(format!(
                "- **{}** (${}) missing: {}",
                truncate(&expense.description, 40),
                expense.amount,
                missing.join(", ")
            ));
        }
        if prompts.len() > 20 {
            lines.push(format!("...and {} more", prompts.len() - 20));
        }

        let channel = format!("project_general:{}", project_id);
        let metadata = json!({
            "type": "auto_auth_missing_info",
            "count": prompts.len(),
            "expense_ids": prompts.iter().map(|(e, _)| e.id.to_string()).collect::<Vec<_>>(),
        });
        if let Err(e) = self.db.post_message(
            &channel,
            bot,
            &lines.join("\n"),
            None,
            Some(&metadata),
            None,
            &[],
        ) {
            warn!(error = %e, "Missing-info prompt failed to post");
        }
        Ok(())
    }

    /// Compose and post the consolidated digest for one project, folding in
    /// every undigested report. Returns the number of reports digested.
    pub fn flush_digest(&self, project_id: Uuid) -> Result<usize> {
        let reports = self.db.undigested_reports(project_id)?;
        if reports.is_empty() {
            return Ok(0);
        }

        let bot = self.db.bot_user_id()?;
        let project_name = self
            .db
            .project_name(project_id)?
            .unwrap_or_else(|| project_id.to_string());
        let body = compose_digest(&project_name, &reports);

        let channel = format!("project_general:{}", project_id);
        let metadata = json!({
            "type": "auto_auth_digest",
            "report_ids": reports.iter().map(|r| r.id.to_string()).collect::<Vec<_>>(),
        });
        self.db
            .post_message(&channel, bot, &body, None, Some(&metadata), None, &[])?;

        let ids: Vec<Uuid> = reports.iter().map(|r| r.id).collect();
        self.db.mark_reports_digested(&ids)?;
        Ok(ids.len())
    }

    /// Explain the engine's latest decision for one expense (agent surface).
    pub fn explain_decision(&self, expense_id: Uuid) -> Result<Option<String>> {
        let Some(d) = self.db.last_decision_for_expense(expense_id)? else {
            return Ok(None);
        };
        Ok(Some(format!(
            "Rule {} decided '{}': {}",
            d.rule,
            d.decision,
            d.reason
        )))
    }

    /// Follow-up pass over unresolved missing-info requests: 24h reminder,
    /// 48h escalation mention, 72h stale.
    pub fn run_followups(&self) -> Result<(usize, usize, usize)> {
        let bot = self.db.bot_user_id()?;
        let followups = self.db.pending_info_followups(24, 48)?;
        let (mut reminded, mut escalated, mut stale) = (0, 0, 0);

        for (row, action) in followups {
            use crate::db::FollowupAction::*;
            match action {
                Stale => stale += 1,
                Followup | Escalate => {
                    let hours = (Utc::now() - row.requested_at).num_hours();
                    let body = format!(
                        "Still waiting on {} for expense {} ({}h pending). \
                         It cannot be authorized until the data arrives.",
                        row.missing_fields.join(", "),
                        row.expense_id,
                        hours
                    );
                    let channel = format!("project_general:{}", row.project_id);
                    let metadata = json!({
                        "type": if action == Escalate { "auto_auth_escalation_followup" } else { "auto_auth_followup" },
                        "expense_id": row.expense_id.to_string(),
                    });
                    if let Err(e) = self.db.post_message(
                        &channel,
                        bot,
                        &body,
                        None,
                        Some(&metadata),
                        None,
                        &[],
                    ) {
                        warn!(error = %e, "Follow-up message failed to post");
                        continue;
                    }
                    if action == Escalate {
                        escalated += 1;
                    } else {
                        reminded += 1;
                    }
                }
            }
        }
        Ok((reminded, escalated, stale))
    }

    /// Health sweep across every project with stale pending rows (R6).
    pub async fn health_sweep(&self) -> Result<Vec<RunOutcome>> {
        let cutoff = Utc::now() - Duration::days(self.config.pending_escalate_days);
        let projects = {
            let conn = self.db.conn()?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT project_id FROM expenses WHERE status = 'pending' AND created_at < ?",
            )?;
            let rows = stmt
                .query_map([cutoff.to_rfc3339()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut outcomes = Vec::new();
        for p in projects {
            if let Ok(project_id) = Uuid::parse_str(&p) {
                outcomes.push(self.run(project_id, None, true).await?);
            }
        }
        Ok(outcomes)
    }
}

fn missing_fields(expense: &Expense) -> Vec<String> {
    let mut missing = Vec::new();
    if expense.vendor_id.is_none() {
        missing.push("vendor".to_string());
    }
    if expense.account_id.is_none() {
        missing.push("account".to_string());
    }
    if !expense.amount.is_positive() {
        missing.push("amount".to_string());
    }
    // txn_date is non-null by schema; a sentinel epoch date means unknown
    if expense.txn_date == NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() {
        missing.push("date".to_string());
    }
    missing
}

fn decision(
    expense: &Expense,
    vendor_name: &str,
    rule: &str,
    kind: AuthDecision,
    reason: &str,
    missing: Vec<String>,
    skipped_race: bool,
) -> DecisionRecord {
    DecisionRecord {
        expense_id: expense.id,
        vendor: if vendor_name.is_empty() {
            "Unknown".into()
        } else {
            vendor_name.to_string()
        },
        amount: expense.amount,
        date: Some(expense.txn_date),
        rule: rule.to_string(),
        decision: kind,
        reason: reason.to_string(),
        missing_fields: missing,
        skipped_race,
    }
}

fn compose_digest(project_name: &str, reports: &[AuthReport]) -> String {
    let mut authorized = 0usize;
    let mut duplicates = 0usize;
    let mut missing = 0usize;
    let mut escalated = 0usize;
    let mut amount = Money::ZERO;
    for r in reports {
        authorized += r.summary.authorized;
        duplicates += r.summary.duplicates;
        missing += r.summary.missing_info;
        escalated += r.summary.escalated;
        amount += r.summary.authorized_amount;
    }

    let mut lines = vec![format!("**Expense Digest - {}**", project_name), String::new()];
    let mut parts = Vec::new();
    if authorized > 0 {
        parts.push(format!("**{}** authorized (${})", authorized, amount));
    }
    if missing > 0 {
        parts.push(format!("**{}** need info", missing));
    }
    if escalated > 0 {
        parts.push(format!("**{}** escalated", escalated));
    }
    if duplicates > 0 {
        parts.push(format!("**{}** duplicates flagged", duplicates));
    }
    lines.push(if parts.is_empty() {
        "No new activity.".to_string()
    } else {
        parts.join(" | ")
    });

    let escalations: Vec<&DecisionRecord> = reports
        .iter()
        .flat_map(|r| r.decisions.iter())
        .filter(|d| d.decision == AuthDecision::Escalated)
        .collect();
    if !escalations.is_empty() {
        lines.push(String::new());
        lines.push("**Manual review needed:**".to_string());
        for d in escalations.iter().take(10) {
            lines.push(format!("- **{}** (${}): {}", d.vendor, d.amount, d.reason));
        }
        if escalations.len() > 10 {
            lines.push(format!("...and {} more", escalations.len() - 10));
        }
    }

    lines.join("\n")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewExpense, Role};

    fn setup() -> (Database, AutoAuthEngine, Uuid, Uuid) {
        let db = Database::in_memory().unwrap();
        let engine = AutoAuthEngine::new(db.clone(), Config::default());
        let user = db
            .create_user("pm@example.com", "PM", Role::ProjectManager, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();
        (db, engine, user, project)
    }

    fn expense(
        db: &Database,
        user: Uuid,
        project: Uuid,
        desc: &str,
        amount: &str,
        vendor: Option<Uuid>,
        account: Option<Uuid>,
    ) -> Uuid {
        db.create_expense(
            &NewExpense {
                project_id: project,
                txn_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                amount: Money::parse(amount).unwrap(),
                vendor_id: vendor,
                account_id: account,
                description: desc.to_string(),
                payment_method_id: None,
                bill_ref: None,
                external_ref: None,
                confidence: None,
                source: None,
            },
            user,
        )
        .unwrap()
    }

    #[test]
    fn test_string_similarity() {
        assert_eq!(string_similarity("Home Depot", "home depot"), 100.0);
        assert!(string_similarity("Home Depot", "Home Depo") > 85.0);
        assert!(string_similarity("Home Depot", "Lowe's") < 50.0);
    }

    #[tokio::test]
    async fn test_r1_duplicate_detected_and_not_mutated() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Home Depot").unwrap();
        let account = db.upsert_account("Materials", None).unwrap();
        let a = expense(&db, user, project, "2x4 lumber", "12.00", Some(vendor), Some(account));
        let b = expense(&db, user, project, "2x4 lumber", "12.00", Some(vendor), Some(account));

        let outcome = engine.run(project, None, false).await.unwrap();
        let dup: Vec<_> = outcome
            .decisions
            .iter()
            .filter(|d| d.rule == "R1_EXACT_DUP")
            .collect();
        // both see the other; both flagged, neither mutated
        assert_eq!(dup.len(), 2);
        assert_eq!(db.get_expense(a).unwrap().unwrap().status, ExpenseStatus::Pending);
        assert_eq!(db.get_expense(b).unwrap().unwrap().status, ExpenseStatus::Pending);
    }

    #[tokio::test]
    async fn test_r3_receipt_sufficient_authorizes() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Home Depot").unwrap();
        let account = db.upsert_account("Materials", None).unwrap();
        let id = expense(&db, user, project, "2x4 lumber", "12.00", Some(vendor), Some(account));

        let hash = crate::fingerprint::file_hash(b"r");
        let intake = db
            .create_intake(project, user, "blobs/x.pdf", &hash, "application/pdf", None)
            .unwrap();
        db.set_intake_status(intake, crate::models::IntakeStatus::Processing, None)
            .unwrap();
        db.set_intake_status(intake, crate::models::IntakeStatus::Ready, None)
            .unwrap();
        db.link_intake_expenses(intake, &[id]).unwrap();

        let outcome = engine.run(project, None, false).await.unwrap();
        assert_eq!(outcome.summary.authorized, 1);
        assert_eq!(outcome.decisions[0].rule, "R3_RECEIPT_SUFFICIENT");

        let e = db.get_expense(id).unwrap().unwrap();
        assert_eq!(e.status, ExpenseStatus::Authorized);
        assert_eq!(e.authorized_by, Some(db.bot_user_id().unwrap()));
    }

    #[tokio::test]
    async fn test_r2_bill_hint() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Ferguson").unwrap();
        let account = db.upsert_account("Plumbing", None).unwrap();
        let id = expense(&db, user, project, "copper pipe", "250.00", Some(vendor), Some(account));

        db.stage_bill(
            "INV-100",
            Some("Ferguson"),
            Some(Money::parse("250.00").unwrap()),
            NaiveDate::from_ymd_opt(2026, 7, 2),
            None,
        )
        .unwrap();

        let outcome = engine.run(project, None, false).await.unwrap();
        assert_eq!(outcome.decisions[0].rule, "R2_BILL_HINT");
        assert_eq!(
            db.get_expense(id).unwrap().unwrap().status,
            ExpenseStatus::Authorized
        );
    }

    #[tokio::test]
    async fn test_r4_missing_info_tracks_and_prompts() {
        let (db, engine, user, project) = setup();
        expense(&db, user, project, "mystery charge", "40.00", None, None);

        let outcome = engine.run(project, None, false).await.unwrap();
        assert_eq!(outcome.summary.missing_info, 1);
        let d = &outcome.decisions[0];
        assert_eq!(d.rule, "R4_MISSING_INFO");
        assert!(d.missing_fields.contains(&"vendor".to_string()));
        assert!(d.missing_fields.contains(&"account".to_string()));

        // a chat prompt went out
        let bot = db.bot_user_id().unwrap();
        let msgs = db
            .recent_messages(&format!("project_general:{}", project), 10)
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].author_id, bot);

        // pending-info row exists until resolved
        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pending_info WHERE resolved_at IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_r5_policy_escalation() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Home Depot").unwrap();
        let tools = db.upsert_account("Tools", None).unwrap();
        // complete fields, so R4 passes; the Tools account is on the
        // default escalation list
        expense(
            &db,
            user,
            project,
            "DeWalt 20V drill",
            "199.00",
            Some(vendor),
            Some(tools),
        );

        let outcome = engine.run(project, None, false).await.unwrap();
        assert_eq!(outcome.summary.escalated, 1);
        assert_eq!(outcome.decisions[0].rule, "R5_POLICY_ESCALATE");
        assert!(outcome.decisions[0].reason.contains("escalation list"));
        assert_eq!(outcome.summary.authorized, 0);
    }

    #[tokio::test]
    async fn test_r5_amount_ceiling() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Crane Co").unwrap();
        let account = db.upsert_account("Equipment", None).unwrap();
        expense(&db, user, project, "crane rental week", "9000.00", Some(vendor), Some(account));

        let outcome = engine.run(project, None, false).await.unwrap();
        assert_eq!(outcome.decisions[0].rule, "R5_POLICY_ESCALATE");
        assert!(outcome.decisions[0].reason.contains("ceiling"));
    }

    #[tokio::test]
    async fn test_r6_health_sweep_only() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Slowpoke Supply").unwrap();
        let account = db.upsert_account("Materials", None).unwrap();
        let id = expense(&db, user, project, "old order", "20.00", Some(vendor), Some(account));

        // age the row past the escalation window
        let conn = db.conn().unwrap();
        let old = (Utc::now() - Duration::days(20)).to_rfc3339();
        conn.execute(
            "UPDATE expenses SET created_at = ? WHERE id = ?",
            rusqlite::params![old, id.to_string()],
        )
        .unwrap();
        drop(conn);

        // normal run: no decision at all
        let outcome = engine.run(project, None, false).await.unwrap();
        assert!(outcome.decisions.is_empty());

        // sweep: escalated
        let outcome = engine.run(project, None, true).await.unwrap();
        assert_eq!(outcome.decisions[0].rule, "R6_HEALTH");
    }

    #[tokio::test]
    async fn test_digest_flushed_once() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Home Depot").unwrap();
        let account = db.upsert_account("Materials", None).unwrap();
        let id = expense(&db, user, project, "2x4 lumber", "12.00", Some(vendor), Some(account));

        let hash = crate::fingerprint::file_hash(b"d");
        let intake = db
            .create_intake(project, user, "blobs/d.pdf", &hash, "application/pdf", None)
            .unwrap();
        db.set_intake_status(intake, crate::models::IntakeStatus::Processing, None)
            .unwrap();
        db.set_intake_status(intake, crate::models::IntakeStatus::Ready, None)
            .unwrap();
        db.link_intake_expenses(intake, &[id]).unwrap();

        engine.run(project, None, false).await.unwrap();
        assert_eq!(engine.flush_digest(project).unwrap(), 1);
        // second flush has nothing to do
        assert_eq!(engine.flush_digest(project).unwrap(), 0);

        let msgs = db
            .recent_messages(&format!("project_general:{}", project), 10)
            .unwrap();
        let digest = msgs
            .iter()
            .find(|m| m.body.contains("Expense Digest"))
            .unwrap();
        assert!(digest.body.contains("authorized"));
    }

    #[tokio::test]
    async fn test_override_capture_after_engine_action() {
        let (db, engine, user, project) = setup();
        let vendor = db.upsert_vendor("Home Depot").unwrap();
        let account = db.upsert_account("Materials", None).unwrap();
        let id = expense(&db, user, project, "2x4 lumber", "12.00", Some(vendor), Some(account));

        let hash = crate::fingerprint::file_hash(b"o");
        let intake = db
            .create_intake(project, user, "blobs/o.pdf", &hash, "application/pdf", None)
            .unwrap();
        db.set_intake_status(intake, crate::models::IntakeStatus::Processing, None)
            .unwrap();
        db.set_intake_status(intake, crate::models::IntakeStatus::Ready, None)
            .unwrap();
        db.link_intake_expenses(intake, &[id]).unwrap();
        engine.run(project, None, false).await.unwrap();

        // a human reverses the engine's authorization
        let e = db.get_expense(id).unwrap().unwrap();
        db.set_expense_status(
            id,
            ExpenseStatus::Review,
            Some("wrong account"),
            e.version_token,
            user,
        )
        .unwrap();

        let conn = db.conn().unwrap();
        let (rule, new_status): (String, String) = conn
            .query_row(
                "SELECT original_rule, new_status FROM auth_overrides WHERE expense_id = ?",
                rusqlite::params![id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(rule, "R3_RECEIPT_SUFFICIENT");
        assert_eq!(new_status, "review");
    }
}
