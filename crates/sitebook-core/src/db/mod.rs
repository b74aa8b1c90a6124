//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `expenses` - Expense store, state machine, change/status logs, summaries
//! - `intake` - Receipt intake queue operations
//! - `cache` - Content-addressed categorization cache
//! - `affinity` - Vendor-account affinity index
//! - `messages` - Channels, messages, mentions, read status
//! - `reports` - Auth reports, overrides, pending-info tracking
//! - `identity` - Users, role capabilities, audit log
//! - `lookups` - Projects, vendors, accounts, payment methods, bills staging
//! - `metrics` - OCR, categorization, and LLM call metrics

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::Result;

mod affinity;
mod cache;
mod expenses;
mod identity;
mod intake;
mod lookups;
mod messages;
mod metrics;
mod reports;

pub use cache::CacheEntry;
pub use expenses::{ChangeEntry, ExpenseFilter, ExpensePage, StatusSummary, SummaryRow};
pub use identity::BOT_EMAIL;
pub use intake::IntakeDuplicate;
pub use lookups::BillRow;
pub use messages::UnreadCount;
pub use metrics::{CategorizationMetricRow, LlmMetricRow, OcrMetricRow};
pub use reports::{FollowupAction, PendingInfoRow};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Parse an RFC-3339 timestamp column into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Format a timestamp for storage
pub(crate) fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    db_path: String,
}

impl Database {
    /// Create a new database connection pool and run migrations.
    pub fn new(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway file-backed database (for testing).
    ///
    /// A temp file is used instead of `:memory:` because each pooled
    /// connection would otherwise see its own empty database.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "sitebook_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);
        Self::new(path.to_string_lossy().as_ref())
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- WAL mode: readers don't block writers
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Users and capabilities
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                password_hash TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS role_capabilities (
                role TEXT NOT NULL,
                module TEXT NOT NULL,
                action TEXT NOT NULL,
                PRIMARY KEY (role, module, action)
            );

            -- Master data (read-only lookups held by weak reference)
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                stage TEXT NOT NULL DEFAULT 'General'
            );

            CREATE TABLE IF NOT EXISTS vendors (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                acct_num TEXT
            );

            CREATE TABLE IF NOT EXISTS payment_methods (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            -- Bills staging (imported from the reference accounting system)
            CREATE TABLE IF NOT EXISTS bills (
                id TEXT PRIMARY KEY,
                bill_ref TEXT NOT NULL,
                vendor_name TEXT,
                total TEXT,
                bill_date TEXT,
                expense_id TEXT,
                receipt_key TEXT,
                status TEXT NOT NULL DEFAULT 'open'
            );

            CREATE INDEX IF NOT EXISTS idx_bills_ref ON bills(bill_ref);

            -- Expenses (canonical ledger)
            CREATE TABLE IF NOT EXISTS expenses (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                txn_date TEXT NOT NULL,
                amount TEXT NOT NULL,            -- fixed-point, two fractional digits
                vendor_id TEXT,
                account_id TEXT,
                description TEXT NOT NULL DEFAULT '',
                payment_method_id TEXT,
                bill_ref TEXT,
                external_ref TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                authorized_by TEXT,
                status_reason TEXT,
                updated_by TEXT NOT NULL,
                confidence INTEGER,
                source TEXT,
                version_token TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_expenses_project_date ON expenses(project_id, txn_date);
            CREATE INDEX IF NOT EXISTS idx_expenses_status ON expenses(status);
            CREATE INDEX IF NOT EXISTS idx_expenses_vendor ON expenses(vendor_id);

            -- Append-only change log, one row per modified field
            CREATE TABLE IF NOT EXISTS expense_change_log (
                id INTEGER PRIMARY KEY,
                expense_id TEXT NOT NULL,
                field TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT,
                changed_by TEXT NOT NULL,
                status_at_change TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_change_log_expense ON expense_change_log(expense_id);

            -- Append-only status log, one row per transition
            CREATE TABLE IF NOT EXISTS expense_status_log (
                id INTEGER PRIMARY KEY,
                expense_id TEXT NOT NULL,
                old_status TEXT NOT NULL,
                new_status TEXT NOT NULL,
                changed_by TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_status_log_expense ON expense_status_log(expense_id);

            -- Batch-create idempotency keys
            CREATE TABLE IF NOT EXISTS expense_batch_keys (
                idempotency_key TEXT PRIMARY KEY,
                expense_ids TEXT NOT NULL,       -- JSON array
                created_at TEXT NOT NULL
            );

            -- Receipt intake queue
            CREATE TABLE IF NOT EXISTS receipt_intake (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                uploader_id TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                extracted_text TEXT,
                parsed TEXT,                     -- JSON ExtractedReceipt
                status TEXT NOT NULL DEFAULT 'pending',
                status_reason TEXT,
                batch_id TEXT,
                thumbnail_key TEXT,
                vault_ref TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_intake_hash ON receipt_intake(file_hash);
            CREATE INDEX IF NOT EXISTS idx_intake_project_status ON receipt_intake(project_id, status);

            -- Ordered link between an intake and the expenses it produced
            CREATE TABLE IF NOT EXISTS intake_expenses (
                intake_id TEXT NOT NULL,
                expense_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (intake_id, expense_id)
            );

            CREATE INDEX IF NOT EXISTS idx_intake_expenses_expense ON intake_expenses(expense_id);

            -- Categorization cache (content-addressed)
            CREATE TABLE IF NOT EXISTS categorization_cache (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                stage TEXT NOT NULL,
                account_id TEXT NOT NULL,
                account_name TEXT NOT NULL,
                confidence INTEGER NOT NULL,
                reasoning TEXT,
                warning TEXT,
                hit_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL,
                UNIQUE(fingerprint, stage)
            );

            CREATE INDEX IF NOT EXISTS idx_cache_last_used ON categorization_cache(last_used_at);

            -- Human corrections feed the LLM prompt and ML training
            CREATE TABLE IF NOT EXISTS categorization_corrections (
                id INTEGER PRIMARY KEY,
                project_id TEXT,
                stage TEXT NOT NULL,
                description TEXT NOT NULL,
                original_account_id TEXT,
                original_account_name TEXT,
                corrected_account_id TEXT NOT NULL,
                corrected_account_name TEXT NOT NULL,
                corrected_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_corrections_project_stage
                ON categorization_corrections(project_id, stage, created_at);

            -- Vendor-account affinity histogram
            CREATE TABLE IF NOT EXISTS vendor_account_affinity (
                vendor_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                pair_count INTEGER NOT NULL,
                vendor_total INTEGER NOT NULL,
                ratio REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (vendor_id, account_id)
            );

            CREATE INDEX IF NOT EXISTS idx_affinity_vendor ON vendor_account_affinity(vendor_id);

            -- Auto-auth reports (decisions embedded as append-only JSON array)
            CREATE TABLE IF NOT EXISTS auth_reports (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL UNIQUE,
                project_id TEXT NOT NULL,
                summary TEXT NOT NULL,           -- JSON AuthSummary
                decisions TEXT NOT NULL,         -- JSON [DecisionRecord]
                digested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_auth_reports_project ON auth_reports(project_id, created_at);

            -- Human overrides of engine decisions (feeds rule-accuracy learning)
            CREATE TABLE IF NOT EXISTS auth_overrides (
                id INTEGER PRIMARY KEY,
                expense_id TEXT NOT NULL,
                original_rule TEXT NOT NULL,
                original_decision TEXT NOT NULL,
                new_status TEXT NOT NULL,
                changed_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_auth_overrides_expense ON auth_overrides(expense_id);

            -- Outstanding missing-info requests awaiting human replies
            CREATE TABLE IF NOT EXISTS pending_info (
                expense_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                missing_fields TEXT NOT NULL,    -- JSON array of field names
                requested_at TEXT NOT NULL,
                resolved_at TEXT,
                message_id TEXT
            );

            -- Mismatch reconciler suggestions (persisted, not auto-applied)
            CREATE TABLE IF NOT EXISTS reconcile_suggestions (
                id TEXT PRIMARY KEY,
                intake_id TEXT NOT NULL,
                finding TEXT NOT NULL,
                suggestion TEXT NOT NULL,        -- JSON
                applied INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reconcile_intake ON reconcile_suggestions(intake_id);

            -- Messaging substrate
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                channel_key TEXT NOT NULL,
                author_id TEXT NOT NULL,
                body TEXT NOT NULL,
                blocks TEXT,                     -- JSON rendered blocks
                metadata TEXT,                   -- JSON
                reply_to TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_key, created_at);

            CREATE TABLE IF NOT EXISTS message_mentions (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS channel_read_status (
                user_id TEXT NOT NULL,
                channel_key TEXT NOT NULL,
                last_read_at TEXT NOT NULL,
                PRIMARY KEY (user_id, channel_key)
            );

            CREATE INDEX IF NOT EXISTS idx_read_status_user ON channel_read_status(user_id, channel_key);

            -- Audit log (every capability-gated access)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT,
                entity_id TEXT,
                details TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_log_user ON audit_log(user_id);
            CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log(created_at);

            -- OCR call metrics
            CREATE TABLE IF NOT EXISTS ocr_metrics (
                id INTEGER PRIMARY KEY,
                agent TEXT NOT NULL,
                method TEXT NOT NULL,            -- text | vision
                model_tier TEXT NOT NULL,
                wall_ms INTEGER NOT NULL,
                char_count INTEGER,
                item_count INTEGER,
                tax_detected INTEGER NOT NULL DEFAULT 0,
                total_match TEXT,
                success INTEGER NOT NULL,
                project_id TEXT,
                created_at TEXT NOT NULL
            );

            -- Categorization batch metrics
            CREATE TABLE IF NOT EXISTS categorization_metrics (
                id INTEGER PRIMARY KEY,
                project_id TEXT,
                intake_id TEXT,
                stage TEXT NOT NULL,
                total_items INTEGER NOT NULL,
                cache_hits INTEGER NOT NULL,
                cache_misses INTEGER NOT NULL,
                llm_tokens_used INTEGER NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                below_70 INTEGER NOT NULL,
                below_60 INTEGER NOT NULL,
                below_50 INTEGER NOT NULL,
                avg_confidence REAL,
                created_at TEXT NOT NULL
            );

            -- Per-call LLM metrics
            CREATE TABLE IF NOT EXISTS llm_metrics (
                id INTEGER PRIMARY KEY,
                operation TEXT NOT NULL,
                model TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error TEXT,
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            -- Jobs that exhausted their retries
            CREATE TABLE IF NOT EXISTS dead_letter_jobs (
                id TEXT PRIMARY KEY,
                job_kind TEXT NOT NULL,
                payload TEXT NOT NULL,           -- JSON, large payloads by blob key
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }
}
