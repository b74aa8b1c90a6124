//! Background job queue
//!
//! A bounded mpsc queue with one worker loop. Jobs are named, carry their
//! payloads by reference (ids and blob keys, never file bytes), execute at
//! most once per job id, and retry with exponential backoff up to three
//! attempts before landing in the dead-letter table. Failure of a post-commit
//! job (change-log writes, digests) never undoes the originating commit.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::autoauth::AutoAuthEngine;
use crate::db::{ChangeEntry, Database};
use crate::error::Result;
use crate::models::ExpenseStatus;

const QUEUE_DEPTH: usize = 256;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Executed-id memory cap (at-most-once bookkeeping).
const SEEN_CAP: usize = 4096;

/// The named jobs the orchestrator knows how to run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    WriteChangeLog {
        entries: Vec<ChangeEntry>,
    },
    WriteStatusLog {
        expense_id: Uuid,
        old_status: ExpenseStatus,
        new_status: ExpenseStatus,
        changed_by: Uuid,
        reason: Option<String>,
    },
    TriggerAutoAuth {
        project_id: Uuid,
    },
    RefreshAffinity {
        vendor_id: Uuid,
    },
    InvalidateCacheForVendor {
        vendor_id: Uuid,
    },
    SendChatDigest {
        project_id: Uuid,
    },
    CleanupCacheTombstones {
        ttl_days: i64,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WriteChangeLog { .. } => "write_change_log",
            Self::WriteStatusLog { .. } => "write_status_log",
            Self::TriggerAutoAuth { .. } => "trigger_auto_auth",
            Self::RefreshAffinity { .. } => "refresh_affinity",
            Self::InvalidateCacheForVendor { .. } => "invalidate_cache_for_vendor",
            Self::SendChatDigest { .. } => "send_chat_digest",
            Self::CleanupCacheTombstones { .. } => "cleanup_cache_tombstones",
        }
    }
}

struct Envelope {
    id: Uuid,
    job: Job,
}

/// Handle for enqueueing work
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Envelope>,
}

impl JobQueue {
    /// Start the worker loop and return the enqueue handle.
    pub fn start(db: Database, engine: Arc<AutoAuthEngine>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        let seen: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                {
                    let mut seen = seen.lock().unwrap();
                    if !seen.insert(envelope.id) {
                        warn!(job = envelope.job.name(), id = %envelope.id, "Duplicate job id, skipped");
                        continue;
                    }
                    if seen.len() > SEEN_CAP {
                        seen.clear();
                    }
                }
                run_with_retries(&db, &engine, envelope).await;
            }
            info!("Job queue drained, worker exiting");
        });

        Self { tx }
    }

    /// Enqueue a job with a fresh id. Blocks briefly when the queue is full.
    pub async fn enqueue(&self, job: Job) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.tx
            .send(Envelope { id, job })
            .await
            .map_err(|_| crate::error::Error::Internal("Job queue closed".into()))?;
        Ok(id)
    }

    /// Enqueue with a caller-supplied id (at-most-once across retried sends).
    pub async fn enqueue_with_id(&self, id: Uuid, job: Job) -> Result<()> {
        self.tx
            .send(Envelope { id, job })
            .await
            .map_err(|_| crate::error::Error::Internal("Job queue closed".into()))
    }
}

async fn run_with_retries(db: &Database, engine: &AutoAuthEngine, envelope: Envelope) {
    let name = envelope.job.name();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match execute(db, engine, &envelope.job).await {
            Ok(()) => {
                info!(job = name, id = %envelope.id, attempts, "Job complete");
                return;
            }
            Err(e) if e.is_terminal() => {
                error!(job = name, id = %envelope.id, error = %e, "Job failed terminally");
                dead_letter(db, &envelope, attempts, &e.to_string());
                return;
            }
            Err(e) if attempts >= MAX_ATTEMPTS => {
                error!(job = name, id = %envelope.id, error = %e, "Job exhausted retries");
                dead_letter(db, &envelope, attempts, &e.to_string());
                return;
            }
            Err(e) => {
                let delay = BACKOFF_BASE * 2u32.pow(attempts);
                warn!(job = name, id = %envelope.id, error = %e, "Job failed, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn execute(db: &Database, engine: &AutoAuthEngine, job: &Job) -> Result<()> {
    match job {
        Job::WriteChangeLog { entries } => db.insert_change_rows(entries),
        Job::WriteStatusLog {
            expense_id,
            old_status,
            new_status,
            changed_by,
            reason,
        } => {
            let conn = db.conn()?;
            conn.execute(
                r#"
                INSERT INTO expense_status_log (expense_id, old_status, new_status, changed_by, reason, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                rusqlite::params![
                    expense_id.to_string(),
                    old_status.as_str(),
                    new_status.as_str(),
                    changed_by.to_string(),
                    reason,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        }
        Job::TriggerAutoAuth { project_id } => {
            engine.run(*project_id, None, false).await.map(|_| ())
        }
        Job::RefreshAffinity { vendor_id } => db.refresh_affinity(*vendor_id),
        Job::InvalidateCacheForVendor { vendor_id } => {
            if let Some((account_id, _)) = db.dominant_account(*vendor_id)? {
                let removed = db.cache_invalidate_account(account_id)?;
                info!(vendor = %vendor_id, removed, "Vendor cache invalidated");
            }
            Ok(())
        }
        Job::SendChatDigest { project_id } => engine.flush_digest(*project_id).map(|_| ()),
        Job::CleanupCacheTombstones { ttl_days } => {
            let removed = db.cache_sweep(*ttl_days)?;
            if removed > 0 {
                info!(removed, "Cache sweep removed stale entries");
            }
            Ok(())
        }
    }
}

fn dead_letter(db: &Database, envelope: &Envelope, attempts: u32, error: &str) {
    let payload = serde_json::to_string(&envelope.job).unwrap_or_default();
    let result = db.conn().and_then(|conn| {
        conn.execute(
            r#"
            INSERT OR IGNORE INTO dead_letter_jobs (id, job_kind, payload, error, attempts, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            rusqlite::params![
                envelope.id.to_string(),
                envelope.job.name(),
                payload,
                error,
                attempts,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(Into::into)
    });
    if let Err(e) = result {
        error!(error = %e, "Dead-letter write failed");
    }
}
