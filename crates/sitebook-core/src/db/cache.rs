//! Content-addressed categorization cache
//!
//! Keyed by (fingerprint, stage). Entries expire 30 days after last use so
//! hot keys survive the sweep. Writes are best-effort: a failure is logged
//! and never blocks the categorization path.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, Database};
use crate::error::Result;

/// A cached categorization decision
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: Uuid,
    pub fingerprint: String,
    pub stage: String,
    pub account_id: Uuid,
    pub account_name: String,
    pub confidence: i64,
    pub reasoning: Option<String>,
    pub warning: Option<String>,
    pub hit_count: i64,
    pub created_at: chrono::DateTime<Utc>,
    pub last_used_at: chrono::DateTime<Utc>,
}

impl Database {
    /// Consistent-read lookup. Entries past the TTL are treated as misses
    /// even before the sweep removes them.
    pub fn cache_lookup(
        &self,
        fingerprint: &str,
        stage: &str,
        ttl_days: i64,
    ) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let cutoff = fmt_datetime(Utc::now() - Duration::days(ttl_days));
        let entry = conn
            .query_row(
                r#"
                SELECT id, fingerprint, stage, account_id, account_name, confidence,
                       reasoning, warning, hit_count, created_at, last_used_at
                  FROM categorization_cache
                 WHERE fingerprint = ? AND stage = ? AND last_used_at > ?
                "#,
                params![fingerprint, stage, cutoff],
                |row| {
                    Ok(CacheEntry {
                        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
                        fingerprint: row.get(1)?,
                        stage: row.get(2)?,
                        account_id: Uuid::parse_str(&row.get::<_, String>(3)?)
                            .unwrap_or_default(),
                        account_name: row.get(4)?,
                        confidence: row.get(5)?,
                        reasoning: row.get(6)?,
                        warning: row.get(7)?,
                        hit_count: row.get(8)?,
                        created_at: parse_datetime(&row.get::<_, String>(9)?),
                        last_used_at: parse_datetime(&row.get::<_, String>(10)?),
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Best-effort insert. Parallel lookups may race to insert the same
    /// fingerprint; the unique constraint resolves the race and the collision
    /// is treated as success.
    pub fn cache_insert(
        &self,
        fingerprint: &str,
        stage: &str,
        account_id: Uuid,
        account_name: &str,
        confidence: i64,
        reasoning: Option<&str>,
        warning: Option<&str>,
    ) {
        let result = (|| -> Result<()> {
            let conn = self.conn()?;
            let now = fmt_datetime(Utc::now());
            conn.execute(
                r#"
                INSERT INTO categorization_cache
                    (id, fingerprint, stage, account_id, account_name, confidence,
                     reasoning, warning, hit_count, created_at, last_used_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                ON CONFLICT(fingerprint, stage) DO NOTHING
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    fingerprint,
                    stage,
                    account_id.to_string(),
                    account_name,
                    confidence,
                    reasoning,
                    warning,
                    now,
                    now,
                ],
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(fingerprint, stage, error = %e, "Cache insert failed");
        }
    }

    /// Bump hit count and last-used timestamp. Best-effort.
    pub fn cache_touch(&self, entry_id: Uuid) {
        let result = (|| -> Result<()> {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE categorization_cache SET hit_count = hit_count + 1, last_used_at = ? WHERE id = ?",
                params![fmt_datetime(Utc::now()), entry_id.to_string()],
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(entry = %entry_id, error = %e, "Cache touch failed");
        }
    }

    /// Periodic sweep: delete entries unused past the TTL. Purging is driven
    /// by last-used so hot keys stay.
    pub fn cache_sweep(&self, ttl_days: i64) -> Result<usize> {
        let conn = self.conn()?;
        let cutoff = fmt_datetime(Utc::now() - Duration::days(ttl_days));
        let removed = conn.execute(
            "DELETE FROM categorization_cache WHERE last_used_at <= ?",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Drop cache entries that point at a vendor's stale account mapping
    /// (invoked by the invalidate_cache_for_vendor job after corrections).
    pub fn cache_invalidate_account(&self, account_id: Uuid) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM categorization_cache WHERE account_id = ?",
            params![account_id.to_string()],
        )?;
        Ok(removed)
    }

    /// Record a human correction; used as LLM prompt context and ML ground
    /// truth.
    pub fn record_correction(
        &self,
        project_id: Option<Uuid>,
        stage: &str,
        description: &str,
        original_account: Option<(Uuid, &str)>,
        corrected_account: (Uuid, &str),
        corrected_by: Uuid,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO categorization_corrections
                (project_id, stage, description, original_account_id, original_account_name,
                 corrected_account_id, corrected_account_name, corrected_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                project_id.map(|p| p.to_string()),
                stage,
                description,
                original_account.map(|(id, _)| id.to_string()),
                original_account.map(|(_, name)| name.to_string()),
                corrected_account.0.to_string(),
                corrected_account.1,
                corrected_by.to_string(),
                fmt_datetime(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Up to `limit` recent corrections for (project, stage), newest first.
    /// These become few-shot context in the LLM categorization prompt.
    pub fn recent_corrections(
        &self,
        project_id: Option<Uuid>,
        stage: &str,
        limit: i64,
    ) -> Result<Vec<(String, String, String)>> {
        let Some(project_id) = project_id else {
            return Ok(Vec::new());
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT description, COALESCE(original_account_name, ''), corrected_account_name
              FROM categorization_corrections
             WHERE project_id = ? AND stage = ?
             ORDER BY created_at DESC LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![project_id.to_string(), stage, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
