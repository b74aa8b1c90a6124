//! Vendor-account affinity index
//!
//! Per-vendor histogram over account assignments. Counts are recomputed from
//! the expenses table on every qualifying write rather than incremented, so
//! late edits can never skew the ratios. Volume per vendor is small; a full
//! rescan is cheaper than being wrong.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{fmt_datetime, Database};
use crate::error::Result;

/// Support threshold for the dominant-account rule.
pub const MIN_PAIR_COUNT: i64 = 5;
/// Ratio threshold for the dominant-account rule.
pub const MIN_RATIO: f64 = 0.90;

impl Database {
    /// Recompute the histogram for one vendor from source and upsert the
    /// affinity rows. Invoked after any expense write that sets both vendor
    /// and account.
    pub fn refresh_affinity(&self, vendor_id: Uuid) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut counts: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT account_id, COUNT(*) FROM expenses
                 WHERE vendor_id = ? AND account_id IS NOT NULL AND deleted = 0
                 GROUP BY account_id
                "#,
            )?;
            let rows = stmt
                .query_map(params![vendor_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        counts.sort();

        let vendor_total: i64 = counts.iter().map(|(_, c)| c).sum();

        tx.execute(
            "DELETE FROM vendor_account_affinity WHERE vendor_id = ?",
            params![vendor_id.to_string()],
        )?;

        let now = fmt_datetime(Utc::now());
        for (account_id, pair_count) in counts {
            let ratio = if vendor_total > 0 {
                pair_count as f64 / vendor_total as f64
            } else {
                0.0
            };
            tx.execute(
                r#"
                INSERT INTO vendor_account_affinity (vendor_id, account_id, pair_count, vendor_total, ratio, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                params![
                    vendor_id.to_string(),
                    account_id,
                    pair_count,
                    vendor_total,
                    ratio,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// The vendor's dominant account, if support and ratio thresholds pass.
    /// Returns (account_id, ratio).
    pub fn dominant_account(&self, vendor_id: Uuid) -> Result<Option<(Uuid, f64)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT account_id, pair_count, ratio FROM vendor_account_affinity
                 WHERE vendor_id = ?
                 ORDER BY pair_count DESC LIMIT 1
                "#,
                params![vendor_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(account_id, pair_count, ratio)| {
            if pair_count >= MIN_PAIR_COUNT && ratio >= MIN_RATIO {
                Uuid::parse_str(&account_id).ok().map(|id| (id, ratio))
            } else {
                None
            }
        }))
    }
}
