//! Metrics rows for OCR calls, categorization batches, and LLM calls

use chrono::Utc;
use rusqlite::params;
use tracing::warn;
use uuid::Uuid;

use super::{fmt_datetime, Database};
use crate::error::Result;

/// One OCR pipeline invocation
#[derive(Debug, Clone)]
pub struct OcrMetricRow {
    pub agent: String,
    /// "text" or "vision".
    pub method: String,
    pub model_tier: String,
    pub wall_ms: i64,
    pub char_count: Option<i64>,
    pub item_count: Option<i64>,
    pub tax_detected: bool,
    pub total_match: Option<String>,
    pub success: bool,
    pub project_id: Option<Uuid>,
}

/// One categorization batch
#[derive(Debug, Clone)]
pub struct CategorizationMetricRow {
    pub project_id: Option<Uuid>,
    pub intake_id: Option<Uuid>,
    pub stage: String,
    pub total_items: i64,
    pub cache_hits: i64,
    pub cache_misses: i64,
    pub llm_tokens_used: i64,
    pub elapsed_ms: i64,
    pub below_70: i64,
    pub below_60: i64,
    pub below_50: i64,
    pub avg_confidence: Option<f64>,
}

/// One LLM gateway call
#[derive(Debug, Clone)]
pub struct LlmMetricRow {
    pub operation: String,
    pub model: String,
    pub latency_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl Database {
    /// Metrics are observability, not ledger data: failures log and move on.
    pub fn record_ocr_metric(&self, row: &OcrMetricRow) {
        let result = (|| -> Result<()> {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO ocr_metrics (agent, method, model_tier, wall_ms, char_count, item_count,
                    tax_detected, total_match, success, project_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    row.agent,
                    row.method,
                    row.model_tier,
                    row.wall_ms,
                    row.char_count,
                    row.item_count,
                    row.tax_detected as i64,
                    row.total_match,
                    row.success as i64,
                    row.project_id.map(|p| p.to_string()),
                    fmt_datetime(Utc::now()),
                ],
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "OCR metric write failed");
        }
    }

    pub fn record_categorization_metric(&self, row: &CategorizationMetricRow) {
        let result = (|| -> Result<()> {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO categorization_metrics (project_id, intake_id, stage, total_items,
                    cache_hits, cache_misses, llm_tokens_used, elapsed_ms,
                    below_70, below_60, below_50, avg_confidence, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    row.project_id.map(|p| p.to_string()),
                    row.intake_id.map(|i| i.to_string()),
                    row.stage,
                    row.total_items,
                    row.cache_hits,
                    row.cache_misses,
                    row.llm_tokens_used,
                    row.elapsed_ms,
                    row.below_70,
                    row.below_60,
                    row.below_50,
                    row.avg_confidence,
                    fmt_datetime(Utc::now()),
                ],
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "Categorization metric write failed");
        }
    }

    pub fn record_llm_metric(&self, row: &LlmMetricRow) {
        let result = (|| -> Result<()> {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO llm_metrics (operation, model, latency_ms, success, error, tokens_in, tokens_out, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    row.operation,
                    row.model,
                    row.latency_ms,
                    row.success as i64,
                    row.error,
                    row.tokens_in,
                    row.tokens_out,
                    fmt_datetime(Utc::now()),
                ],
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "LLM metric write failed");
        }
    }

    /// Aggregate OCR stats: (calls, successes, avg wall ms).
    pub fn ocr_metric_summary(&self) -> Result<(i64, i64, f64)> {
        let conn = self.conn()?;
        let row = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0), COALESCE(AVG(wall_ms), 0) FROM ocr_metrics",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            },
        )?;
        Ok(row)
    }
}
