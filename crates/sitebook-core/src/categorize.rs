//! Categorization engine
//!
//! Escalation per row, stopping at the first tier that answers:
//! cache -> vendor affinity -> ML classifier -> small LLM -> large LLM.
//! Rows sharing a fingerprint within one call are resolved once and the
//! result replayed. Power-tool descriptions short-circuit with confidence 0
//! so capital assets never auto-post as consumables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ai::{LlmBackend, LlmClient};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::db::{CategorizationMetricRow, Database};
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::models::{CategorizationSource, NamedRef};

/// ML predictions below this confidence fall through to the LLM tiers.
const ML_MIN_CONFIDENCE: i64 = 90;
/// Corrections included as few-shot context in LLM prompts.
const MAX_CORRECTIONS: i64 = 5;

/// One row to categorize
#[derive(Debug, Clone)]
pub struct CategorizeRequest {
    pub row_index: usize,
    pub description: String,
    pub vendor_id: Option<Uuid>,
}

/// Per-row result
#[derive(Debug, Clone, Serialize)]
pub struct Categorization {
    pub row_index: usize,
    pub account_id: Option<Uuid>,
    pub account_name: Option<String>,
    pub confidence: i64,
    pub source: Option<CategorizationSource>,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Aggregate metrics for one call
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategorizeMetrics {
    pub cache_hits: i64,
    pub cache_misses: i64,
    pub llm_tokens_used: i64,
    pub elapsed_ms: i64,
    pub below_70_count: i64,
    pub below_60_count: i64,
    pub below_50_count: i64,
}

#[derive(Debug, Deserialize)]
struct LlmCategorization {
    row_index: usize,
    account_id: String,
    confidence: i64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct LlmCategorizeReply {
    categorizations: Vec<LlmCategorization>,
}

pub struct CategorizationEngine {
    db: Database,
    llm: Option<LlmClient>,
    classifier: Arc<Classifier>,
    config: Config,
}

impl CategorizationEngine {
    pub fn new(
        db: Database,
        llm: Option<LlmClient>,
        classifier: Arc<Classifier>,
        config: Config,
    ) -> Self {
        Self {
            db,
            llm,
            classifier,
            config,
        }
    }

    /// Categorize a batch of rows for one (project, stage).
    pub async fn categorize(
        &self,
        project_id: Option<Uuid>,
        intake_id: Option<Uuid>,
        stage: &str,
        rows: &[CategorizeRequest],
    ) -> Result<(Vec<Categorization>, CategorizeMetrics)> {
        if stage.trim().is_empty() || rows.is_empty() {
            return Err(Error::Validation("Missing stage or rows".into()));
        }

        let started = Instant::now();
        let mut metrics = CategorizeMetrics::default();
        // fingerprint -> resolved result (replayed across duplicate rows)
        let mut resolved: HashMap<String, Categorization> = HashMap::new();
        let mut needs_llm: Vec<&CategorizeRequest> = Vec::new();

        for row in rows {
            let fp = fingerprint::fingerprint(&row.description, stage);
            if resolved.contains_key(&fp) {
                continue;
            }

            // Power-tool guard runs before every tier.
            if let Some(term) = self.power_tool_match(&row.description) {
                resolved.insert(
                    fp,
                    Categorization {
                        row_index: row.row_index,
                        account_id: None,
                        account_name: None,
                        confidence: 0,
                        source: None,
                        reasoning: format!("Matched power-tool term '{}'", term),
                        warning: Some("Power tool - not a job-cost expense".into()),
                    },
                );
                continue;
            }

            // Tier 1: cache
            if let Some(entry) = self.db.cache_lookup(&fp, stage, self.config.cache_ttl_days)? {
                self.db.cache_touch(entry.id);
                metrics.cache_hits += 1;
                resolved.insert(
                    fp,
                    Categorization {
                        row_index: row.row_index,
                        account_id: Some(entry.account_id),
                        account_name: Some(entry.account_name),
                        confidence: entry.confidence,
                        source: Some(CategorizationSource::Cache),
                        reasoning: entry.reasoning.unwrap_or_default(),
                        warning: entry.warning,
                    },
                );
                continue;
            }
            metrics.cache_misses += 1;

            // Tier 2: vendor affinity. Already the source of truth, so no
            // cache write.
            if let Some(vendor) = row.vendor_id {
                if let Some((account_id, ratio)) = self.db.dominant_account(vendor)? {
                    let account_name = self
                        .db
                        .account_name(account_id)?
                        .unwrap_or_else(|| "Unknown".into());
                    resolved.insert(
                        fp,
                        Categorization {
                            row_index: row.row_index,
                            account_id: Some(account_id),
                            account_name: Some(account_name),
                            confidence: (ratio * 100.0).round() as i64,
                            source: Some(CategorizationSource::Affinity),
                            reasoning: "Vendor's dominant account".into(),
                            warning: None,
                        },
                    );
                    continue;
                }
            }

            // Tier 3: ML classifier
            if let Some(p) = self.classifier.predict(&row.description, stage) {
                if p.confidence >= ML_MIN_CONFIDENCE {
                    self.db.cache_insert(
                        &fp,
                        stage,
                        p.account_id,
                        &p.account_name,
                        p.confidence,
                        Some("Nearest-neighbor match on verified history"),
                        None,
                    );
                    resolved.insert(
                        fp,
                        Categorization {
                            row_index: row.row_index,
                            account_id: Some(p.account_id),
                            account_name: Some(p.account_name),
                            confidence: p.confidence,
                            source: Some(CategorizationSource::Ml),
                            reasoning: "Nearest-neighbor match on verified history".into(),
                            warning: None,
                        },
                    );
                    continue;
                }
                debug!(
                    confidence = p.confidence,
                    "ML prediction below threshold, escalating"
                );
            }

            needs_llm.push(row);
        }

        // Tiers 4 and 5: LLM escalation for whatever is left.
        if !needs_llm.is_empty() {
            self.escalate_to_llm(project_id, stage, &needs_llm, &mut resolved, &mut metrics)
                .await?;
        }

        // Replay resolved fingerprints back onto every input row.
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let fp = fingerprint::fingerprint(&row.description, stage);
            let mut item = resolved
                .get(&fp)
                .cloned()
                .unwrap_or_else(|| Categorization {
                    row_index: row.row_index,
                    account_id: None,
                    account_name: None,
                    confidence: 0,
                    source: None,
                    reasoning: String::new(),
                    warning: Some("exhausted".into()),
                });
            item.row_index = row.row_index;
            out.push(item);
        }
        out.sort_by_key(|c| c.row_index);

        for c in &out {
            if c.confidence < 70 {
                metrics.below_70_count += 1;
            }
            if c.confidence < 60 {
                metrics.below_60_count += 1;
            }
            if c.confidence < 50 {
                metrics.below_50_count += 1;
            }
        }
        metrics.elapsed_ms = started.elapsed().as_millis() as i64;

        let avg = if out.is_empty() {
            None
        } else {
            Some(out.iter().map(|c| c.confidence as f64).sum::<f64>() / out.len() as f64)
        };
        self.db.record_categorization_metric(&CategorizationMetricRow {
            project_id,
            intake_id,
            stage: stage.to_string(),
            total_items: out.len() as i64,
            cache_hits: metrics.cache_hits,
            cache_misses: metrics.cache_misses,
            llm_tokens_used: metrics.llm_tokens_used,
            elapsed_ms: metrics.elapsed_ms,
            below_70: metrics.below_70_count,
            below_60: metrics.below_60_count,
            below_50: metrics.below_50_count,
            avg_confidence: avg,
        });

        Ok((out, metrics))
    }

    /// Small tier first; rows that come back under `min_confidence` go to the
    /// large tier, whose answer is kept regardless (downstream gates on
    /// confidence).
    async fn escalate_to_llm(
        &self,
        project_id: Option<Uuid>,
        stage: &str,
        rows: &[&CategorizeRequest],
        resolved: &mut HashMap<String, Categorization>,
        metrics: &mut CategorizeMetrics,
    ) -> Result<()> {
        let Some(llm) = &self.llm else {
            // No gateway configured: rows stay unresolved ("exhausted").
            return Ok(());
        };

        let accounts = self.db.categorization_accounts()?;
        if accounts.is_empty() {
            return Err(Error::Internal("No accounts available".into()));
        }
        let corrections = self
            .db
            .recent_corrections(project_id, stage, MAX_CORRECTIONS)?;
        let prompt = build_prompt(stage, &accounts, &corrections, rows);

        let mut escalate: Vec<&CategorizeRequest> = Vec::new();

        match llm
            .classify_small("categorize_small", CATEGORIZE_SYSTEM, &prompt)
            .await
        {
            Ok(reply) => {
                metrics.llm_tokens_used += reply.usage.total();
                match serde_json::from_value::<LlmCategorizeReply>(reply.value) {
                    Ok(parsed) => {
                        let by_index: HashMap<usize, LlmCategorization> = parsed
                            .categorizations
                            .into_iter()
                            .map(|c| (c.row_index, c))
                            .collect();

                        for &row in rows {
                            let fp = fingerprint::fingerprint(&row.description, stage);
                            match by_index.get(&row.row_index).and_then(|c| {
                                validate_account(&accounts, &c.account_id).map(|a| (c, a))
                            }) {
                                Some((c, account))
                                    if c.confidence >= self.config.min_confidence =>
                                {
                                    self.db.cache_insert(
                                        &fp,
                                        stage,
                                        account.id,
                                        &account.name,
                                        c.confidence.clamp(0, 100),
                                        Some(&c.reasoning),
                                        None,
                                    );
                                    resolved.insert(
                                        fp,
                                        Categorization {
                                            row_index: row.row_index,
                                            account_id: Some(account.id),
                                            account_name: Some(account.name.clone()),
                                            confidence: c.confidence.clamp(0, 100),
                                            source: Some(CategorizationSource::LlmSmall),
                                            reasoning: c.reasoning.clone(),
                                            warning: None,
                                        },
                                    );
                                }
                                _ => escalate.push(row),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Small-tier reply did not match schema, escalating");
                        escalate.extend(rows.iter().copied());
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Small-tier categorization failed, escalating all rows");
                escalate.extend(rows.iter().copied());
            }
        }

        if escalate.is_empty() {
            return Ok(());
        }

        let prompt = build_prompt(stage, &accounts, &corrections, &escalate);
        let reply = match llm
            .analyze_large("categorize_large", CATEGORIZE_SYSTEM, &prompt, &[])
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Large-tier categorization failed");
                return Ok(());
            }
        };
        metrics.llm_tokens_used += reply.usage.total();
        let parsed: LlmCategorizeReply = match serde_json::from_value(reply.value) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Large-tier reply did not match schema");
                return Ok(());
            }
        };
        let by_index: HashMap<usize, LlmCategorization> = parsed
            .categorizations
            .into_iter()
            .map(|c| (c.row_index, c))
            .collect();

        for row in escalate {
            let fp = fingerprint::fingerprint(&row.description, stage);
            if let Some((c, account)) = by_index
                .get(&row.row_index)
                .and_then(|c| validate_account(&accounts, &c.account_id).map(|a| (c, a)))
            {
                let confidence = c.confidence.clamp(0, 100);
                // Large-tier answers are cached and returned even at low
                // confidence; downstream decides what to do with them.
                self.db.cache_insert(
                    &fp,
                    stage,
                    account.id,
                    &account.name,
                    confidence,
                    Some(&c.reasoning),
                    None,
                );
                resolved.insert(
                    fp,
                    Categorization {
                        row_index: row.row_index,
                        account_id: Some(account.id),
                        account_name: Some(account.name.clone()),
                        confidence,
                        source: Some(CategorizationSource::LlmLarge),
                        reasoning: c.reasoning.clone(),
                        warning: None,
                    },
                );
            }
        }

        Ok(())
    }

    /// First lexicon term that matches the description without a consumable
    /// qualifier ("drill bit" is a consumable, "drill" is not).
    fn power_tool_match(&self, description: &str) -> Option<String> {
        const QUALIFIERS: &[&str] = &[
            "bit", "bits", "blade", "blades", "nail", "nails", "screw", "screws", "sandpaper",
            "disc", "discs", "paper", "pad", "pads",
        ];
        let text = fingerprint::normalize(description);
        let words: Vec<&str> = text.split(' ').collect();

        for term in &self.config.power_tool_lexicon {
            let matched = if term.contains(' ') {
                text.contains(term.as_str())
            } else {
                words.contains(&term.as_str())
            };
            if matched && !QUALIFIERS.iter().any(|q| words.contains(q)) {
                return Some(term.clone());
            }
        }
        None
    }
}

const CATEGORIZE_SYSTEM: &str = "You are a construction accounting expert. You assign ledger \
accounts to expense line descriptions and always return valid JSON with accurate account ids.";

fn build_prompt(
    stage: &str,
    accounts: &[NamedRef],
    corrections: &[(String, String, String)],
    rows: &[&CategorizeRequest],
) -> String {
    let account_list: Vec<serde_json::Value> = accounts
        .iter()
        .map(|a| json!({"account_id": a.id.to_string(), "name": a.name}))
        .collect();
    let row_list: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| json!({"row_index": r.row_index, "description": r.description}))
        .collect();

    let mut prompt = format!(
        "CONSTRUCTION STAGE: {}\n\nAVAILABLE ACCOUNTS:\n{}\n\nEXPENSE DESCRIPTIONS TO CATEGORIZE:\n{}\n",
        stage,
        serde_json::to_string_pretty(&account_list).unwrap_or_default(),
        serde_json::to_string_pretty(&row_list).unwrap_or_default(),
    );

    if !corrections.is_empty() {
        prompt.push_str("\nRECENT CORRECTIONS (learn from these):\n");
        for (desc, from, to) in corrections {
            if from.is_empty() {
                prompt.push_str(&format!("- '{}' was assigned to '{}'\n", desc, to));
            } else {
                prompt.push_str(&format!(
                    "- '{}' was corrected from '{}' to '{}'\n",
                    desc, from, to
                ));
            }
        }
    }

    prompt.push_str(
        "\nINSTRUCTIONS:\n\
         1. Pick the most appropriate account for each description, considering the stage.\n\
         2. Confidence 0-100; be conservative.\n\
         3. Use ONLY account_id values from the list.\n\
         4. Delivery and freight charges go to an account with Freight or Delivery in its name.\n\
         5. Environmental fees and surcharges attach to the materials account.\n\n\
         Return ONLY JSON: {\"categorizations\": [{\"row_index\": 0, \"account_id\": \"...\", \
         \"confidence\": 85, \"reasoning\": \"...\"}]}",
    );
    prompt
}

fn validate_account<'a>(accounts: &'a [NamedRef], id: &str) -> Option<&'a NamedRef> {
    let id = Uuid::parse_str(id).ok()?;
    accounts.iter().find(|a| a.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn engine_with_mock(db: &Database) -> (CategorizationEngine, LlmClient) {
        let llm = LlmClient::mock();
        let engine = CategorizationEngine::new(
            db.clone(),
            Some(llm.clone()),
            Arc::new(Classifier::new(6)),
            Config::default(),
        );
        (engine, llm)
    }

    fn req(idx: usize, desc: &str) -> CategorizeRequest {
        CategorizeRequest {
            row_index: idx,
            description: desc.to_string(),
            vendor_id: None,
        }
    }

    #[tokio::test]
    async fn test_power_tool_guard() {
        let db = Database::in_memory().unwrap();
        db.upsert_account("Lumber & Materials", None).unwrap();
        let (engine, _llm) = engine_with_mock(&db);

        let rows = vec![req(0, "DeWalt 20V drill")];
        let (out, _) = engine
            .categorize(None, None, "Framing", &rows)
            .await
            .unwrap();
        assert_eq!(out[0].confidence, 0);
        assert!(out[0].warning.is_some());
        assert!(out[0].account_id.is_none());
    }

    #[tokio::test]
    async fn test_consumable_qualifier_exempts_guard() {
        let db = Database::in_memory().unwrap();
        let account = db.upsert_account("Tools & Supplies", None).unwrap();
        let (engine, llm) = engine_with_mock(&db);
        llm.as_mock().unwrap().push_response(
            "categorize_small",
            json!({"categorizations": [{"row_index": 0, "account_id": account.to_string(),
                    "confidence": 85, "reasoning": "consumable"}]}),
        );

        let rows = vec![req(0, "drill bits set 20pc")];
        let (out, _) = engine
            .categorize(None, None, "Framing", &rows)
            .await
            .unwrap();
        assert_eq!(out[0].source, Some(CategorizationSource::LlmSmall));
        assert_eq!(out[0].account_id, Some(account));
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits() {
        let db = Database::in_memory().unwrap();
        let account = db.upsert_account("Lumber & Materials", None).unwrap();
        let fp = fingerprint::fingerprint("2x4 lumber", "Framing");
        db.cache_insert(&fp, "Framing", account, "Lumber & Materials", 95, None, None);

        let (engine, llm) = engine_with_mock(&db);
        let rows = vec![req(0, "2x4 lumber")];
        let (out, metrics) = engine
            .categorize(None, None, "Framing", &rows)
            .await
            .unwrap();

        assert_eq!(out[0].source, Some(CategorizationSource::Cache));
        assert_eq!(metrics.cache_hits, 1);
        assert!(llm.as_mock().unwrap().calls().is_empty());

        // hit count bumped
        let entry = db.cache_lookup(&fp, "Framing", 30).unwrap().unwrap();
        assert_eq!(entry.hit_count, 1);
    }

    #[tokio::test]
    async fn test_affinity_tier() {
        let db = Database::in_memory().unwrap();
        let user = db
            .create_user("t@example.com", "T", Role::Bookkeeper, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();
        let vendor = db.upsert_vendor("ABC Concrete").unwrap();
        let concrete = db.upsert_account("Concrete", None).unwrap();

        for i in 0..6 {
            let e = crate::models::NewExpense {
                project_id: project,
                txn_date: chrono::NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
                amount: crate::money::Money::parse("50.00").unwrap(),
                vendor_id: Some(vendor),
                account_id: Some(concrete),
                description: format!("pour {}", i),
                payment_method_id: None,
                bill_ref: None,
                external_ref: None,
                confidence: None,
                source: None,
            };
            db.create_expense(&e, user).unwrap();
        }
        db.refresh_affinity(vendor).unwrap();

        let (engine, llm) = engine_with_mock(&db);
        let rows = vec![CategorizeRequest {
            row_index: 0,
            description: "ready mix delivery".into(),
            vendor_id: Some(vendor),
        }];
        let (out, _) = engine
            .categorize(None, None, "Framing", &rows)
            .await
            .unwrap();
        assert_eq!(out[0].source, Some(CategorizationSource::Affinity));
        assert_eq!(out[0].account_id, Some(concrete));
        assert_eq!(out[0].confidence, 100);
        assert!(llm.as_mock().unwrap().calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fingerprints_resolved_once() {
        let db = Database::in_memory().unwrap();
        let account = db.upsert_account("Lumber & Materials", None).unwrap();
        let (engine, llm) = engine_with_mock(&db);
        llm.as_mock().unwrap().push_response(
            "categorize_small",
            json!({"categorizations": [{"row_index": 0, "account_id": account.to_string(),
                    "confidence": 92, "reasoning": "lumber"}]}),
        );

        // same fingerprint, three rows
        let rows = vec![
            req(0, "2x4 Lumber"),
            req(1, "2x4  lumber"),
            req(2, "2X4 LUMBER"),
        ];
        let (out, _) = engine
            .categorize(None, None, "Framing", &rows)
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        for c in &out {
            assert_eq!(c.account_id, Some(account));
        }
        // one small-tier call total
        assert_eq!(llm.as_mock().unwrap().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_escalates_to_large() {
        let db = Database::in_memory().unwrap();
        let account = db.upsert_account("Base Materials", None).unwrap();
        let (engine, llm) = engine_with_mock(&db);
        let mock = llm.as_mock().unwrap();
        mock.push_response(
            "categorize_small",
            json!({"categorizations": [{"row_index": 0, "account_id": account.to_string(),
                    "confidence": 40, "reasoning": "unsure"}]}),
        );
        mock.push_response(
            "categorize_large",
            json!({"categorizations": [{"row_index": 0, "account_id": account.to_string(),
                    "confidence": 55, "reasoning": "still fuzzy but best fit"}]}),
        );

        let rows = vec![req(0, "mystery charge")];
        let (out, _) = engine
            .categorize(None, None, "Framing", &rows)
            .await
            .unwrap();
        // large-tier answer kept even below min_confidence
        assert_eq!(out[0].source, Some(CategorizationSource::LlmLarge));
        assert_eq!(out[0].confidence, 55);
        assert_eq!(
            llm.as_mock().unwrap().calls(),
            vec!["categorize_small", "categorize_large"]
        );
    }

    #[tokio::test]
    async fn test_exhausted_row() {
        let db = Database::in_memory().unwrap();
        db.upsert_account("Base Materials", None).unwrap();
        let (engine, llm) = engine_with_mock(&db);
        let mock = llm.as_mock().unwrap();
        // both tiers return nothing useful for this row
        mock.push_response("categorize_small", json!({"categorizations": []}));
        mock.push_response("categorize_large", json!({"categorizations": []}));

        let rows = vec![req(0, "???")];
        let (out, _) = engine
            .categorize(None, None, "Framing", &rows)
            .await
            .unwrap();
        assert_eq!(out[0].confidence, 0);
        assert!(out[0].source.is_none());
        assert_eq!(out[0].warning.as_deref(), Some("exhausted"));
    }
}
