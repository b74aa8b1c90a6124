//! TF-IDF + k-NN expense classifier
//!
//! Trained on human-verified assignments: expenses whose categorization
//! source is manual, or cache entries that landed with confidence >= 90.
//! Features are word uni/bi-grams over the normalized description plus a
//! stage token. Prediction is cosine k-NN with confidence-weighted voting;
//! the reported confidence is the winner's share of total neighbor weight
//! (a class margin), not a raw distance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;
use crate::fingerprint::normalize;

const MIN_TRAINING_ROWS: usize = 50;
const MAX_TRAINING_ROWS: usize = 2000;
const MAX_FEATURES: usize = 5000;
const MIN_DOC_FREQ: usize = 2;
const K_NEIGHBORS: usize = 5;

/// A unit-normalized sparse vector: (feature index, weight), sorted by index.
type SparseVec = Vec<(u32, f32)>;

struct TrainedModel {
    vocab: HashMap<String, u32>,
    idf: Vec<f32>,
    docs: Vec<SparseVec>,
    /// Parallel to `docs`: (account id, account name, training confidence).
    labels: Vec<(Uuid, String, f64)>,
    trained_at: DateTime<Utc>,
    feature_count: usize,
}

/// Model status snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClassifierStatus {
    pub is_trained: bool,
    pub training_size: usize,
    pub feature_count: usize,
    pub version: u64,
    pub last_trained_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// Prediction output
#[derive(Debug, Clone)]
pub struct Prediction {
    pub account_id: Uuid,
    pub account_name: String,
    pub confidence: i64,
}

pub struct Classifier {
    model: Mutex<Option<TrainedModel>>,
    version: AtomicU64,
    min_rows: usize,
    stale_after_hours: u64,
}

impl Classifier {
    pub fn new(stale_after_hours: u64) -> Self {
        Self {
            model: Mutex::new(None),
            version: AtomicU64::new(0),
            min_rows: MIN_TRAINING_ROWS,
            stale_after_hours,
        }
    }

    /// Lower the training-set floor (tests).
    pub fn with_min_rows(mut self, min_rows: usize) -> Self {
        self.min_rows = min_rows;
        self
    }

    /// Monotonic train counter; bumps on every successful retrain.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ClassifierStatus {
        let guard = self.model.lock().unwrap();
        match guard.as_ref() {
            Some(m) => ClassifierStatus {
                is_trained: true,
                training_size: m.docs.len(),
                feature_count: m.feature_count,
                version: self.version(),
                last_trained_at: Some(m.trained_at),
                stale: self.is_stale_inner(Some(m.trained_at)),
            },
            None => ClassifierStatus {
                is_trained: false,
                training_size: 0,
                feature_count: 0,
                version: self.version(),
                last_trained_at: None,
                stale: true,
            },
        }
    }

    fn is_stale_inner(&self, trained_at: Option<DateTime<Utc>>) -> bool {
        match trained_at {
            None => true,
            Some(t) => Utc::now() - t > Duration::hours(self.stale_after_hours as i64),
        }
    }

    /// Train if never trained or past the staleness window. Holds the model
    /// lock for the duration so concurrent callers don't retrain twice.
    pub fn ensure_trained(&self, db: &Database) -> Result<()> {
        let trained_at = self.model.lock().unwrap().as_ref().map(|m| m.trained_at);
        if !self.is_stale_inner(trained_at) {
            return Ok(());
        }
        self.train(db)
    }

    /// Rebuild the model from the database.
    pub fn train(&self, db: &Database) -> Result<()> {
        let started = Instant::now();
        let rows = Self::fetch_training_rows(db)?;

        if rows.len() < self.min_rows {
            warn!(
                rows = rows.len(),
                min = self.min_rows,
                "Classifier training skipped: insufficient data"
            );
            return Ok(());
        }

        // Tokenize everything up front.
        let tokenized: Vec<(Vec<String>, Uuid, String, f64)> = rows
            .into_iter()
            .map(|(text, stage, account_id, account_name, confidence)| {
                (
                    tokenize(&text, &stage),
                    account_id,
                    account_name,
                    confidence,
                )
            })
            .filter(|(tokens, _, _, _)| !tokens.is_empty())
            .collect();

        if tokenized.len() < self.min_rows {
            warn!("Classifier training skipped: too few rows after preprocessing");
            return Ok(());
        }

        // Document frequencies -> vocabulary, capped at MAX_FEATURES by df.
        let mut df: HashMap<&str, usize> = HashMap::new();
        for (tokens, _, _, _) in &tokenized {
            let mut seen: Vec<&str> = tokens.iter().map(|s| s.as_str()).collect();
            seen.sort_unstable();
            seen.dedup();
            for t in seen {
                *df.entry(t).or_insert(0) += 1;
            }
        }
        let mut terms: Vec<(&str, usize)> = df
            .iter()
            .filter(|(_, &count)| count >= MIN_DOC_FREQ)
            .map(|(&t, &c)| (t, c))
            .collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        terms.truncate(MAX_FEATURES);

        let n_docs = tokenized.len() as f32;
        let mut vocab = HashMap::with_capacity(terms.len());
        let mut idf = Vec::with_capacity(terms.len());
        for (i, (term, count)) in terms.iter().enumerate() {
            vocab.insert(term.to_string(), i as u32);
            idf.push((n_docs / *count as f32).ln().max(0.0) + 1.0);
        }

        // Build unit-normalized tf-idf vectors.
        let mut docs = Vec::with_capacity(tokenized.len());
        let mut labels = Vec::with_capacity(tokenized.len());
        for (tokens, account_id, account_name, confidence) in tokenized {
            let vec = vectorize(&tokens, &vocab, &idf);
            if vec.is_empty() {
                continue;
            }
            docs.push(vec);
            labels.push((account_id, account_name, confidence));
        }

        if docs.len() < self.min_rows {
            warn!("Classifier training skipped: too few non-empty vectors");
            return Ok(());
        }

        let feature_count = vocab.len();
        let size = docs.len();
        let model = TrainedModel {
            vocab,
            idf,
            docs,
            labels,
            trained_at: Utc::now(),
            feature_count,
        };

        *self.model.lock().unwrap() = Some(model);
        self.version.fetch_add(1, Ordering::SeqCst);

        info!(
            rows = size,
            features = feature_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classifier trained"
        );
        Ok(())
    }

    /// Predict the account for a description. Confidence 0 cases (untrained
    /// model, empty features) return None.
    pub fn predict(&self, description: &str, stage: &str) -> Option<Prediction> {
        let guard = self.model.lock().unwrap();
        let model = guard.as_ref()?;

        let tokens = tokenize(description, stage);
        let query = vectorize(&tokens, &model.vocab, &model.idf);
        if query.is_empty() {
            return None;
        }

        // Cosine similarity against every training doc; keep the top k.
        let mut sims: Vec<(f32, usize)> = model
            .docs
            .iter()
            .enumerate()
            .map(|(i, doc)| (sparse_dot(&query, doc), i))
            .collect();
        sims.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        sims.truncate(K_NEIGHBORS.min(sims.len()));

        let mut votes: HashMap<Uuid, (f64, String)> = HashMap::new();
        let mut total_weight = 0.0;
        for (sim, idx) in sims {
            let (account_id, account_name, training_conf) = &model.labels[idx];
            let weight = (sim.max(0.0) as f64) * (training_conf / 100.0);
            total_weight += weight;
            let entry = votes
                .entry(*account_id)
                .or_insert_with(|| (0.0, account_name.clone()));
            entry.0 += weight;
        }

        if total_weight <= 0.0 {
            return None;
        }

        let (account_id, (weight, account_name)) = votes
            .into_iter()
            .max_by(|a, b| {
                a.1 .0
                    .partial_cmp(&b.1 .0)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
        let confidence = ((weight / total_weight) * 100.0).round() as i64;

        Some(Prediction {
            account_id,
            account_name,
            confidence,
        })
    }

    /// Human-verified training rows: manual assignments, high-confidence
    /// cache entries, and explicit corrections (ground truth).
    fn fetch_training_rows(db: &Database) -> Result<Vec<(String, String, Uuid, String, f64)>> {
        let conn = db.conn()?;
        let mut out: Vec<(String, String, Uuid, String, f64)> = Vec::new();

        let mut stmt = conn.prepare(
            r#"
            SELECT e.description, p.stage, e.account_id, a.name,
                   COALESCE(e.confidence, 100)
              FROM expenses e
              JOIN accounts a ON a.id = e.account_id
              LEFT JOIN projects p ON p.id = e.project_id
             WHERE e.account_id IS NOT NULL AND e.deleted = 0
               AND (e.source = 'manual' OR e.source IS NULL
                    OR (e.source = 'cache' AND e.confidence >= 90))
             ORDER BY e.created_at DESC
             LIMIT ?
            "#,
        )?;
        let rows = stmt.query_map(params![MAX_TRAINING_ROWS as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;
        for row in rows {
            let (desc, stage, account_id, account_name, confidence) = row?;
            if let Ok(account_id) = Uuid::parse_str(&account_id) {
                out.push((
                    desc,
                    stage.unwrap_or_else(|| "General".into()),
                    account_id,
                    account_name,
                    confidence,
                ));
            }
        }

        // Corrections override: latest correction per normalized description
        // wins with confidence 100.
        let mut stmt = conn.prepare(
            r#"
            SELECT c.description, c.stage, c.corrected_account_id, c.corrected_account_name
              FROM categorization_corrections c
             ORDER BY c.created_at DESC
            "#,
        )?;
        let corrections = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut overrides: HashMap<String, (Uuid, String)> = HashMap::new();
        for (desc, _stage, account_id, account_name) in &corrections {
            let key = normalize(desc);
            if let Ok(id) = Uuid::parse_str(account_id) {
                overrides.entry(key).or_insert((id, account_name.clone()));
            }
        }
        for (desc, _stage, account_id, account_name, confidence) in &mut out {
            if let Some((id, name)) = overrides.get(&normalize(desc)) {
                *account_id = *id;
                *account_name = name.clone();
                *confidence = 100.0;
            }
        }

        Ok(out)
    }
}

fn tokenize(description: &str, stage: &str) -> Vec<String> {
    let text = normalize(description);
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();

    let mut tokens: Vec<String> = words.iter().map(|w| w.to_string()).collect();
    for pair in words.windows(2) {
        tokens.push(format!("{} {}", pair[0], pair[1]));
    }
    if !stage.trim().is_empty() {
        tokens.push(format!("stage:{}", stage.trim().to_lowercase()));
    }
    tokens
}

fn vectorize(tokens: &[String], vocab: &HashMap<String, u32>, idf: &[f32]) -> SparseVec {
    let mut tf: HashMap<u32, f32> = HashMap::new();
    for t in tokens {
        if let Some(&idx) = vocab.get(t) {
            *tf.entry(idx).or_insert(0.0) += 1.0;
        }
    }
    if tf.is_empty() {
        return Vec::new();
    }

    // sublinear tf * idf, then unit-normalize
    let mut vec: SparseVec = tf
        .into_iter()
        .map(|(idx, count)| (idx, (1.0 + count.ln()) * idf[idx as usize]))
        .collect();
    vec.sort_unstable_by_key(|(idx, _)| *idx);

    let norm: f32 = vec.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
    if norm > 0.0 {
        for (_, w) in vec.iter_mut() {
            *w /= norm;
        }
    }
    vec
}

/// Dot product of two sorted sparse vectors (cosine, both unit-normalized).
fn sparse_dot(a: &SparseVec, b: &SparseVec) -> f32 {
    let mut sum = 0.0;
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Equal => {
                sum += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategorizationSource, NewExpense, Role};
    use crate::money::Money;
    use chrono::NaiveDate;

    fn seed_expense(
        db: &Database,
        project: Uuid,
        user: Uuid,
        desc: &str,
        account: Uuid,
    ) {
        let e = NewExpense {
            project_id: project,
            txn_date: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            amount: Money::parse("10.00").unwrap(),
            vendor_id: None,
            account_id: Some(account),
            description: desc.to_string(),
            payment_method_id: None,
            bill_ref: None,
            external_ref: None,
            confidence: None,
            source: Some(CategorizationSource::Manual),
        };
        db.create_expense(&e, user).unwrap();
    }

    #[test]
    fn test_untrained_returns_none() {
        let clf = Classifier::new(6);
        assert!(clf.predict("2x4 lumber", "Framing").is_none());
        assert_eq!(clf.version(), 0);
        assert!(clf.status().stale);
    }

    #[test]
    fn test_train_and_predict() {
        let db = Database::in_memory().unwrap();
        let user = db
            .create_user("t@example.com", "T", Role::Bookkeeper, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();
        let lumber = db.upsert_account("Lumber & Materials", None).unwrap();
        let paint = db.upsert_account("Paint & Finishes", None).unwrap();

        for i in 0..6 {
            seed_expense(&db, project, user, &format!("2x4 lumber stud {}", i), lumber);
            seed_expense(&db, project, user, &format!("wood stud 2x4x8 {}", i), lumber);
            seed_expense(&db, project, user, &format!("interior paint gallon {}", i), paint);
            seed_expense(&db, project, user, &format!("paint roller kit {}", i), paint);
        }

        let clf = Classifier::new(6).with_min_rows(10);
        clf.train(&db).unwrap();
        assert_eq!(clf.version(), 1);
        assert!(clf.status().is_trained);

        let p = clf.predict("wood stud 2x4", "Framing").unwrap();
        assert_eq!(p.account_id, lumber);
        assert!(p.confidence > 50);

        let p = clf.predict("exterior paint gallon", "Framing").unwrap();
        assert_eq!(p.account_id, paint);
    }

    #[test]
    fn test_unknown_features_return_none() {
        let db = Database::in_memory().unwrap();
        let user = db
            .create_user("t@example.com", "T", Role::Bookkeeper, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();
        let lumber = db.upsert_account("Lumber & Materials", None).unwrap();
        for i in 0..12 {
            seed_expense(&db, project, user, &format!("2x4 lumber stud {}", i), lumber);
        }
        let clf = Classifier::new(6).with_min_rows(10);
        clf.train(&db).unwrap();

        // nothing in the vocabulary maps: zero vector -> no prediction
        assert!(clf.predict("zzz qqq", "Roofing").is_none());
    }
}
