//! Runtime configuration
//!
//! All knobs are read from `SITEBOOK_*` environment variables at boot.
//! Missing values fall back to defaults suitable for local development;
//! only the LLM credentials have no default (AI features disable without
//! them).

use std::path::PathBuf;

/// Engine and pipeline configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub db_path: String,
    /// Directory for uploaded receipt blobs.
    pub blob_dir: PathBuf,
    /// API key for the LLM provider (None disables AI tiers).
    pub llm_api_key: Option<String>,
    /// Base URL of the LLM provider.
    pub llm_base_url: String,
    /// Small-tier model id.
    pub small_model: String,
    /// Large/vision-tier model id.
    pub large_model: String,
    /// Token bucket sizes (concurrent in-flight calls per tier).
    pub small_bucket: usize,
    pub large_bucket: usize,
    /// Minimum confidence for the small LLM tier to win a categorization.
    pub min_confidence: i64,
    /// Amount tolerance: absolute cents and relative fraction.
    pub amount_tolerance_cents: i64,
    pub amount_tolerance_pct: f64,
    /// Vendor-name fuzzy match threshold, 0-100.
    pub fuzzy_threshold: f64,
    /// Agent dispatcher cooldown per (user, channel, agent).
    pub cooldown_seconds: u64,
    /// Auto-auth digest flush cadence.
    pub digest_interval_hours: u64,
    /// Categorization cache TTL.
    pub cache_ttl_days: i64,
    /// ML classifier retrain cadence.
    pub retrain_interval_hours: u64,
    /// HS256 secret for bearer tokens.
    pub jwt_secret: String,
    /// Upload cap in bytes.
    pub max_upload_bytes: usize,
    /// OCR confidence below which intakes route to check_review.
    pub review_confidence: i64,
    /// Days in pending before the health sweep escalates (R6).
    pub pending_escalate_days: i64,
    /// Per-run amount ceiling for auto-authorization (R5).
    pub auth_amount_limit_cents: i64,
    /// Whether bill references alone may authorize (R2).
    pub bill_auth_enabled: bool,
    /// Power-tool lexicon for the categorization guard, comma separated.
    pub power_tool_lexicon: Vec<String>,
    /// Account-name fragments that always escalate (R5). Tool accounts are
    /// on the list out of the box: power tools are capital assets and never
    /// auto-authorize.
    pub escalation_accounts: Vec<String>,
    /// Auto-apply high-confidence reconciler suggestions.
    pub auto_apply_reconcile: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Default power-tool terms. Consumables for tools (bits, blades, nails)
/// are exempted in the categorization guard, not here.
pub const DEFAULT_POWER_TOOLS: &[&str] = &[
    "drill",
    "saw",
    "grinder",
    "nail gun",
    "nailer",
    "sander",
    "router",
    "impact driver",
    "circular saw",
    "angle grinder",
];

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: env_or("SITEBOOK_DB_PATH", "sitebook.db"),
            blob_dir: PathBuf::from(env_or("SITEBOOK_BLOB_DIR", "receipts")),
            llm_api_key: std::env::var("SITEBOOK_LLM_API_KEY").ok(),
            llm_base_url: env_or("SITEBOOK_LLM_BASE_URL", "https://api.openai.com/v1"),
            small_model: env_or("SITEBOOK_SMALL_MODEL", "gpt-5-mini"),
            large_model: env_or("SITEBOOK_LARGE_MODEL", "gpt-5.2"),
            small_bucket: env_parse("SITEBOOK_SMALL_BUCKET", 8),
            large_bucket: env_parse("SITEBOOK_LARGE_BUCKET", 2),
            min_confidence: env_parse("SITEBOOK_MIN_CONFIDENCE", 70),
            amount_tolerance_cents: env_parse("SITEBOOK_AMOUNT_TOLERANCE_ABS", 5),
            amount_tolerance_pct: env_parse("SITEBOOK_AMOUNT_TOLERANCE_PCT", 0.005),
            fuzzy_threshold: env_parse("SITEBOOK_FUZZY_THRESHOLD", 85.0),
            cooldown_seconds: env_parse("SITEBOOK_COOLDOWN_SECONDS", 5),
            digest_interval_hours: env_parse("SITEBOOK_DIGEST_INTERVAL_HOURS", 4),
            cache_ttl_days: env_parse("SITEBOOK_CACHE_TTL_DAYS", 30),
            retrain_interval_hours: env_parse("SITEBOOK_RETRAIN_INTERVAL_HOURS", 6),
            jwt_secret: env_or("SITEBOOK_JWT_SECRET", "sitebook-dev-secret"),
            max_upload_bytes: env_parse("SITEBOOK_MAX_UPLOAD_BYTES", 20 * 1024 * 1024),
            review_confidence: env_parse("SITEBOOK_REVIEW_CONFIDENCE", 60),
            pending_escalate_days: env_parse("SITEBOOK_PENDING_ESCALATE_DAYS", 14),
            auth_amount_limit_cents: env_parse("SITEBOOK_AUTH_AMOUNT_LIMIT", 500_000),
            bill_auth_enabled: env_parse("SITEBOOK_BILL_AUTH_ENABLED", true),
            power_tool_lexicon: env_list("SITEBOOK_POWER_TOOL_LEXICON", DEFAULT_POWER_TOOLS),
            escalation_accounts: env_list("SITEBOOK_ESCALATION_ACCOUNTS", &["tools"]),
            auto_apply_reconcile: env_parse("SITEBOOK_AUTO_APPLY_RECONCILE", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults without consulting the environment, for tests.
        Self {
            db_path: "sitebook.db".into(),
            blob_dir: PathBuf::from("receipts"),
            llm_api_key: None,
            llm_base_url: "https://api.openai.com/v1".into(),
            small_model: "gpt-5-mini".into(),
            large_model: "gpt-5.2".into(),
            small_bucket: 8,
            large_bucket: 2,
            min_confidence: 70,
            amount_tolerance_cents: 5,
            amount_tolerance_pct: 0.005,
            fuzzy_threshold: 85.0,
            cooldown_seconds: 5,
            digest_interval_hours: 4,
            cache_ttl_days: 30,
            retrain_interval_hours: 6,
            jwt_secret: "sitebook-dev-secret".into(),
            max_upload_bytes: 20 * 1024 * 1024,
            review_confidence: 60,
            pending_escalate_days: 14,
            auth_amount_limit_cents: 500_000,
            bill_auth_enabled: true,
            power_tool_lexicon: DEFAULT_POWER_TOOLS.iter().map(|s| s.to_string()).collect(),
            escalation_accounts: vec!["tools".into()],
            auto_apply_reconcile: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.min_confidence, 70);
        assert_eq!(cfg.amount_tolerance_cents, 5);
        assert_eq!(cfg.cooldown_seconds, 5);
        assert!(cfg.power_tool_lexicon.contains(&"drill".to_string()));
        assert!(cfg.escalation_accounts.contains(&"tools".to_string()));
        assert!(!cfg.auto_apply_reconcile);
    }
}
