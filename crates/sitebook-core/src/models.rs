//! Domain models for Sitebook

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;

/// Expense lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseStatus {
    Pending,
    Authorized,
    Review,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Review => "review",
        }
    }

    /// The allowed transition table. `authorized -> pending` is forbidden
    /// because it would erase the authorizer trail.
    pub fn can_transition_to(&self, next: ExpenseStatus) -> bool {
        use ExpenseStatus::*;
        matches!(
            (self, next),
            (Pending, Authorized)
                | (Pending, Review)
                | (Authorized, Review)
                | (Review, Authorized)
                | (Review, Pending)
        )
    }
}

impl std::str::FromStr for ExpenseStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "authorized" => Ok(Self::Authorized),
            "review" => Ok(Self::Review),
            _ => Err(format!("Unknown expense status: {}", s)),
        }
    }
}

impl std::fmt::Display for ExpenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a categorization decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationSource {
    Cache,
    Affinity,
    Ml,
    LlmSmall,
    LlmLarge,
    Manual,
}

impl CategorizationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Affinity => "affinity",
            Self::Ml => "ml",
            Self::LlmSmall => "llm_small",
            Self::LlmLarge => "llm_large",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for CategorizationSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cache" => Ok(Self::Cache),
            "affinity" => Ok(Self::Affinity),
            "ml" => Ok(Self::Ml),
            "llm_small" => Ok(Self::LlmSmall),
            "llm_large" => Ok(Self::LlmLarge),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown categorization source: {}", s)),
        }
    }
}

impl std::fmt::Display for CategorizationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A ledger expense row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: Uuid,
    pub project_id: Uuid,
    pub txn_date: NaiveDate,
    pub amount: Money,
    pub vendor_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub description: String,
    pub payment_method_id: Option<Uuid>,
    /// Bill/invoice reference string from the source document.
    pub bill_ref: Option<String>,
    /// Upstream id from the reference accounting system (QuickBooks staging).
    pub external_ref: Option<String>,
    pub status: ExpenseStatus,
    /// Set only while status is authorized.
    pub authorized_by: Option<Uuid>,
    pub status_reason: Option<String>,
    pub updated_by: Uuid,
    pub confidence: Option<i64>,
    pub source: Option<CategorizationSource>,
    /// Opaque token echoed on updates for compare-and-set.
    pub version_token: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new expense
#[derive(Debug, Clone)]
pub struct NewExpense {
    pub project_id: Uuid,
    pub txn_date: NaiveDate,
    pub amount: Money,
    pub vendor_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub description: String,
    pub payment_method_id: Option<Uuid>,
    pub bill_ref: Option<String>,
    pub external_ref: Option<String>,
    pub confidence: Option<i64>,
    pub source: Option<CategorizationSource>,
}

/// A patch against an existing expense. `None` fields are untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpensePatch {
    pub txn_date: Option<NaiveDate>,
    pub amount: Option<Money>,
    pub vendor_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub description: Option<String>,
    pub payment_method_id: Option<Uuid>,
    pub bill_ref: Option<String>,
}

/// Receipt intake lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeStatus {
    Pending,
    Processing,
    Ready,
    Linked,
    Duplicate,
    CheckReview,
    Rejected,
    Error,
}

impl IntakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Linked => "linked",
            Self::Duplicate => "duplicate",
            Self::CheckReview => "check_review",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Linked | Self::Rejected | Self::Duplicate | Self::Error
        )
    }
}

impl std::str::FromStr for IntakeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "linked" => Ok(Self::Linked),
            "duplicate" => Ok(Self::Duplicate),
            "check_review" => Ok(Self::CheckReview),
            "rejected" => Ok(Self::Rejected),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown intake status: {}", s)),
        }
    }
}

impl std::fmt::Display for IntakeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An uploaded receipt awaiting conversion into expenses
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptIntake {
    pub id: Uuid,
    pub project_id: Uuid,
    pub uploader_id: Uuid,
    /// Blob key in the storage directory.
    pub storage_key: String,
    pub file_hash: String,
    pub mime_type: String,
    pub extracted_text: Option<String>,
    /// JSON snapshot of the parsed receipt record.
    pub parsed: Option<serde_json::Value>,
    pub status: IntakeStatus,
    pub status_reason: Option<String>,
    pub created_expense_ids: Vec<Uuid>,
    pub batch_id: Option<Uuid>,
    pub thumbnail_key: Option<String>,
    pub vault_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Auto-authorization decision per expense
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthDecision {
    Authorized,
    Duplicate,
    MissingInfo,
    Escalated,
}

impl AuthDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorized => "authorized",
            Self::Duplicate => "duplicate",
            Self::MissingInfo => "missing_info",
            Self::Escalated => "escalated",
        }
    }
}

impl std::str::FromStr for AuthDecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "authorized" => Ok(Self::Authorized),
            "duplicate" => Ok(Self::Duplicate),
            "missing_info" => Ok(Self::MissingInfo),
            "escalated" => Ok(Self::Escalated),
            _ => Err(format!("Unknown auth decision: {}", s)),
        }
    }
}

impl std::fmt::Display for AuthDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One engine decision captured inside an auth report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub expense_id: Uuid,
    pub vendor: String,
    pub amount: Money,
    pub date: Option<NaiveDate>,
    /// Stable rule identifier, e.g. "R1_EXACT_DUP".
    pub rule: String,
    pub decision: AuthDecision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    /// Set when a conditional update lost a race against a human action.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped_race: bool,
}

/// Aggregate summary of one auto-auth run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSummary {
    pub authorized: usize,
    pub duplicates: usize,
    pub missing_info: usize,
    pub escalated: usize,
    pub authorized_amount: Money,
}

/// A persisted auto-auth run report
#[derive(Debug, Clone, Serialize)]
pub struct AuthReport {
    pub id: Uuid,
    /// Client/run-supplied id used to deduplicate digests.
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub summary: AuthSummary,
    pub decisions: Vec<DecisionRecord>,
    pub created_at: DateTime<Utc>,
}

/// A chat message in a channel
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    /// Synthetic channel key, `type:scope_id`.
    pub channel_key: String,
    pub author_id: Uuid,
    pub body: String,
    /// Rendered blocks (card, buttons, attachments) as JSON.
    pub blocks: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub reply_to: Option<Uuid>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// A change-log entry for one expense field
#[derive(Debug, Clone, Serialize)]
pub struct ChangeLogRow {
    pub id: i64,
    pub expense_id: Uuid,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: Uuid,
    pub status_at_change: ExpenseStatus,
    pub created_at: DateTime<Utc>,
}

/// A status-log entry for one expense transition
#[derive(Debug, Clone, Serialize)]
pub struct StatusLogRow {
    pub id: i64,
    pub expense_id: Uuid,
    pub old_status: ExpenseStatus,
    pub new_status: ExpenseStatus,
    pub changed_by: Uuid,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// User roles, a closed set. Capabilities are stored per role in the
/// `role_capabilities` table; the enum names the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Bookkeeper,
    ProjectManager,
    AccountingManager,
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Bookkeeper => "bookkeeper",
            Self::ProjectManager => "project_manager",
            Self::AccountingManager => "accounting_manager",
            Self::Bot => "bot",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "bookkeeper" => Ok(Self::Bookkeeper),
            "project_manager" => Ok(Self::ProjectManager),
            "accounting_manager" => Ok(Self::AccountingManager),
            "bot" => Ok(Self::Bot),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A platform user
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Master-data lookups held by id. Weak references only: resolved to names
/// for rendering, never cached past a single operation.
#[derive(Debug, Clone, Serialize)]
pub struct NamedRef {
    pub id: Uuid,
    pub name: String,
}

/// A line item produced by the OCR pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptLineItem {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<Money>,
    pub line_total: Money,
    /// Tax share folded into `line_total` during distribution.
    #[serde(default)]
    pub tax_included: Option<Money>,
    /// Per-field extraction confidence, 0-100.
    pub confidence: i64,
}

/// How the extracted totals reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalMatch {
    Total,
    Subtotal,
    Mismatch,
}

impl TotalMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Subtotal => "subtotal",
            Self::Mismatch => "mismatch",
        }
    }
}

impl std::str::FromStr for TotalMatch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "total" => Ok(Self::Total),
            "subtotal" => Ok(Self::Subtotal),
            "mismatch" => Ok(Self::Mismatch),
            _ => Err(format!("Unknown total match type: {}", s)),
        }
    }
}

/// Normalized record extracted from a receipt or bill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedReceipt {
    pub vendor: Option<String>,
    pub vendor_confidence: i64,
    pub date: Option<NaiveDate>,
    pub date_confidence: i64,
    pub bill_ref: Option<String>,
    pub subtotal: Option<Money>,
    pub tax: Option<Money>,
    pub total: Option<Money>,
    pub total_confidence: i64,
    pub line_items: Vec<ReceiptLineItem>,
    pub total_match: TotalMatch,
}

impl ExtractedReceipt {
    /// Lowest scalar confidence across the record, used for the
    /// human-in-the-loop gate.
    pub fn min_confidence(&self) -> i64 {
        let mut min = self
            .total_confidence
            .min(self.vendor_confidence)
            .min(self.date_confidence);
        for item in &self.line_items {
            min = min.min(item.confidence);
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use ExpenseStatus::*;
        assert!(Pending.can_transition_to(Authorized));
        assert!(Pending.can_transition_to(Review));
        assert!(Authorized.can_transition_to(Review));
        assert!(Review.can_transition_to(Authorized));
        assert!(Review.can_transition_to(Pending));
        // the forbidden edge
        assert!(!Authorized.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_intake_terminal_states() {
        assert!(IntakeStatus::Linked.is_terminal());
        assert!(IntakeStatus::Rejected.is_terminal());
        assert!(IntakeStatus::Duplicate.is_terminal());
        assert!(IntakeStatus::Error.is_terminal());
        assert!(!IntakeStatus::Pending.is_terminal());
        assert!(!IntakeStatus::CheckReview.is_terminal());
    }

    #[test]
    fn test_enum_round_trips() {
        for s in ["pending", "authorized", "review"] {
            let v: ExpenseStatus = s.parse().unwrap();
            assert_eq!(v.as_str(), s);
        }
        for s in ["cache", "affinity", "ml", "llm_small", "llm_large", "manual"] {
            let v: CategorizationSource = s.parse().unwrap();
            assert_eq!(v.as_str(), s);
        }
        for s in ["authorized", "duplicate", "missing_info", "escalated"] {
            let v: AuthDecision = s.parse().unwrap();
            assert_eq!(v.as_str(), s);
        }
    }

    #[test]
    fn test_extracted_receipt_min_confidence() {
        let r = ExtractedReceipt {
            vendor: Some("Home Depot".into()),
            vendor_confidence: 95,
            date: None,
            date_confidence: 80,
            bill_ref: None,
            subtotal: None,
            tax: None,
            total: Some(Money::parse("10.00").unwrap()),
            total_confidence: 90,
            line_items: vec![ReceiptLineItem {
                description: "2x4 lumber".into(),
                quantity: Some(2.0),
                unit_price: None,
                line_total: Money::parse("10.00").unwrap(),
                tax_included: None,
                confidence: 55,
            }],
            total_match: TotalMatch::Total,
        };
        assert_eq!(r.min_confidence(), 55);
    }
}
