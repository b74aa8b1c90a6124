//! Request handlers, organized by domain

mod agents;
mod auth;
mod autoauth;
mod expenses;
mod messages;
mod receipts;
mod system;

pub use agents::agent_message;
pub use auth::{health, login};
pub use autoauth::{get_report, run_auto_auth};
pub use expenses::{
    create_expense, create_expense_batch, delete_expense, expense_history, expense_summary,
    get_expense, list_expenses, patch_expense, set_expense_status,
};
pub use messages::{list_messages, mark_channel_read, post_message, unread_counts};
pub use receipts::{
    get_receipt, list_receipts, process_receipt, reconcile_receipt, reject_receipt,
    upload_receipt,
};
pub use system::{classifier_status, list_audit, ocr_metrics, train_classifier};
