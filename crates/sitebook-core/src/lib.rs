//! Sitebook Core Library
//!
//! Shared functionality for the Sitebook construction expense platform:
//! - Database access and migrations (expenses, intakes, messaging, audit)
//! - Fixed-point money handling end-to-end
//! - Tiered LLM gateway (small + large/vision) with token budgets
//! - Categorization cascade: cache, vendor affinity, ML, LLM escalation
//! - OCR pipeline for receipts and bills
//! - Rule-based auto-authorization engine with audit reports
//! - Receipt mismatch reconciliation
//! - Chat agent dispatcher with per-user cooldowns
//! - Background job queue with retry and dead-lettering

pub mod agents;
pub mod ai;
pub mod autoauth;
pub mod capability;
pub mod categorize;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod intake;
pub mod jobs;
pub mod models;
pub mod money;
pub mod ocr;
pub mod reconcile;

pub use ai::{GatewayError, GatewayReply, LlmBackend, LlmClient, TokenUsage};
pub use capability::CapabilityGate;
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use money::Money;
