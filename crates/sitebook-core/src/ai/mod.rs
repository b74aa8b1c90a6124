//! Tiered LLM gateway
//!
//! Callers see three operations and two tiers, never model identity:
//! - `classify_small` - routing and categorization (small tier, 20s)
//! - `analyze_large` - reasoning, optionally with images (large tier, 90s)
//! - `extract_vision` - structured receipt extraction (large tier, 90s)
//!
//! `LlmBackend` is the trait; `LlmClient` is the concrete enum offering
//! Clone and compile-time dispatch without `Box<dyn>`.

mod mock;
mod openai;
pub mod parsing;
pub mod types;

pub use mock::MockBackend;
pub use openai::OpenAiBackend;
pub use types::{GatewayError, GatewayReply, GatewayResult, ImagePayload, TokenUsage};

use async_trait::async_trait;

use crate::config::Config;
use crate::db::Database;

/// Interface over the model tiers
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Small-tier structured call. The system prompt must demand JSON
    /// matching the caller's schema.
    async fn classify_small(
        &self,
        operation: &str,
        system: &str,
        user: &str,
    ) -> GatewayResult<GatewayReply>;

    /// Large-tier structured call, optionally with images.
    async fn analyze_large(
        &self,
        operation: &str,
        system: &str,
        user: &str,
        images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply>;

    /// Vision extraction over a page-image set.
    async fn extract_vision(
        &self,
        operation: &str,
        prompt: &str,
        images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> bool;

    fn small_model(&self) -> &str;
    fn large_model(&self) -> &str;
}

/// Concrete client enum
#[derive(Clone)]
pub enum LlmClient {
    OpenAi(OpenAiBackend),
    Mock(MockBackend),
}

impl LlmClient {
    /// Build from configuration. Returns None without credentials, which
    /// disables the LLM tiers of the categorization cascade and OCR heavy
    /// mode.
    pub fn from_config(config: &Config, metrics: Option<Database>) -> Option<Self> {
        config
            .llm_api_key
            .as_deref()
            .map(|key| LlmClient::OpenAi(OpenAiBackend::new(config, key, metrics)))
    }

    pub fn mock() -> Self {
        LlmClient::Mock(MockBackend::new())
    }

    /// Access the mock for response queueing in tests.
    pub fn as_mock(&self) -> Option<&MockBackend> {
        match self {
            LlmClient::Mock(m) => Some(m),
            _ => None,
        }
    }
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn classify_small(
        &self,
        operation: &str,
        system: &str,
        user: &str,
    ) -> GatewayResult<GatewayReply> {
        match self {
            LlmClient::OpenAi(b) => b.classify_small(operation, system, user).await,
            LlmClient::Mock(b) => b.classify_small(operation, system, user).await,
        }
    }

    async fn analyze_large(
        &self,
        operation: &str,
        system: &str,
        user: &str,
        images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply> {
        match self {
            LlmClient::OpenAi(b) => b.analyze_large(operation, system, user, images).await,
            LlmClient::Mock(b) => b.analyze_large(operation, system, user, images).await,
        }
    }

    async fn extract_vision(
        &self,
        operation: &str,
        prompt: &str,
        images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply> {
        match self {
            LlmClient::OpenAi(b) => b.extract_vision(operation, prompt, images).await,
            LlmClient::Mock(b) => b.extract_vision(operation, prompt, images).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            LlmClient::OpenAi(b) => b.health_check().await,
            LlmClient::Mock(b) => b.health_check().await,
        }
    }

    fn small_model(&self) -> &str {
        match self {
            LlmClient::OpenAi(b) => b.small_model(),
            LlmClient::Mock(b) => b.small_model(),
        }
    }

    fn large_model(&self) -> &str {
        match self {
            LlmClient::OpenAi(b) => b.large_model(),
            LlmClient::Mock(b) => b.large_model(),
        }
    }
}
