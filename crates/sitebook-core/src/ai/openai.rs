//! OpenAI-compatible backend with two model tiers
//!
//! One long-lived HTTP client per tier. The small tier answers routing and
//! categorization calls under a 20s wall clock; the large tier handles
//! reasoning and vision under 90s. Each tier sits behind a token bucket:
//! callers over budget wait up to five seconds, then fail `RateLimited`.
//! `RateLimited` is retried once with exponential delay; `InvalidResponse`
//! is never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::parsing::extract_json;
use super::types::{GatewayError, GatewayReply, GatewayResult, ImagePayload, TokenUsage};
use super::LlmBackend;
use crate::config::Config;
use crate::db::{Database, LlmMetricRow};

const SMALL_TIMEOUT: Duration = Duration::from_secs(20);
const LARGE_TIMEOUT: Duration = Duration::from_secs(90);
const BUCKET_WAIT: Duration = Duration::from_secs(5);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    small_model: String,
    large_model: String,
    small_bucket: Arc<Semaphore>,
    large_bucket: Arc<Semaphore>,
    metrics: Option<Database>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

enum Tier {
    Small,
    Large,
}

impl OpenAiBackend {
    pub fn new(config: &Config, api_key: &str, metrics: Option<Database>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            small_model: config.small_model.clone(),
            large_model: config.large_model.clone(),
            small_bucket: Arc::new(Semaphore::new(config.small_bucket.max(1))),
            large_bucket: Arc::new(Semaphore::new(config.large_bucket.max(1))),
            metrics,
        }
    }

    fn tier_parts(&self, tier: &Tier) -> (&str, Duration, &Arc<Semaphore>) {
        match tier {
            Tier::Small => (&self.small_model, SMALL_TIMEOUT, &self.small_bucket),
            Tier::Large => (&self.large_model, LARGE_TIMEOUT, &self.large_bucket),
        }
    }

    async fn call(
        &self,
        operation: &str,
        tier: Tier,
        system: &str,
        user_content: serde_json::Value,
        max_tokens: u32,
    ) -> GatewayResult<GatewayReply> {
        let (model, timeout, bucket) = self.tier_parts(&tier);

        let mut attempt = 0;
        loop {
            let result = self
                .call_once(model, timeout, bucket, system, &user_content, max_tokens)
                .await;
            self.record(operation, model, &result);

            match result {
                // One bounded retry on rate limiting, nothing else.
                Err(GatewayError::RateLimited) if attempt == 0 => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(operation, model, "Rate limited, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn call_once(
        &self,
        model: &str,
        timeout: Duration,
        bucket: &Arc<Semaphore>,
        system: &str,
        user_content: &serde_json::Value,
        max_tokens: u32,
    ) -> GatewayResult<GatewayReply> {
        // Token bucket: wait up to five seconds for a slot.
        let _permit = tokio::time::timeout(BUCKET_WAIT, bucket.clone().acquire_owned())
            .await
            .map_err(|_| GatewayError::RateLimited)?
            .map_err(|_| GatewayError::UpstreamError("gateway shut down".into()))?;

        let started = Instant::now();
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content},
            ],
            "temperature": 0.1,
            "max_completion_tokens": max_tokens,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::UpstreamError(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }
        if !status.is_success() {
            return Err(GatewayError::UpstreamError(format!("HTTP {}", status)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("");
        if text.trim().is_empty() {
            return Err(GatewayError::InvalidResponse("empty completion".into()));
        }

        let value = extract_json(text)?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input: u.prompt_tokens,
                output: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(GatewayReply {
            value,
            usage,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn record(&self, operation: &str, model: &str, result: &GatewayResult<GatewayReply>) {
        let Some(db) = &self.metrics else { return };
        let row = match result {
            Ok(reply) => LlmMetricRow {
                operation: operation.to_string(),
                model: model.to_string(),
                latency_ms: reply.elapsed_ms as i64,
                success: true,
                error: None,
                tokens_in: reply.usage.input,
                tokens_out: reply.usage.output,
            },
            Err(e) => LlmMetricRow {
                operation: operation.to_string(),
                model: model.to_string(),
                latency_ms: 0,
                success: false,
                error: Some(e.to_string()),
                tokens_in: 0,
                tokens_out: 0,
            },
        };
        db.record_llm_metric(&row);
    }

    fn vision_content(prompt: &str, images: &[ImagePayload]) -> serde_json::Value {
        let mut blocks = vec![json!({"type": "text", "text": prompt})];
        for img in images {
            blocks.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", img.media_type, img.base64),
                    "detail": "high",
                }
            }));
        }
        serde_json::Value::Array(blocks)
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn classify_small(
        &self,
        operation: &str,
        system: &str,
        user: &str,
    ) -> GatewayResult<GatewayReply> {
        self.call(
            operation,
            Tier::Small,
            system,
            serde_json::Value::String(user.to_string()),
            2000,
        )
        .await
    }

    async fn analyze_large(
        &self,
        operation: &str,
        system: &str,
        user: &str,
        images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply> {
        let content = if images.is_empty() {
            serde_json::Value::String(user.to_string())
        } else {
            Self::vision_content(user, images)
        };
        self.call(operation, Tier::Large, system, content, 4000).await
    }

    async fn extract_vision(
        &self,
        operation: &str,
        prompt: &str,
        images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply> {
        self.call(
            operation,
            Tier::Large,
            "You are an expert at reading receipts, invoices, and bills.",
            Self::vision_content(prompt, images),
            4000,
        )
        .await
    }

    async fn health_check(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(r) => {
                let ok = r.status().is_success();
                if ok {
                    info!("LLM backend reachable at {}", self.base_url);
                }
                ok
            }
            Err(_) => false,
        }
    }

    fn small_model(&self) -> &str {
        &self.small_model
    }

    fn large_model(&self) -> &str {
        &self.large_model
    }
}
