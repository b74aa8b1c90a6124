//! Mock backend for testing
//!
//! Responses are queued per operation; tests push what the next call should
//! return. Unqueued operations get a small deterministic default so happy
//! paths work without setup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use super::types::{GatewayError, GatewayReply, GatewayResult, ImagePayload, TokenUsage};
use super::LlmBackend;

#[derive(Clone, Default)]
pub struct MockBackend {
    queues: Arc<Mutex<HashMap<String, Vec<serde_json::Value>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next reply for an operation (FIFO).
    pub fn push_response(&self, operation: &str, value: serde_json::Value) {
        self.queues
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push(value);
    }

    /// Operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn reply(&self, operation: &str) -> GatewayResult<GatewayReply> {
        self.calls.lock().unwrap().push(operation.to_string());

        let queued = {
            let mut queues = self.queues.lock().unwrap();
            queues.get_mut(operation).and_then(|q| {
                if q.is_empty() {
                    None
                } else {
                    Some(q.remove(0))
                }
            })
        };

        let value = match queued {
            Some(v) if v.get("__error").is_some() => {
                return Err(GatewayError::UpstreamError(
                    v["__error"].as_str().unwrap_or("mock failure").to_string(),
                ));
            }
            Some(v) => v,
            None => json!({"mock": true, "operation": operation}),
        };

        Ok(GatewayReply {
            value,
            usage: TokenUsage {
                input: 50,
                output: 20,
            },
            elapsed_ms: 1,
        })
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn classify_small(
        &self,
        operation: &str,
        _system: &str,
        _user: &str,
    ) -> GatewayResult<GatewayReply> {
        self.reply(operation)
    }

    async fn analyze_large(
        &self,
        operation: &str,
        _system: &str,
        _user: &str,
        _images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply> {
        self.reply(operation)
    }

    async fn extract_vision(
        &self,
        operation: &str,
        _prompt: &str,
        _images: &[ImagePayload],
    ) -> GatewayResult<GatewayReply> {
        self.reply(operation)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn small_model(&self) -> &str {
        "mock-small"
    }

    fn large_model(&self) -> &str {
        "mock-large"
    }
}
