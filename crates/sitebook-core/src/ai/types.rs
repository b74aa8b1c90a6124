//! Gateway request/response types
//!
//! Callers never see model identity beyond tier names; every operation
//! returns a normalized `GatewayReply` or a `GatewayError` from the closed
//! failure set.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input + self.output
    }
}

/// Normalized gateway response
#[derive(Debug, Clone)]
pub struct GatewayReply {
    /// Parsed JSON value matching the requested schema.
    pub value: serde_json::Value,
    pub usage: TokenUsage,
    pub elapsed_ms: u64,
}

/// The closed failure set for gateway calls
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Wall-clock timeout elapsed.
    Timeout,
    /// Token bucket drained or upstream 429.
    RateLimited,
    /// Well-formed HTTP response whose body is unusable. Never retried.
    InvalidResponse(String),
    /// Transport or 5xx failure.
    UpstreamError(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::InvalidResponse(msg) => write!(f, "invalid_response: {}", msg),
            Self::UpstreamError(msg) => write!(f, "upstream_error: {}", msg),
        }
    }
}

impl From<GatewayError> for Error {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Timeout => Error::UpstreamTimeout("LLM gateway".into()),
            GatewayError::RateLimited => Error::RateLimited("LLM gateway".into()),
            GatewayError::InvalidResponse(msg) => Error::UpstreamInvalid(msg),
            GatewayError::UpstreamError(msg) => Error::UpstreamUnavailable(msg),
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// An image handed to the vision tier
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Base64-encoded bytes.
    pub base64: String,
    /// Media type, e.g. "image/png".
    pub media_type: String,
}
