//! Error types for Sitebook

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Business rule violation: {0}")]
    BusinessRule(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream returned unusable response: {0}")]
    UpstreamInvalid(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, used in API error bodies and job logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::Unauthorized(_) => "unauthorized",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::BusinessRule(_) => "business_rule",
            Error::UpstreamTimeout(_) => "upstream_timeout",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::UpstreamInvalid(_) => "upstream_invalid",
            Error::RateLimited(_) => "rate_limited",
            Error::Database(_)
            | Error::Pool(_)
            | Error::Io(_)
            | Error::Http(_)
            | Error::Json(_)
            | Error::Internal(_) => "internal",
        }
    }

    /// Terminal errors are not retried by background jobs.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::BusinessRule(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Validation("x".into()).kind(), "validation");
        assert_eq!(Error::Conflict("x".into()).kind(), "conflict");
        assert_eq!(Error::BusinessRule("x".into()).kind(), "business_rule");
        assert_eq!(Error::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn test_terminal_errors() {
        assert!(Error::Validation("bad".into()).is_terminal());
        assert!(Error::BusinessRule("bad".into()).is_terminal());
        assert!(!Error::RateLimited("slow down".into()).is_terminal());
        assert!(!Error::NotFound("gone".into()).is_terminal());
    }
}
