//! Error types for the provider gateway.

use std::time::Duration;
use thiserror::Error;

/// HTTP statuses the gateway treats as transient and retries.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Whether an HTTP status is in the transient set.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
    /// Raw response body, truncated.
    pub body: Option<String>,
}

/// Longest body excerpt kept in an [`ErrorContext`].
const MAX_BODY_EXCERPT: usize = 2_000;

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        let excerpt: String = body.chars().take(MAX_BODY_EXCERPT).collect();
        self.body = Some(excerpt);
        self
    }
}

/// Errors that can occur when calling providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider returned 429.
    #[error("rate limited (HTTP 429): {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
        context: Option<ErrorContext>,
    },

    /// Provider error, retryable when the status is in the transient set.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    /// The provider answered 2xx but the body carried no usable reply.
    #[error("{provider} returned an unusable reply: {message}")]
    InvalidReply {
        provider: &'static str,
        message: String,
    },

    /// Request timed out - retryable.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing endpoint, bad token, etc.).
    #[error("configuration error: {0}")]
    Config(String),

    /// Retry ceiling reached; wraps the final attempt's error.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Create a rate limited error from a provider 429.
    pub fn rate_limited(
        message: impl Into<String>,
        retry_after: Option<Duration>,
        context: ErrorContext,
    ) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
            context: Some(context),
        }
    }

    /// Create a provider error.
    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    /// Create a provider error with context.
    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    /// Create an invalid reply error.
    pub fn invalid_reply(provider: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidReply {
            provider,
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidReply { .. } => false,
            Self::Config(_) => false,
            Self::RetriesExhausted { .. } => false,
        }
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Provider { .. } => "provider_error",
            Self::InvalidReply { .. } => "invalid_reply",
            Self::Timeout(_) => "timeout",
            Self::Http(e) if e.is_connect() => "connect_error",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::Provider { context, .. } => context.as_ref(),
            Self::RetriesExhausted { last, .. } => last.context(),
            Self::InvalidReply { .. } | Self::Timeout(_) | Self::Http(_) | Self::Config(_) => {
                None
            }
        }
    }

    /// HTTP status of the (final) failing response, if there was one.
    pub fn http_status(&self) -> Option<u16> {
        self.context().and_then(|c| c.http_status)
    }

    /// Provider-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_exactly_the_retry_set() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404, 501, 505] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn exhausted_error_keeps_original_status_and_text() {
        let last = ProviderError::provider_with_context(
            "databricks",
            "HTTP 503: upstream overloaded",
            true,
            ErrorContext::new().with_status(503),
        );
        let err = ProviderError::RetriesExhausted {
            attempts: 11,
            last: Box::new(last),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.http_status(), Some(503));
        let msg = err.to_string();
        assert!(msg.contains("11 attempts"), "{msg}");
        assert!(msg.contains("HTTP 503: upstream overloaded"), "{msg}");
    }

    #[test]
    fn body_excerpt_is_bounded() {
        let body = "x".repeat(MAX_BODY_EXCERPT * 2);
        let ctx = ErrorContext::new().with_body(&body);
        assert_eq!(ctx.body.map(|b| b.len()), Some(MAX_BODY_EXCERPT));
    }
}
