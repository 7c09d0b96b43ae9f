//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every provider attempt through a UsageSink. This keeps
//! the gateway free of any particular reporting backend:
//! - the CLI uses TracingUsageSink
//! - tests use NoopUsageSink or a collecting sink of their own

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one provider attempt.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name: "openai-compat" or "databricks".
    pub provider: &'static str,
    /// Model used.
    pub model: String,
    /// 1-based attempt number within the gateway's retry loop.
    pub attempt: u32,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Latency in milliseconds.
    pub latency_ms: u64,
    /// Call status.
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// HTTP status of a failed response, if any.
    pub http_status: Option<u16>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// Batch run this call belongs to.
    pub job_id: Option<Uuid>,
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(
        provider: &'static str,
        model: impl Into<String>,
        attempt: u32,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            attempt,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            http_status: None,
            caller,
            job_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn job(mut self, job_id: Option<Uuid>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn error(mut self, code: impl Into<String>, http_status: Option<u16>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self.http_status = http_status;
        self
    }
}

/// Trait for recording provider call usage.
///
/// Implement this trait to customize where usage data goes.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures should be logged
    /// but not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Usage sink that emits one `tracing` event per provider attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match record.status {
            CallStatus::Success => tracing::debug!(
                provider = record.provider,
                model = %record.model,
                attempt = record.attempt,
                latency_ms = record.latency_ms,
                tokens = record.input_tokens + record.output_tokens,
                caller = record.caller,
                "provider call succeeded"
            ),
            CallStatus::Error => tracing::warn!(
                provider = record.provider,
                model = %record.model,
                attempt = record.attempt,
                latency_ms = record.latency_ms,
                error_code = record.error_code.as_deref().unwrap_or("unknown"),
                http_status = record.http_status,
                caller = record.caller,
                "provider call failed"
            ),
        }
    }
}
