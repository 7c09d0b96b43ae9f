//! Provider gateway for chat completions.
//!
//! [`ChatProvider`] adapters speak one endpoint's wire format. The
//! [`ProviderGateway`] wraps an adapter with bounded retry and exponential
//! backoff, and reports every attempt to a [`UsageSink`].

pub mod databricks;
pub mod error;
pub mod openai_compat;
pub mod types;
pub mod usage;
pub mod wire;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use databricks::DatabricksAdapter;
pub use error::{is_retryable_status, ErrorContext, ProviderError, RETRYABLE_STATUSES};
pub use openai_compat::OpenAiCompatAdapter;
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// Trait for chat completion providers.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Model identifier, for logs and usage records.
    fn model(&self) -> &str;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// What the classifier talks to.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Connection settings for one provider adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSettings {
    OpenAiCompat {
        base_url: String,
        model: String,
        api_key: Option<String>,
    },
    Databricks {
        url: String,
        token: String,
        model: String,
    },
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSettings::OpenAiCompat { .. } => ProviderKind::OpenAiCompat,
            ProviderSettings::Databricks { .. } => ProviderKind::Databricks,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderSettings::OpenAiCompat { model, .. } => model,
            ProviderSettings::Databricks { model, .. } => model,
        }
    }

    /// Build the adapter these settings describe.
    pub fn build(&self, timeout: Duration) -> Result<Box<dyn ChatProvider>, ProviderError> {
        Ok(match self {
            ProviderSettings::OpenAiCompat {
                base_url,
                model,
                api_key,
            } => Box::new(OpenAiCompatAdapter::with_config(
                base_url.clone(),
                model.clone(),
                api_key.as_deref(),
                timeout,
            )?),
            ProviderSettings::Databricks { url, token, model } => Box::new(
                DatabricksAdapter::with_config(url.clone(), token, model.clone(), timeout)?,
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on any single backoff sleep.
    pub max_retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_base_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(120),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    provider: Box<dyn ChatProvider>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn new(provider: Box<dyn ChatProvider>, usage_sink: Arc<U>) -> Self {
        Self::with_config(provider, usage_sink, GatewayConfig::default())
    }

    pub fn with_config(
        provider: Box<dyn ChatProvider>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub fn provider(&self) -> &dyn ChatProvider {
        self.provider.as_ref()
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let result = self.provider.chat(&req).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(resp) => {
                    let record = self
                        .base_record(&req, attempt)
                        .tokens(resp.input_tokens, resp.output_tokens)
                        .latency(latency_ms);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self
                        .base_record(&req, attempt)
                        .latency(latency_ms)
                        .error(err.code(), err.http_status());
                    self.usage_sink.record(record).await;

                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if attempt == max_attempts {
                        tracing::error!(
                            provider = self.provider.kind().as_str(),
                            endpoint = %self.provider.endpoint(),
                            attempts = attempt,
                            error = %err,
                            "retry ceiling reached"
                        );
                        return Err(ProviderError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt - 1)
                        .max(err.retry_after().unwrap_or_default())
                        .min(self.config.max_retry_delay);
                    tracing::warn!(
                        provider = self.provider.kind().as_str(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1, so the loop always returns.
        Err(ProviderError::provider(
            self.provider.kind().as_str(),
            "no attempts made",
            false,
        ))
    }

    fn base_record(&self, req: &ChatRequest, attempt: u32) -> ProviderCallRecord {
        ProviderCallRecord::new(
            self.provider.kind().as_str(),
            self.provider.model(),
            attempt,
            req.attribution.caller,
        )
        .job(req.attribution.job_id)
    }
}

fn backoff_delay(base: Duration, retry_index: u32) -> Duration {
    let multiplier = 2u32.pow(retry_index.min(5));
    base * multiplier
}
