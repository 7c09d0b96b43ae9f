//! Adapter for OpenAI-compatible chat servers (vLLM, self-hosted Qwen).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::error::ProviderError;
use super::types::{ChatRequest, ChatResponse, ProviderKind};
use super::wire::{post_chat, Endpoint};
use super::ChatProvider;

/// Idle connections kept per host; matches the default worker pool ceiling.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Adapter whose replies always carry `message.content` as a flat string.
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatAdapter {
    /// Create with custom configuration.
    pub fn with_config(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(ProviderError::config("openai-compat base URL is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let auth_value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ProviderError::config("invalid API key format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .pool_max_idle_per_host(DEFAULT_POOL_SIZE)
            .build()
            .map_err(|e| ProviderError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompat
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        self.chat_url()
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = self.chat_url();
        post_chat(
            &self.client,
            Endpoint {
                provider: ProviderKind::OpenAiCompat,
                url: &url,
                model: &self.model,
                send_model: true,
                default_timeout: self.timeout,
            },
            req,
        )
        .await
    }
}
