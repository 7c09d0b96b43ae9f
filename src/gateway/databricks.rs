//! Adapter for Databricks model serving endpoints.
//!
//! The serving URL already names the model, so the model id is kept only for
//! usage records. Reasoning models answer with a list of typed segments; the
//! shared wire layer flattens them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::error::ProviderError;
use super::openai_compat::DEFAULT_POOL_SIZE;
use super::types::{ChatRequest, ChatResponse, ProviderKind};
use super::wire::{post_chat, Endpoint};
use super::ChatProvider;

#[derive(Debug, Clone)]
pub struct DatabricksAdapter {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
}

impl DatabricksAdapter {
    pub fn with_config(
        url: impl Into<String>,
        token: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ProviderError::config("DATABRICKS_URL is empty"));
        }
        if token.trim().is_empty() {
            return Err(ProviderError::config("DATABRICKS_TOKEN is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ProviderError::config("invalid Databricks token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .pool_max_idle_per_host(DEFAULT_POOL_SIZE)
            .build()
            .map_err(|e| ProviderError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            model: model.into(),
            timeout,
        })
    }
}

#[async_trait]
impl ChatProvider for DatabricksAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Databricks
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        post_chat(
            &self.client,
            Endpoint {
                provider: ProviderKind::Databricks,
                url: &self.url,
                model: &self.model,
                send_model: false,
                default_timeout: self.timeout,
            },
            req,
        )
        .await
    }
}
