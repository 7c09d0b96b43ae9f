//! Wire format shared by OpenAI-shaped chat completion endpoints.
//!
//! Both adapters post the same request body and receive the same envelope;
//! they differ only in authentication and in how `message.content` is shaped.
//! [`ReplyContent`] absorbs that difference once per reply so nothing
//! downstream sees provider quirks.

use std::time::{Duration, Instant};

use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};

use super::error::{is_retryable_status, ErrorContext, ProviderError};
use super::types::{ChatRequest, ChatResponse, FinishReason, Message, ProviderKind, Role};

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters.
const MAX_INPUT_CHARS: usize = 500_000;

// =============================================================================
// REQUEST
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a Message> for ApiMessage<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: &m.content,
        }
    }
}

// =============================================================================
// RESPONSE
// =============================================================================

#[derive(Deserialize)]
struct ChatApiResponse {
    model: Option<String>,
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
    // Databricks reports errors at the top level.
    error_code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<ReplyContent>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    // vLLM sends numeric codes, OpenAI sends strings.
    code: Option<serde_json::Value>,
}

/// `message.content` as providers actually send it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReplyContent {
    /// Flat string (OpenAI-compatible servers).
    Text(String),
    /// List of typed segments (Databricks reasoning models).
    Segments(Vec<RawSegment>),
}

/// One element of a segmented reply, before classification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawSegment {
    Plain(String),
    Object {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        summary: Vec<RawSegment>,
    },
}

/// A classified reply segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Reasoning(Vec<String>),
    Ignored,
}

impl From<&RawSegment> for Segment {
    fn from(raw: &RawSegment) -> Self {
        match raw {
            RawSegment::Plain(s) => Segment::Text(s.clone()),
            RawSegment::Object {
                kind,
                text,
                summary,
            } => {
                if kind.as_deref() == Some("reasoning") {
                    let parts = summary
                        .iter()
                        .filter_map(|part| match Segment::from(part) {
                            Segment::Text(t) => Some(t),
                            Segment::Reasoning(inner) => Some(inner.join("\n")),
                            Segment::Ignored => None,
                        })
                        .collect();
                    Segment::Reasoning(parts)
                } else if let Some(text) = text {
                    Segment::Text(text.clone())
                } else {
                    Segment::Ignored
                }
            }
        }
    }
}

impl ReplyContent {
    /// Flatten into a single string, joining segments with newlines.
    ///
    /// Returns `None` for an empty segment list.
    pub fn flatten(&self) -> Option<String> {
        match self {
            ReplyContent::Text(s) => Some(s.clone()),
            ReplyContent::Segments(segments) if segments.is_empty() => None,
            ReplyContent::Segments(segments) => {
                let mut parts: Vec<String> = Vec::with_capacity(segments.len());
                for segment in segments.iter().map(Segment::from) {
                    match segment {
                        Segment::Text(t) => parts.push(t),
                        Segment::Reasoning(inner) => parts.extend(inner),
                        Segment::Ignored => {}
                    }
                }
                Some(parts.join("\n"))
            }
        }
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Endpoint description for one POST.
pub(crate) struct Endpoint<'a> {
    pub provider: ProviderKind,
    pub url: &'a str,
    pub model: &'a str,
    /// Whether the model id goes into the body (Databricks encodes it in the URL).
    pub send_model: bool,
    /// Client-level timeout, used to label timeouts when the request has none.
    pub default_timeout: Duration,
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn extract_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn map_send_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Http(err)
    }
}

/// POST one chat request and normalize the reply.
pub(crate) async fn post_chat(
    client: &reqwest::Client,
    endpoint: Endpoint<'_>,
    req: &ChatRequest,
) -> Result<ChatResponse, ProviderError> {
    let provider = endpoint.provider.as_str();
    let total_chars = req.input_chars();
    if total_chars > MAX_INPUT_CHARS {
        return Err(ProviderError::config(format!(
            "input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
        )));
    }

    let start = Instant::now();
    let timeout = req.timeout.unwrap_or(endpoint.default_timeout);

    let api_req = ChatApiRequest {
        model: endpoint.send_model.then_some(endpoint.model),
        messages: req.messages.iter().map(ApiMessage::from).collect(),
        temperature: req.temperature,
        max_tokens: req.max_tokens,
    };

    let mut builder = client.post(endpoint.url).json(&api_req);
    if let Some(t) = req.timeout {
        builder = builder.timeout(t);
    }

    let mut response = builder
        .send()
        .await
        .map_err(|e| map_send_error(e, timeout))?;

    let status = response.status();
    let request_id = extract_request_id(response.headers());
    let retry_after = extract_retry_after(response.headers());

    // Stream response to enforce size limit
    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| map_send_error(e, timeout))?
    {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::invalid_reply(
                provider,
                format!("response too large: {new_len} bytes"),
            ));
        }
        bytes.extend_from_slice(&chunk);
    }

    let body = String::from_utf8_lossy(&bytes).to_string();

    let ctx = ErrorContext::new().with_status(status.as_u16());
    let ctx = match &request_id {
        Some(id) => ctx.with_request_id(id),
        None => ctx,
    };

    if !status.is_success() {
        let code = status.as_u16();
        let mut ctx = ctx.with_body(&body);
        let mut message = body.trim().to_string();

        if let Ok(parsed) = serde_json::from_str::<ChatApiResponse>(&body) {
            if let Some(error) = parsed.error {
                if let Some(m) = error.message {
                    message = m;
                }
                if let Some(c) = error.code {
                    ctx = ctx.with_code(value_to_code(&c));
                }
            } else if let Some(m) = parsed.message {
                message = m;
                if let Some(c) = parsed.error_code {
                    ctx = ctx.with_code(c);
                }
            }
        }

        let message = if message.is_empty() {
            format!("HTTP {code}")
        } else {
            format!("HTTP {code}: {message}")
        };

        return Err(match code {
            429 => ProviderError::rate_limited(message, retry_after, ctx),
            _ => ProviderError::provider_with_context(
                provider,
                message,
                is_retryable_status(code),
                ctx,
            ),
        });
    }

    let parsed: ChatApiResponse = serde_json::from_str(&body)
        .map_err(|e| ProviderError::invalid_reply(provider, format!("invalid JSON: {e}")))?;

    if let Some(error) = parsed.error {
        return Err(ProviderError::invalid_reply(
            provider,
            error.message.unwrap_or_else(|| "error object in 2xx reply".into()),
        ));
    }

    let choice = parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| ProviderError::invalid_reply(provider, "no choices in response"))?;

    let content = choice
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| ProviderError::invalid_reply(provider, "missing message content"))?;

    let text = content
        .flatten()
        .ok_or_else(|| ProviderError::invalid_reply(provider, "empty segment list"))?;

    if text.trim().is_empty() {
        return Err(ProviderError::invalid_reply(provider, "empty reply content"));
    }

    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| {
            (
                u.prompt_tokens.unwrap_or(0),
                u.completion_tokens.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    Ok(ChatResponse {
        content: text,
        model: parsed.model.unwrap_or_else(|| endpoint.model.to_string()),
        input_tokens,
        output_tokens,
        latency: start.elapsed(),
        finish_reason: FinishReason::from(choice.finish_reason),
    })
}

fn value_to_code(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(v: serde_json::Value) -> ReplyContent {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn flat_string_passes_through() {
        let c = content(json!("label-1: Billing"));
        assert_eq!(c.flatten().as_deref(), Some("label-1: Billing"));
    }

    #[test]
    fn segments_concatenate_text_and_reasoning_summaries() {
        let c = content(json!([
            {"type": "reasoning", "summary": [
                {"type": "summary_text", "text": "thinking about billing"}
            ]},
            {"type": "text", "text": "label-1: Billing"},
            "reason: invoice question"
        ]));
        assert_eq!(
            c.flatten().as_deref(),
            Some("thinking about billing\nlabel-1: Billing\nreason: invoice question")
        );
    }

    #[test]
    fn segments_without_text_are_skipped() {
        let c = content(json!([
            {"type": "image", "url": "http://x"},
            {"type": "text", "text": "label-1: Claims"}
        ]));
        assert_eq!(c.flatten().as_deref(), Some("label-1: Claims"));
    }

    #[test]
    fn empty_segment_list_is_none() {
        assert_eq!(content(json!([])).flatten(), None);
    }
}
