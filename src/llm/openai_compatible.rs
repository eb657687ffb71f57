// ABOUTME: Generic OpenAI-compatible provider adapter for local and cloud endpoints
// ABOUTME: Streams chat completions over SSE and translates them to the adapter contract
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # OpenAI-Compatible Provider
//!
//! One adapter covers every endpoint speaking the OpenAI chat-completions
//! wire format: Ollama, vLLM, LocalAI, and the hosted services. Streaming
//! responses arrive as SSE `data:` lines; the adapter buffers them through
//! [`super::sse_parser::SseLineBuffer`], accumulates the full text, and ends
//! the stream with a single terminal event carrying text and usage.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::sse_parser::{SseEvent, SseLineBuffer};
use super::{
    ChatProvider, CompletionRequest, ConnectionStatus, PromptMessage, ProviderReply, StreamEvent,
    TokenStream, TokenUsage,
};
use crate::errors::{AppError, AppResult};
use crate::models::estimate_tokens;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 300;
const PROBE_TIMEOUT_MS: u64 = 900;

/// Configuration for an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    /// Base URL, e.g. `http://localhost:11434/v1`
    pub base_url: String,
    /// Bearer key; `None` for local servers
    pub api_key: Option<String>,
    /// Model used when the request does not name one
    pub default_model: String,
}

/// Adapter for any OpenAI-compatible chat completions API
pub struct OpenAiCompatibleProvider {
    config: OpenAiCompatibleConfig,
    client: Client,
    probe_client: Client,
}

impl OpenAiCompatibleProvider {
    /// Create a provider from explicit configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: OpenAiCompatibleConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::config(format!("Failed to build HTTP client: {e}")))?;
        // Separate short-deadline client so connectivity probes stay under 1 s
        let probe_client = Client::builder()
            .connect_timeout(Duration::from_millis(PROBE_TIMEOUT_MS))
            .timeout(Duration::from_millis(PROBE_TIMEOUT_MS))
            .build()
            .map_err(|e| AppError::config(format!("Failed to build probe client: {e}")))?;

        Ok(Self {
            config,
            client,
            probe_client,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> WireRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = &request.system_prompt {
            messages.push(WireMessage {
                role: "system".to_owned(),
                content: prompt.clone(),
            });
        }
        messages.extend(request.messages.iter().map(WireMessage::from));

        WireRequest {
            model: request
                .options
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages,
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
            stream: stream.then_some(true),
            stream_options: stream.then(|| WireStreamOptions {
                include_usage: true,
            }),
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Estimate usage when the endpoint omitted the `usage` object
    fn fallback_usage(request: &CompletionRequest, text: &str) -> TokenUsage {
        let prompt: u32 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .chain(request.system_prompt.as_deref().map(estimate_tokens))
            .sum();
        TokenUsage::new(prompt, estimate_tokens(text))
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    fn display_name(&self) -> &'static str {
        "OpenAI-Compatible"
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    async fn stream_response(&self, request: &CompletionRequest) -> AppResult<TokenStream> {
        let body = self.build_body(request, true);
        let model = body.model.clone();
        debug!(model = %model, messages = body.messages.len(), "Starting streamed completion");

        let response = self
            .apply_auth(self.client.post(self.completions_url()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::provider(format!(
                "Completion request failed with {status}: {detail}"
            )));
        }

        let request_snapshot = request.clone();
        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut parser = SseLineBuffer::new();
            let mut full_text = String::new();
            let mut usage: Option<TokenUsage> = None;
            let mut completion_id = None;
            let mut finished = false;

            'outer: while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield StreamEvent::Error(AppError::provider(format!(
                            "Stream read error: {e}"
                        )));
                        return;
                    }
                };

                for event in parser.feed(&bytes) {
                    match event {
                        SseEvent::Data(json) => {
                            match serde_json::from_str::<WireStreamChunk>(&json) {
                                Ok(chunk) => {
                                    if completion_id.is_none() {
                                        completion_id = chunk.id;
                                    }
                                    if let Some(reported) = chunk.usage {
                                        usage = Some(reported.into());
                                    }
                                    if let Some(delta) = chunk
                                        .choices
                                        .into_iter()
                                        .next()
                                        .and_then(|c| c.delta.content)
                                    {
                                        if !delta.is_empty() {
                                            full_text.push_str(&delta);
                                            yield StreamEvent::Token(delta);
                                        }
                                    }
                                }
                                Err(e) => {
                                    yield StreamEvent::Error(AppError::provider(format!(
                                        "Malformed stream chunk: {e}"
                                    )));
                                    return;
                                }
                            }
                        }
                        SseEvent::Done => {
                            finished = true;
                            break 'outer;
                        }
                    }
                }
            }

            if !finished && full_text.is_empty() {
                yield StreamEvent::Error(AppError::provider(
                    "Stream ended before any content or [DONE] marker",
                ));
                return;
            }

            let usage =
                usage.unwrap_or_else(|| Self::fallback_usage(&request_snapshot, &full_text));
            yield StreamEvent::Done(ProviderReply {
                text: full_text,
                usage,
                id: completion_id
                    .unwrap_or_else(|| format!("oai-{}", Uuid::new_v4().simple())),
                model,
            });
        };

        Ok(Box::pin(stream))
    }

    async fn generate_response(&self, request: &CompletionRequest) -> AppResult<ProviderReply> {
        let body = self.build_body(request, false);
        let model = body.model.clone();

        let response = self
            .apply_auth(self.client.post(self.completions_url()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::provider(format!(
                "Completion request failed with {status}: {detail}"
            )));
        }

        let wire: WireResponse = response.json().await?;
        let text = wire
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = wire
            .usage
            .map_or_else(|| Self::fallback_usage(request, &text), Into::into);

        Ok(ProviderReply {
            text,
            usage,
            id: wire
                .id
                .unwrap_or_else(|| format!("oai-{}", Uuid::new_v4().simple())),
            model: wire.model.unwrap_or(model),
        })
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        match self
            .apply_auth(self.probe_client.get(url))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ConnectionStatus {
                success: true,
                name: self.name(),
                error: None,
            },
            Ok(response) => ConnectionStatus {
                success: false,
                name: self.name(),
                error: Some(format!("Endpoint answered {}", response.status())),
            },
            Err(e) => ConnectionStatus {
                success: false,
                name: self.name(),
                error: Some(e.to_string()),
            },
        }
    }
}

// ============================================================================
// Wire Types (OpenAI chat-completions format)
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<WireStreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&PromptMessage> for WireMessage {
    fn from(msg: &PromptMessage) -> Self {
        Self {
            role: msg.role.as_str().to_owned(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(wire: WireUsage) -> Self {
        Self {
            prompt_tokens: wire.prompt_tokens,
            completion_tokens: wire.completion_tokens,
            total_tokens: wire.total_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_request_includes_system_prompt_first() {
        let provider = OpenAiCompatibleProvider::new(OpenAiCompatibleConfig {
            base_url: "http://localhost:11434/v1".to_owned(),
            api_key: None,
            default_model: "test-model".to_owned(),
        })
        .unwrap();

        let request = CompletionRequest::new(vec![PromptMessage::user("hello")])
            .with_system_prompt("be brief");
        let body = provider.build_body(&request, true);

        assert_eq!(body.model, "test-model");
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[0].content, "be brief");
        assert_eq!(body.messages[1].role, "user");
        assert_eq!(body.stream, Some(true));
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let json = r#"{"id":"cmpl-1","choices":[{"delta":{"content":"Hi"},"index":0}]}"#;
        let chunk: WireStreamChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.id.as_deref(), Some("cmpl-1"));
        assert_eq!(
            chunk.choices[0].delta.content.as_deref(),
            Some("Hi")
        );
    }

    #[test]
    fn test_usage_conversion() {
        let wire = WireUsage {
            prompt_tokens: 10,
            completion_tokens: 4,
            total_tokens: 14,
        };
        let usage: TokenUsage = wire.into();
        assert_eq!(usage.total_tokens, 14);
    }
}
