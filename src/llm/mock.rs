// ABOUTME: Mock provider adapter that always succeeds with simulated streaming
// ABOUTME: Serves as last-resort fallback and the reference for contract testing
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Mock Provider
//!
//! Deterministic adapter with no external dependencies. It is registered in
//! every deployment as the last entry of the fallback order, and the test
//! suites use it as the reference implementation of the streaming contract:
//! token fragments concatenate to the final text, exactly one terminal event,
//! usage always populated.

use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use super::{
    ChatProvider, CompletionRequest, ConnectionStatus, ProviderReply, StreamEvent, TokenStream,
    TokenUsage,
};
use crate::errors::AppResult;
use crate::models::estimate_tokens;

const MOCK_MODEL: &str = "mock-1";

/// Always-available provider with simulated streaming
pub struct MockProvider {
    /// Fixed reply text; `None` derives a reply from the request
    canned_reply: Option<String>,
    /// Inter-chunk delay for simulated streaming
    chunk_delay: Duration,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a mock provider with the default reply and a 5 ms chunk delay
    #[must_use]
    pub fn new() -> Self {
        Self {
            canned_reply: None,
            chunk_delay: Duration::from_millis(5),
        }
    }

    /// Fix the reply text (tests use this to control token sequences)
    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.canned_reply = Some(reply.into());
        self
    }

    /// Override the simulated inter-chunk delay
    #[must_use]
    pub fn with_chunk_delay_ms(mut self, millis: u64) -> Self {
        self.chunk_delay = Duration::from_millis(millis);
        self
    }

    fn build_reply(&self, request: &CompletionRequest) -> ProviderReply {
        let text = self.canned_reply.clone().unwrap_or_else(|| {
            let last = request
                .messages
                .iter()
                .rev()
                .find(|m| matches!(m.role, super::PromptRole::User))
                .map_or("", |m| m.content.as_str());
            format!(
                "I understand you said: \"{}\". This response was generated \
                 by the built-in mock provider.",
                truncate(last, 80)
            )
        });

        let prompt_tokens: u32 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .chain(
                request
                    .system_prompt
                    .as_deref()
                    .map(estimate_tokens),
            )
            .sum();
        let completion_tokens = estimate_tokens(&text);

        ProviderReply {
            text,
            usage: TokenUsage::new(prompt_tokens, completion_tokens),
            id: format!("mock-{}", Uuid::new_v4().simple()),
            model: MOCK_MODEL.to_owned(),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn display_name(&self) -> &'static str {
        "Mock Provider"
    }

    fn default_model(&self) -> &str {
        MOCK_MODEL
    }

    async fn stream_response(&self, request: &CompletionRequest) -> AppResult<TokenStream> {
        let reply = self.build_reply(request);
        let delay = self.chunk_delay;

        // Whitespace-delimited fragments; split_inclusive keeps separators so
        // the concatenation equals the final text exactly.
        let fragments: Vec<String> = reply
            .text
            .split_inclusive(char::is_whitespace)
            .map(ToOwned::to_owned)
            .collect();

        let stream = async_stream::stream! {
            for fragment in fragments {
                if !fragment.is_empty() {
                    sleep(delay).await;
                    yield StreamEvent::Token(fragment);
                }
            }
            yield StreamEvent::Done(reply);
        };

        Ok(Box::pin(stream))
    }

    async fn generate_response(&self, request: &CompletionRequest) -> AppResult<ProviderReply> {
        Ok(self.build_reply(request))
    }

    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus {
            success: true,
            name: self.name(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PromptMessage;
    use tokio_stream::StreamExt;

    fn request(content: &str) -> CompletionRequest {
        CompletionRequest::new(vec![PromptMessage::user(content)])
    }

    #[tokio::test]
    async fn test_stream_concatenation_equals_reply_text() {
        let provider = MockProvider::new()
            .with_reply("alpha beta  gamma\ndelta")
            .with_chunk_delay_ms(0);
        let mut stream = provider.stream_response(&request("hi")).await.unwrap();

        let mut concatenated = String::new();
        let mut terminal = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Token(tok) => {
                    assert!(!tok.is_empty());
                    assert!(terminal.is_none(), "token after terminal event");
                    concatenated.push_str(&tok);
                }
                StreamEvent::Done(reply) => terminal = Some(reply),
                StreamEvent::Error(e) => panic!("mock stream errored: {e}"),
            }
        }

        let reply = terminal.expect("missing terminal event");
        assert_eq!(concatenated, reply.text);
        assert_eq!(reply.text, "alpha beta  gamma\ndelta");
    }

    #[tokio::test]
    async fn test_empty_reply_yields_no_tokens_but_done() {
        let provider = MockProvider::new().with_reply("").with_chunk_delay_ms(0);
        let mut stream = provider.stream_response(&request("hi")).await.unwrap();

        let mut tokens = 0;
        let mut done = false;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Token(_) => tokens += 1,
                StreamEvent::Done(reply) => {
                    done = true;
                    assert!(reply.text.is_empty());
                }
                StreamEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(tokens, 0);
        assert!(done);
    }

    #[tokio::test]
    async fn test_usage_accounts_prompt_and_completion() {
        let provider = MockProvider::new().with_reply("four char");
        let reply = provider
            .generate_response(&request("12345678"))
            .await
            .unwrap();
        assert_eq!(reply.usage.prompt_tokens, 2);
        assert_eq!(reply.usage.completion_tokens, estimate_tokens("four char"));
        assert_eq!(
            reply.usage.total_tokens,
            reply.usage.prompt_tokens + reply.usage.completion_tokens
        );
    }

    #[tokio::test]
    async fn test_connection_always_succeeds() {
        let status = MockProvider::new().test_connection().await;
        assert!(status.success);
        assert_eq!(status.name, "mock");
    }
}
