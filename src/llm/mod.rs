// ABOUTME: LLM provider abstraction layer for pluggable AI model integration
// ABOUTME: Defines the streaming contract every provider adapter must honour
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # LLM Provider Service Provider Interface
//!
//! The contract every provider adapter must implement to serve turns. The
//! streaming side is a typed push channel: adapters return a [`TokenStream`]
//! that yields zero or more non-empty [`StreamEvent::Token`] fragments whose
//! concatenation equals the final reply text, followed by exactly one
//! terminal [`StreamEvent::Done`] or [`StreamEvent::Error`].
//!
//! Adapters without native streaming simulate it by chunking the final text
//! into whitespace-delimited fragments with a small inter-chunk delay; the
//! terminal reply still carries the full text and usage.

mod mock;
mod openai_compatible;
mod registry;
pub mod sse_parser;

pub use mock::MockProvider;
pub use openai_compatible::{OpenAiCompatibleConfig, OpenAiCompatibleProvider};
pub use registry::ProviderRegistry;

use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::errors::{AppError, AppResult};

// ============================================================================
// Message Types
// ============================================================================

/// Role of a prompt message as seen by providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    /// System instruction
    System,
    /// User input
    User,
    /// Assistant response
    Assistant,
}

impl PromptRole {
    /// String representation for provider APIs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in the prompt sent to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Role of the message sender
    pub role: PromptRole,
    /// Content of the message
    pub content: String,
}

impl PromptMessage {
    /// Create a new prompt message
    #[must_use]
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(PromptRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(PromptRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(PromptRole::Assistant, content)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Generation options forwarded to the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Model identifier (provider-specific)
    pub model: Option<String>,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
}

/// A completion request: conversation messages plus options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation messages in chronological order
    pub messages: Vec<PromptMessage>,
    /// System prompt, prepended by the adapter in its native form
    pub system_prompt: Option<String>,
    /// Generation options
    pub options: CompletionOptions,
}

impl CompletionRequest {
    /// Create a request with messages and default options
    #[must_use]
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            system_prompt: None,
            options: CompletionOptions::default(),
        }
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the generation options
    #[must_use]
    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Construct usage from prompt and completion counts
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Final result of a completion: the closed adapter return type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    /// Full response text (equals the concatenation of streamed tokens)
    pub text: String,
    /// Token usage for the call
    pub usage: TokenUsage,
    /// Provider-assigned completion id
    pub id: String,
    /// Model that produced the completion
    pub model: String,
}

/// One item of a provider token stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A non-empty text fragment, in generation order
    Token(String),
    /// Terminal: the completed reply
    Done(ProviderReply),
    /// Terminal: the stream failed
    Error(AppError),
}

/// Stream type returned by `stream_response`
pub type TokenStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Result of a provider connectivity probe
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Whether the provider answered
    pub success: bool,
    /// Provider name
    pub name: &'static str,
    /// Failure detail when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Provider adapter contract
///
/// Implement this trait to add a new AI provider. Adapters translate their
/// native response objects into [`ProviderReply`]; no ad-hoc fields leak out.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Unique provider identifier (e.g., "mock", "openai-compatible")
    fn name(&self) -> &'static str;

    /// Human-readable display name
    fn display_name(&self) -> &'static str;

    /// Default model used when the request does not name one
    fn default_model(&self) -> &str;

    /// Perform a streaming completion
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started; failures after
    /// the stream begins surface as a terminal [`StreamEvent::Error`].
    async fn stream_response(&self, request: &CompletionRequest) -> AppResult<TokenStream>;

    /// Perform a non-streaming completion
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    async fn generate_response(&self, request: &CompletionRequest) -> AppResult<ProviderReply>;

    /// Probe provider connectivity; must answer quickly (< 1 s)
    async fn test_connection(&self) -> ConnectionStatus;
}
