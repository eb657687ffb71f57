// ABOUTME: Context manager owning session message state and token accounting
// ABOUTME: Assembles provider prompts and applies the summarisation policy
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Context Manager
//!
//! Owns what the adapter sees and what the session owes: prompt assembly
//! from persisted messages, token accounting on every append, and
//! summarisation once the running total crosses the configured threshold.
//!
//! Summarisation runs at most once at a time per session (a session-scoped
//! async lock). Turns that arrive while a summary is being computed read the
//! pre-summary message set; the resulting token-count skew is bounded by one
//! turn and resolves when the summariser commits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::database::{MessageManager, SessionManager};
use crate::errors::{AppError, AppResult};
use crate::llm::{CompletionRequest, PromptMessage, ProviderRegistry, TokenUsage};
use crate::models::{
    estimate_tokens, Message, MessageError, MessageMetadata, MessageRole, MessageStatus, Session,
};
use crate::utils::SharedClock;

/// Fixed system prompt for the summarisation provider
const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation summariser. Produce a concise \
     third-person summary of the conversation below, preserving facts, decisions, names, and \
     open questions. Respond with the summary only.";

/// Prompt sent to the adapter, assembled from persisted session state
#[derive(Debug, Clone)]
pub struct LoadedContext {
    /// Messages in chronological order, summaries folded in as system text
    pub messages: Vec<PromptMessage>,
    /// Session system prompt
    pub system_prompt: Option<String>,
    /// Session token total at load time
    pub total_tokens: u64,
    /// Session message count at load time
    pub message_count: u64,
}

/// Result of a committed summarisation
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummariseOutcome {
    /// How many messages were replaced
    pub messages_summarised: u64,
    /// Net token reduction (removed minus summary)
    pub tokens_saved: i64,
    /// Token count of the summary message
    pub summary_tokens: u64,
}

/// Context statistics for a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    /// Session token total
    pub total_tokens: u64,
    /// Live message count
    pub message_count: u64,
    /// User messages
    pub user_messages: u64,
    /// Assistant messages
    pub assistant_messages: u64,
    /// Whether the total exceeds the summarisation threshold
    pub needs_summarisation: bool,
    /// When summarisation last committed
    pub last_summarised_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Session state owner: prompt assembly, appends, summarisation, clearing
#[derive(Clone)]
pub struct ContextManager {
    sessions: SessionManager,
    messages: MessageManager,
    registry: Arc<ProviderRegistry>,
    config: ChatConfig,
    clock: SharedClock,
    summary_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl ContextManager {
    /// Create a context manager over the shared storage managers
    #[must_use]
    pub fn new(
        sessions: SessionManager,
        messages: MessageManager,
        registry: Arc<ProviderRegistry>,
        config: ChatConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            sessions,
            messages,
            registry,
            config,
            clock,
            summary_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ========================================================================
    // Prompt Assembly
    // ========================================================================

    /// Load the prompt context for a session.
    ///
    /// Only completed messages contribute; summaries are folded in as system
    /// text so every adapter sees them regardless of native role support.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist or storage fails.
    pub async fn load(&self, session_id: Uuid) -> AppResult<LoadedContext> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))?;

        if session.context.total_tokens > self.config.max_context_tokens {
            debug!(
                session_id = %session_id,
                total_tokens = session.context.total_tokens,
                ceiling = self.config.max_context_tokens,
                "Context exceeds the informational token ceiling"
            );
        }

        let records = self.messages.list_for_session(session_id, None).await?;
        let mut prompt = Vec::with_capacity(records.len());
        for message in &records {
            if message.status != MessageStatus::Completed {
                continue;
            }
            let entry = match message.role {
                MessageRole::User => PromptMessage::user(&message.content),
                MessageRole::Assistant => PromptMessage::assistant(&message.content),
                MessageRole::System => PromptMessage::system(&message.content),
                MessageRole::Summary => PromptMessage::system(format!(
                    "Summary of the earlier conversation: {}",
                    message.content
                )),
            };
            prompt.push(entry);
        }

        Ok(LoadedContext {
            messages: prompt,
            system_prompt: session.system_prompt,
            total_tokens: session.context.total_tokens,
            message_count: session.context.message_count,
        })
    }

    // ========================================================================
    // Appends
    // ========================================================================

    /// Append a completed message to a session.
    ///
    /// Assigns the server-side timestamp, takes the provider token count
    /// when present (estimating otherwise), and atomically bumps the session
    /// counters. Crossing the summarisation threshold schedules a background
    /// summarisation whose failure never reaches the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn append(
        &self,
        session: &Session,
        role: MessageRole,
        content: &str,
        mut metadata: MessageMetadata,
    ) -> AppResult<Message> {
        if metadata.token_count == 0 {
            metadata.token_count = estimate_tokens(content);
        }
        let token_count = metadata.token_count;

        let message = Message {
            id: Uuid::new_v4(),
            session_id: session.session_id,
            user_id: session.user_id,
            role,
            content: content.to_owned(),
            metadata,
            status: MessageStatus::Completed,
            error: None,
            created_at: self.clock.now(),
        };

        self.messages.insert(&message).await?;
        self.sessions
            .add_context_usage(
                session.session_id,
                i64::from(token_count),
                1,
                self.clock.now(),
            )
            .await?;

        self.maybe_schedule_summarise(session.session_id).await;
        Ok(message)
    }

    /// Create the pending assistant message for a streaming turn
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn begin_assistant(
        &self,
        session: &Session,
        provider: &str,
        model: &str,
        correlation_id: &str,
    ) -> AppResult<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            session_id: session.session_id,
            user_id: session.user_id,
            role: MessageRole::Assistant,
            content: String::new(),
            metadata: MessageMetadata {
                provider: Some(provider.to_owned()),
                model: Some(model.to_owned()),
                token_count: 0,
                usage: None,
                response_time_ms: None,
                correlation_id: Some(correlation_id.to_owned()),
                is_streaming: true,
                streaming_complete: false,
            },
            status: MessageStatus::Streaming,
            error: None,
            created_at: self.clock.now(),
        };

        self.messages.insert(&message).await?;
        self.sessions
            .add_context_usage(session.session_id, 0, 1, self.clock.now())
            .await?;

        Ok(message)
    }

    /// Finalise a streaming assistant message (compare-and-set on status).
    ///
    /// Returns `false` when the message had already been finalised; replayed
    /// terminal transitions change nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_assistant(
        &self,
        session_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
        content: &str,
        usage: Option<TokenUsage>,
        response_time_ms: u64,
        error: Option<MessageError>,
    ) -> AppResult<bool> {
        let token_count = usage.map_or_else(
            || estimate_tokens(content),
            |u| {
                if u.completion_tokens > 0 {
                    u.completion_tokens
                } else {
                    estimate_tokens(content)
                }
            },
        );

        let applied = self
            .messages
            .finalize_streaming(
                message_id,
                status,
                content,
                token_count,
                usage,
                response_time_ms,
                error.as_ref(),
            )
            .await?;

        if applied {
            self.sessions
                .add_context_usage(session_id, i64::from(token_count), 0, self.clock.now())
                .await?;
            self.maybe_schedule_summarise(session_id).await;
        } else {
            debug!(
                message_id = %message_id,
                "Replayed terminal transition ignored"
            );
        }

        Ok(applied)
    }

    // ========================================================================
    // Summarisation
    // ========================================================================

    async fn maybe_schedule_summarise(&self, session_id: Uuid) {
        let over_threshold = match self.sessions.get(session_id).await {
            Ok(Some(session)) => {
                session.context.total_tokens > self.config.summarisation_threshold
            }
            Ok(None) => false,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Threshold check failed");
                false
            }
        };

        if over_threshold {
            let manager = self.clone();
            tokio::spawn(async move {
                if manager.summarise(session_id).await.is_none() {
                    debug!(session_id = %session_id, "Scheduled summarisation did not commit");
                }
            });
        }
    }

    /// Summarise the session's older messages into a single summary message.
    ///
    /// Candidates are completed user/assistant messages older than the
    /// recency window; at least two are required. Returns `None` when there
    /// is nothing to do or on any internal error.
    pub async fn summarise(&self, session_id: Uuid) -> Option<SummariseOutcome> {
        let lock = {
            let mut locks = self.summary_locks.lock().await;
            locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        match self.summarise_locked(session_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Summarisation failed");
                None
            }
        }
    }

    async fn summarise_locked(&self, session_id: Uuid) -> AppResult<Option<SummariseOutcome>> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))?;

        let cutoff =
            self.clock.now() - Duration::minutes(self.config.summarisation_recent_window_minutes);
        let candidates = self
            .messages
            .summarisation_candidates(session_id, cutoff)
            .await?;

        if candidates.len() < 2 {
            return Ok(None);
        }

        let transcript = candidates
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let content_hash = format!("{:x}", md5::compute(transcript.as_bytes()));

        let summariser = self
            .registry
            .get(&self.config.summary_provider)
            .ok_or_else(|| {
                AppError::config(format!(
                    "Summary provider '{}' is not registered",
                    self.config.summary_provider
                ))
            })?;

        let request = CompletionRequest::new(vec![PromptMessage::user(transcript)])
            .with_system_prompt(SUMMARY_SYSTEM_PROMPT);
        let reply = summariser.generate_response(&request).await?;

        let summary_tokens = if reply.usage.completion_tokens > 0 {
            u64::from(reply.usage.completion_tokens)
        } else {
            u64::from(estimate_tokens(&reply.text))
        };
        let tokens_removed: u64 = candidates
            .iter()
            .map(|m| u64::from(m.metadata.token_count))
            .sum();
        let messages_removed = candidates.len() as u64;

        let summary = Message {
            id: Uuid::new_v4(),
            session_id,
            user_id: session.user_id,
            role: MessageRole::Summary,
            content: reply.text,
            metadata: MessageMetadata {
                provider: Some(summariser.name().to_owned()),
                model: Some(reply.model),
                token_count: u32::try_from(summary_tokens).unwrap_or(u32::MAX),
                usage: Some(reply.usage),
                response_time_ms: None,
                correlation_id: None,
                is_streaming: false,
                streaming_complete: false,
            },
            status: MessageStatus::Completed,
            error: None,
            created_at: self.clock.now(),
        };

        self.messages.insert(&summary).await?;
        let candidate_ids: Vec<Uuid> = candidates.iter().map(|m| m.id).collect();
        self.messages.delete_by_ids(&candidate_ids).await?;
        self.sessions
            .apply_summary(
                session_id,
                tokens_removed,
                summary_tokens,
                messages_removed,
                &content_hash,
                self.clock.now(),
            )
            .await?;

        let outcome = SummariseOutcome {
            messages_summarised: messages_removed,
            tokens_saved: i64::try_from(tokens_removed).unwrap_or(i64::MAX)
                - i64::try_from(summary_tokens).unwrap_or(0),
            summary_tokens,
        };
        info!(
            session_id = %session_id,
            messages = messages_removed,
            tokens_saved = outcome.tokens_saved,
            "Summarisation committed"
        );
        Ok(Some(outcome))
    }

    // ========================================================================
    // Clearing and Stats
    // ========================================================================

    /// Delete a session's messages, optionally retaining system messages,
    /// and zero the context counters.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn clear(&self, session_id: Uuid, keep_system: bool) -> AppResult<u64> {
        let deleted = self.messages.clear_session(session_id, keep_system).await?;
        let remaining = if keep_system {
            self.messages.role_counts(session_id).await?.system
        } else {
            0
        };
        self.sessions
            .reset_context(session_id, remaining, self.clock.now())
            .await?;
        Ok(deleted)
    }

    /// Context statistics for a session
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist or storage fails.
    pub async fn stats(&self, session_id: Uuid) -> AppResult<ContextStats> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))?;
        let counts = self.messages.role_counts(session_id).await?;

        Ok(ContextStats {
            total_tokens: session.context.total_tokens,
            message_count: session.context.message_count,
            user_messages: counts.user,
            assistant_messages: counts.assistant,
            needs_summarisation: session.context.total_tokens
                > self.config.summarisation_threshold,
            last_summarised_at: session.context.last_summarised_at,
        })
    }
}
