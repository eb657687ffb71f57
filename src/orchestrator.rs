// ABOUTME: Turn orchestrator: admission, context, provider streaming, persistence
// ABOUTME: The only component that knows how a user turn becomes an assistant message
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Turn Orchestrator
//!
//! State machine of a single turn:
//!
//! ```text
//! ADMIT -> LOAD_CTX -> SELECT_PROVIDER -> STREAM -> FINALIZE -> COMPLETE
//!    \-> reject                              \-> FALLBACK_SAFE -^
//! ```
//!
//! Admission runs before any transport commits to a stream so rejects map to
//! plain HTTP errors. Once streaming starts, no failure escapes to the
//! transport before the assistant message is finalised and a terminal event
//! emitted. A per-session mutex serialises turns; terminal persistence is a
//! compare-and-set, so replayed completion paths are no-ops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ChatConfig, RateLimitConfig};
use crate::context::ContextManager;
use crate::database::{MessageManager, SessionManager, UserManager};
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::llm::{
    CompletionOptions, CompletionRequest, ProviderRegistry, StreamEvent, TokenUsage,
};
use crate::models::{
    estimate_tokens, Message, MessageError, MessageMetadata, MessageRole, MessageStatus, Principal,
    Session, User,
};
use crate::rate_limiting::{RateLimitDecision, RateLimiter};
use crate::safety::{MessageInput, SafetyGate};
use crate::utils::SharedClock;

/// Token-budget window for the post-hoc per-user charge (24 h)
const TOKEN_BUDGET_WINDOW_MS: u64 = 24 * 60 * 60 * 1_000;

/// Per-subscription event buffer capacity before drop-oldest kicks in
const EVENT_BUFFER_CAPACITY: usize = 1_024;

/// Session title is derived from this many leading characters
const TITLE_CHARS: usize = 50;

// ============================================================================
// Wire Events and Sinks
// ============================================================================

/// Event relayed to the transport during a turn
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TurnEvent {
    /// One token fragment, in adapter order
    Token {
        /// Fragment text
        content: String,
        /// Assistant message id
        message_id: Uuid,
    },
    /// Terminal: the turn completed
    Done {
        /// Assistant message id
        message_id: Uuid,
        /// Usage for the turn
        usage: TokenUsage,
        /// Milliseconds from admission to terminal
        response_time: u64,
        /// Set when the content is a canned fallback
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback: Option<bool>,
    },
    /// Terminal: the turn failed before or during streaming
    Error {
        /// Sanitized message
        message: String,
        /// Whether the client may re-send
        retryable: bool,
        /// Assistant message id when one was created
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
    },
}

impl TurnEvent {
    /// Whether this event ends the subscription
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Transport-side receiver of turn events.
///
/// `send` returns `false` once the client is gone; the orchestrator then
/// stops relaying but keeps draining the adapter so persistence completes.
#[async_trait]
pub trait TokenSink: Send + Sync {
    /// Deliver one event; `false` means the subscriber disconnected
    async fn send(&self, event: TurnEvent) -> bool;
}

/// Bounded per-subscription buffer between the orchestrator and a transport.
///
/// Holds at most [`EVENT_BUFFER_CAPACITY`] frames; when full the oldest
/// frame is dropped and a congestion metric emitted, so a slow reader can
/// never stall the adapter drain.
#[derive(Clone)]
pub struct EventBuffer {
    inner: Arc<EventBufferInner>,
}

struct EventBufferInner {
    queue: StdMutex<VecDeque<TurnEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBufferInner {
                queue: StdMutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Mark the reader side gone; subsequent sends report disconnection
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Pop the next event, waiting until one arrives or the writer is done.
    ///
    /// Returns `None` after `close()` once the queue is drained.
    pub async fn next(&self) -> Option<TurnEvent> {
        loop {
            if let Some(event) = self
                .inner
                .queue
                .lock()
                .ok()
                .and_then(|mut queue| queue.pop_front())
            {
                return Some(event);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }
}

#[async_trait]
impl TokenSink for EventBuffer {
    async fn send(&self, event: TurnEvent) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut queue) = self.inner.queue.lock() {
            if queue.len() >= EVENT_BUFFER_CAPACITY {
                queue.pop_front();
                warn!(metric = "transport_congestion", "Subscription buffer full; dropped oldest frame");
            }
            queue.push_back(event);
        }
        self.inner.notify.notify_one();
        true
    }
}

/// Cooperative cancellation for a turn (explicit `cancel` frames)
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Create an un-cancelled handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.inner.notify.notified().await;
        }
    }
}

// ============================================================================
// Turn Types
// ============================================================================

/// One inbound turn, pre-admission
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Authenticated caller
    pub principal: Principal,
    /// Target session
    pub session_id: Uuid,
    /// User message content
    pub content: String,
    /// Provider override for this turn only
    pub provider_override: Option<String>,
    /// Correlation id propagated through logs and persistence
    pub correlation_id: String,
}

/// A turn that passed admission and may stream
#[derive(Debug)]
pub struct AdmittedTurn {
    session: Session,
    user: User,
    content: String,
    provider_name: String,
    correlation_id: String,
    /// Rate-limit decision taken at admission (drives response headers)
    pub rate: RateLimitDecision,
}

impl AdmittedTurn {
    /// Session the turn runs against
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }
}

/// Receipt for a turn that reached a terminal state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReceipt {
    /// The persisted user message
    pub user_message: Message,
    /// The finalised assistant message
    pub assistant_message: Message,
    /// Usage for the turn
    pub usage: TokenUsage,
    /// Milliseconds from admission to terminal
    pub response_time_ms: u64,
    /// Whether the assistant content is a canned fallback
    pub fallback: bool,
}

/// Outcome of a streamed turn
pub enum TurnOutcome {
    /// Provider stream completed normally
    Completed(TurnReceipt),
    /// Provider failed; canned fallback was substituted and persisted
    Fallback(TurnReceipt),
    /// Client cancelled mid-stream; partial content persisted as cancelled
    Cancelled(TurnReceipt),
    /// The turn could not reach a terminal assistant message
    Failed(AppError),
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Central coordinator of turn admission, streaming, and persistence
pub struct TurnOrchestrator {
    users: UserManager,
    sessions: SessionManager,
    messages: MessageManager,
    context: ContextManager,
    registry: Arc<ProviderRegistry>,
    safety: Arc<SafetyGate>,
    rate_limiter: Arc<RateLimiter>,
    chat_config: ChatConfig,
    rate_config: RateLimitConfig,
    clock: SharedClock,
    session_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    in_flight: AtomicUsize,
}

impl TurnOrchestrator {
    /// Wire up the orchestrator from the shared components
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        users: UserManager,
        sessions: SessionManager,
        messages: MessageManager,
        context: ContextManager,
        registry: Arc<ProviderRegistry>,
        safety: Arc<SafetyGate>,
        rate_limiter: Arc<RateLimiter>,
        chat_config: ChatConfig,
        rate_config: RateLimitConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            users,
            sessions,
            messages,
            context,
            registry,
            safety,
            rate_limiter,
            chat_config,
            rate_config,
            clock,
            session_locks: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of turns currently between admission and terminal event
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    // ========================================================================
    // ADMIT
    // ========================================================================

    /// Admit or reject a turn. Nothing is persisted on rejection.
    ///
    /// Reject order: validation, then quota, then rate, then safety screen.
    ///
    /// # Errors
    ///
    /// Returns the admission error mapped per the error taxonomy.
    pub async fn admit(&self, request: TurnRequest) -> AppResult<AdmittedTurn> {
        let session_id_text = request.session_id.to_string();
        self.safety
            .validate_message(&MessageInput {
                content: &request.content,
                role: "user",
                session_id: &session_id_text,
            })
            .map_err(|e| e.with_correlation_id(&request.correlation_id))?;

        let session = self
            .sessions
            .get_for_user(request.session_id, request.principal.user_id)
            .await?
            .filter(|session| session.is_active)
            .ok_or_else(|| {
                AppError::not_found("Session").with_correlation_id(&request.correlation_id)
            })?;

        let user = self
            .users
            .get(request.principal.user_id)
            .await?
            .ok_or_else(|| AppError::not_found("User"))?;

        if user.has_exceeded_quotas(self.clock.now()) {
            warn!(
                correlation_id = %request.correlation_id,
                user_id = %user.id,
                "Turn rejected: daily quota exceeded"
            );
            return Err(
                AppError::quota_exceeded().with_correlation_id(&request.correlation_id)
            );
        }

        let rate = self
            .rate_limiter
            .check_request(
                &format!("chat:{}", user.id),
                self.rate_config.chat_window_ms,
                self.rate_config.chat_max_requests,
            )
            .await;
        if !rate.allowed {
            let retry_after = rate.retry_after_secs(self.clock.now_epoch_ms());
            warn!(
                correlation_id = %request.correlation_id,
                user_id = %user.id,
                retry_after,
                "Turn rejected: rate limit exceeded"
            );
            return Err(
                AppError::rate_limited(retry_after).with_correlation_id(&request.correlation_id)
            );
        }

        let screen = self.safety.screen_inbound(&request.content);
        if self.safety.blocks_admission(&screen) {
            warn!(
                correlation_id = %request.correlation_id,
                user_id = %user.id,
                flags = ?screen.flags,
                confidence = screen.confidence,
                "Turn rejected: inbound content flagged"
            );
            return Err(AppError::content_flagged(&screen.flags)
                .with_correlation_id(&request.correlation_id));
        }

        let provider_name = request
            .provider_override
            .unwrap_or_else(|| session.provider.clone());

        Ok(AdmittedTurn {
            session,
            user,
            content: request.content,
            provider_name,
            correlation_id: request.correlation_id,
            rate,
        })
    }

    // ========================================================================
    // STREAM
    // ========================================================================

    /// Drive an admitted turn to its terminal event.
    ///
    /// Relays every adapter token to `sink` in order. A disconnected sink
    /// stops relaying but never aborts the drain; an explicit cancel via
    /// `cancel` finalises the assistant message as cancelled. Exactly one
    /// terminal event is sent in every path.
    pub async fn stream_turn(
        &self,
        admitted: AdmittedTurn,
        sink: &dyn TokenSink,
        cancel: Option<CancelHandle>,
    ) -> TurnOutcome {
        // One in-flight turn per session
        let lock = {
            let mut locks = self.session_locks.lock().await;
            locks
                .entry(admitted.session.session_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _session_guard = lock.lock().await;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = self.stream_turn_locked(admitted, sink, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn stream_turn_locked(
        &self,
        admitted: AdmittedTurn,
        sink: &dyn TokenSink,
        cancel: Option<CancelHandle>,
    ) -> TurnOutcome {
        let started = Instant::now();
        let AdmittedTurn {
            session,
            user,
            content,
            provider_name,
            correlation_id,
            ..
        } = admitted;

        // LOAD_CTX: persist the user turn, derive the title on first message
        let first_user_turn = match self.messages.has_user_message(session.session_id).await {
            Ok(has) => !has,
            Err(_) => false,
        };

        let user_message = match self
            .context
            .append(
                &session,
                MessageRole::User,
                &content,
                MessageMetadata {
                    correlation_id: Some(correlation_id.clone()),
                    ..MessageMetadata::default()
                },
            )
            .await
        {
            Ok(message) => message,
            Err(e) => {
                let e = e.with_correlation_id(&correlation_id);
                error!(
                    correlation_id = %correlation_id,
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to persist user turn"
                );
                sink.send(TurnEvent::Error {
                    message: e.sanitized_message(),
                    retryable: e.code.retryable(),
                    message_id: None,
                })
                .await;
                return TurnOutcome::Failed(e);
            }
        };

        if first_user_turn {
            let title: String = content.chars().take(TITLE_CHARS).collect();
            if let Err(e) = self
                .sessions
                .set_title_if_default(session.session_id, title.trim())
                .await
            {
                warn!(session_id = %session.session_id, error = %e, "Title derivation failed");
            }
        }

        // SELECT_PROVIDER: no probing; lookup failure falls through to the
        // safe fallback with the assistant message already created.
        let adapter = self.registry.get(&provider_name);
        let model = session
            .model
            .clone()
            .or_else(|| adapter.as_ref().map(|a| a.default_model().to_owned()))
            .unwrap_or_default();

        let assistant_shell = match self
            .context
            .begin_assistant(&session, &provider_name, &model, &correlation_id)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                let e = e.with_correlation_id(&correlation_id);
                sink.send(TurnEvent::Error {
                    message: e.sanitized_message(),
                    retryable: e.code.retryable(),
                    message_id: None,
                })
                .await;
                return TurnOutcome::Failed(e);
            }
        };
        let message_id = assistant_shell.id;

        let stream_result = match adapter {
            Some(adapter) => {
                let request = match self.build_request(&session, &model).await {
                    Ok(request) => request,
                    Err(e) => {
                        return self
                            .fallback_safe(
                                &session,
                                &user,
                                user_message,
                                message_id,
                                &e,
                                sink,
                                started,
                                &correlation_id,
                            )
                            .await;
                    }
                };
                adapter.stream_response(&request).await
            }
            None => Err(AppError::new(
                ErrorCode::ProviderError,
                format!("Provider '{provider_name}' is not registered"),
            )),
        };

        let mut stream = match stream_result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    correlation_id = %correlation_id,
                    provider = %provider_name,
                    error = %e,
                    "Provider stream failed to start"
                );
                return self
                    .fallback_safe(
                        &session,
                        &user,
                        user_message,
                        message_id,
                        &e,
                        sink,
                        started,
                        &correlation_id,
                    )
                    .await;
            }
        };

        // Drain the adapter stream under the hard turn deadline
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.chat_config.turn_timeout_secs);
        let cancel = cancel.unwrap_or_default();
        let mut buffer = String::new();
        let mut connected = true;
        let mut terminal: Option<Result<crate::llm::ProviderReply, AppError>> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                () = tokio::time::sleep_until(deadline) => {
                    terminal = Some(Err(AppError::new(
                        ErrorCode::ProviderError,
                        format!(
                            "Provider did not finish within {}s",
                            self.chat_config.turn_timeout_secs
                        ),
                    )));
                    break;
                }
                event = stream.next() => match event {
                    Some(StreamEvent::Token(token)) => {
                        buffer.push_str(&token);
                        if connected {
                            // Tokens after disconnect are discarded; the
                            // drain continues so persistence completes.
                            connected = sink
                                .send(TurnEvent::Token {
                                    content: token,
                                    message_id,
                                })
                                .await;
                            if !connected {
                                info!(
                                    correlation_id = %correlation_id,
                                    session_id = %session.session_id,
                                    "Client disconnected mid-stream; continuing drain"
                                );
                            }
                        }
                    }
                    Some(StreamEvent::Done(reply)) => {
                        terminal = Some(Ok(reply));
                        break;
                    }
                    Some(StreamEvent::Error(e)) => {
                        terminal = Some(Err(e));
                        break;
                    }
                    None => {
                        terminal = Some(Err(AppError::provider(
                            "Provider stream ended without a terminal event",
                        )));
                        break;
                    }
                }
            }
        }

        if cancelled {
            return self
                .finalize_cancelled(
                    &session,
                    &user,
                    user_message,
                    message_id,
                    &buffer,
                    sink,
                    started,
                    &correlation_id,
                )
                .await;
        }

        match terminal {
            Some(Ok(reply)) => {
                self.finalize_completed(
                    &session,
                    &user,
                    user_message,
                    message_id,
                    &buffer,
                    reply,
                    connected,
                    sink,
                    started,
                    &correlation_id,
                )
                .await
            }
            other => {
                let cause = match other {
                    Some(Err(e)) => e,
                    _ => AppError::provider("Provider stream ended without a terminal event"),
                };
                warn!(
                    correlation_id = %correlation_id,
                    session_id = %session.session_id,
                    provider = %provider_name,
                    error = %cause,
                    "Provider stream failed; substituting safe fallback"
                );
                self.fallback_safe(
                    &session,
                    &user,
                    user_message,
                    message_id,
                    &cause,
                    sink,
                    started,
                    &correlation_id,
                )
                .await
            }
        }
    }

    async fn build_request(
        &self,
        session: &Session,
        model: &str,
    ) -> AppResult<CompletionRequest> {
        let context = self.context.load(session.session_id).await?;
        let mut request = CompletionRequest::new(context.messages).with_options(CompletionOptions {
            model: if model.is_empty() {
                None
            } else {
                Some(model.to_owned())
            },
            temperature: session.settings.temperature,
            max_tokens: session.settings.max_tokens,
        });
        if let Some(prompt) = context.system_prompt {
            request = request.with_system_prompt(prompt);
        }
        Ok(request)
    }

    // ========================================================================
    // FINALIZE / FALLBACK_SAFE
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn finalize_completed(
        &self,
        session: &Session,
        user: &User,
        user_message: Message,
        message_id: Uuid,
        buffer: &str,
        reply: crate::llm::ProviderReply,
        connected: bool,
        sink: &dyn TokenSink,
        started: Instant,
        correlation_id: &str,
    ) -> TurnOutcome {
        // The streamed fragments are authoritative: persisted content must
        // equal the concatenation delivered to the transport.
        if buffer != reply.text {
            warn!(
                correlation_id = %correlation_id,
                message_id = %message_id,
                "Adapter reply text differs from streamed fragments"
            );
        }
        let content = buffer;

        let outbound = self.safety.screen_outbound(&content);
        if outbound.flagged {
            warn!(
                correlation_id = %correlation_id,
                session_id = %session.session_id,
                flags = ?outbound.flags,
                "Outbound screen flagged provider text"
            );
        }

        let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let usage = reply.usage;

        match self
            .context
            .finalize_assistant(
                session.session_id,
                message_id,
                MessageStatus::Completed,
                &content,
                Some(usage),
                response_time_ms,
                None,
            )
            .await
        {
            Ok(true) => {
                self.record_user_usage(user, usage, correlation_id).await;
            }
            Ok(false) => {
                info!(
                    correlation_id = %correlation_id,
                    message_id = %message_id,
                    "Terminal transition already applied; skipping counters"
                );
            }
            Err(e) => {
                let e = e.with_correlation_id(correlation_id);
                error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to finalise assistant message"
                );
                sink.send(TurnEvent::Error {
                    message: e.sanitized_message(),
                    retryable: true,
                    message_id: Some(message_id),
                })
                .await;
                return TurnOutcome::Failed(e);
            }
        }

        if connected {
            sink.send(TurnEvent::Done {
                message_id,
                usage,
                response_time: response_time_ms,
                fallback: None,
            })
            .await;
        }

        info!(
            correlation_id = %correlation_id,
            session_id = %session.session_id,
            user_id = %user.id,
            provider = %session.provider,
            response_time_ms,
            total_tokens = usage.total_tokens,
            "Turn completed"
        );

        let assistant_message = self.reload_assistant(message_id).await;
        TurnOutcome::Completed(TurnReceipt {
            user_message,
            assistant_message,
            usage,
            response_time_ms,
            fallback: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fallback_safe(
        &self,
        session: &Session,
        user: &User,
        user_message: Message,
        message_id: Uuid,
        cause: &AppError,
        sink: &dyn TokenSink,
        started: Instant,
        correlation_id: &str,
    ) -> TurnOutcome {
        let safe = self.safety.safe_response(cause);
        let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let usage = TokenUsage::new(0, estimate_tokens(&safe.message));
        let captured = MessageError {
            message: cause.sanitized_message(),
            code: format!("{:?}", cause.code),
            retryable: safe.retryable,
        };

        let finalized = self
            .context
            .finalize_assistant(
                session.session_id,
                message_id,
                MessageStatus::Completed,
                &safe.message,
                Some(usage),
                response_time_ms,
                Some(captured),
            )
            .await;

        match finalized {
            Ok(true) => self.record_user_usage(user, usage, correlation_id).await,
            Ok(false) => {}
            Err(e) => {
                let e = e.with_correlation_id(correlation_id);
                error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to persist fallback assistant message"
                );
                sink.send(TurnEvent::Error {
                    message: e.sanitized_message(),
                    retryable: true,
                    message_id: Some(message_id),
                })
                .await;
                return TurnOutcome::Failed(e);
            }
        }

        // Canned text goes out as a single token, then a fallback-tagged done
        sink.send(TurnEvent::Token {
            content: safe.message.clone(),
            message_id,
        })
        .await;
        sink.send(TurnEvent::Done {
            message_id,
            usage,
            response_time: response_time_ms,
            fallback: Some(true),
        })
        .await;

        let assistant_message = self.reload_assistant(message_id).await;
        TurnOutcome::Fallback(TurnReceipt {
            user_message,
            assistant_message,
            usage,
            response_time_ms,
            fallback: true,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_cancelled(
        &self,
        session: &Session,
        user: &User,
        user_message: Message,
        message_id: Uuid,
        buffer: &str,
        sink: &dyn TokenSink,
        started: Instant,
        correlation_id: &str,
    ) -> TurnOutcome {
        let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let usage = TokenUsage::new(0, estimate_tokens(buffer));

        let finalized = self
            .context
            .finalize_assistant(
                session.session_id,
                message_id,
                MessageStatus::Cancelled,
                buffer,
                Some(usage),
                response_time_ms,
                None,
            )
            .await;
        if let Err(e) = finalized {
            error!(
                correlation_id = %correlation_id,
                error = %e,
                "Failed to persist cancelled assistant message"
            );
        }

        info!(
            correlation_id = %correlation_id,
            session_id = %session.session_id,
            user_id = %user.id,
            "Turn cancelled by client"
        );

        sink.send(TurnEvent::Error {
            message: "Turn cancelled".to_owned(),
            retryable: true,
            message_id: Some(message_id),
        })
        .await;

        let assistant_message = self.reload_assistant(message_id).await;
        TurnOutcome::Cancelled(TurnReceipt {
            user_message,
            assistant_message,
            usage,
            response_time_ms,
            fallback: false,
        })
    }

    /// Counter updates at the terminal transition: user usage plus the
    /// post-hoc token-budget charge (observability only, never blocking).
    async fn record_user_usage(&self, user: &User, usage: TokenUsage, correlation_id: &str) {
        if let Err(e) = self
            .users
            .record_completed_turn(user.id, u64::from(usage.total_tokens), self.clock.now())
            .await
        {
            error!(
                correlation_id = %correlation_id,
                user_id = %user.id,
                error = %e,
                "Failed to update user usage counters"
            );
        }

        let budget = self
            .rate_limiter
            .check_tokens(
                &format!("tokens:{}", user.id),
                TOKEN_BUDGET_WINDOW_MS,
                usage.total_tokens,
                self.rate_config.daily_token_budget,
            )
            .await;
        if !budget.allowed {
            warn!(
                metric = "token_budget_exhausted",
                user_id = %user.id,
                current = budget.current,
                "Post-hoc token budget exhausted for user"
            );
        }
    }

    async fn reload_assistant(&self, message_id: Uuid) -> Message {
        match self.messages.get(message_id).await {
            Ok(Some(message)) => message,
            _ => {
                // Terminal persistence already succeeded; losing the re-read
                // only degrades the receipt detail.
                warn!(message_id = %message_id, "Could not reload finalised assistant message");
                Message {
                    id: message_id,
                    session_id: Uuid::nil(),
                    user_id: Uuid::nil(),
                    role: MessageRole::Assistant,
                    content: String::new(),
                    metadata: MessageMetadata::default(),
                    status: MessageStatus::Completed,
                    error: None,
                    created_at: self.clock.now(),
                }
            }
        }
    }
}
