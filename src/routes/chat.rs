// ABOUTME: Chat route handlers: session lifecycle and message turn endpoints
// ABOUTME: Binds the orchestrator to HTTP with SSE streaming and a simple JSON variant
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! Chat routes
//!
//! All handlers require bearer authentication. The streamed message endpoint
//! answers with `text/event-stream`; each event is one JSON frame
//! (`token` / `done` / `error`) and the response ends after the terminal
//! frame. The simple variant drives the same orchestrator with a buffering
//! sink and answers with one JSON body after the turn finishes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{Message, Principal, Session, SessionSettings};
use crate::orchestrator::{EventBuffer, TurnOutcome, TurnRequest};
use crate::rate_limiting::RateLimitDecision;
use crate::safety::SessionCreateInput;
use crate::server::ServerResources;
use crate::utils::to_storage_timestamp;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to create a session
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Provider for the session (defaults to user preference, then server default)
    pub provider: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// System prompt
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Max completion tokens
    pub max_tokens: Option<u32>,
}

/// Response for session creation
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// New session id
    pub session_id: Uuid,
    /// Resolved provider
    pub provider: String,
    /// Resolved model (provider default when unset)
    pub model: Option<String>,
    /// Generation settings
    pub settings: SessionSettings,
    /// System prompt
    pub system_prompt: Option<String>,
}

/// Request to send a message
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Target session id
    pub session_id: String,
    /// User message content
    pub message: String,
    /// Provider override for this turn
    pub provider: Option<String>,
}

/// Response of the simple (non-streaming) message endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleMessageResponse {
    /// Always true; errors use the error body
    pub success: bool,
    /// Persisted user message
    pub user_message: Message,
    /// Finalised assistant message
    pub assistant_message: Message,
}

/// Query parameters for session listing
#[derive(Debug, Deserialize, Default)]
pub struct ListSessionsQuery {
    /// Page size
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Page offset
    #[serde(default)]
    pub offset: i64,
}

const fn default_limit() -> i64 {
    20
}

/// Response for session listing
#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    /// Sessions, most recently active first
    pub sessions: Vec<Session>,
    /// Total sessions for the user
    pub total: u64,
}

/// Query parameters for message listing
#[derive(Debug, Deserialize, Default)]
pub struct ListMessagesQuery {
    /// Maximum messages to return
    pub limit: Option<i64>,
}

/// Response for message listing
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    /// Session id
    pub session_id: Uuid,
    /// Messages in chronological order
    pub messages: Vec<Message>,
    /// The session record
    pub session: Session,
}

/// Query parameters for export
#[derive(Debug, Deserialize, Default)]
pub struct ExportQuery {
    /// `json` (default) or `text`
    pub format: Option<String>,
}

// ============================================================================
// Chat Routes
// ============================================================================

/// Chat routes handler
pub struct ChatRoutes;

impl ChatRoutes {
    /// Create all chat routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/chat/session", post(Self::create_session))
            .route("/chat/message", post(Self::send_message_stream))
            .route("/chat/message/simple", post(Self::send_message_simple))
            .route("/chat/sessions", get(Self::list_sessions))
            .route("/chat/sessions/:session_id", delete(Self::deactivate_session))
            .route("/chat/sessions/:session_id/messages", get(Self::get_messages))
            .route(
                "/chat/sessions/:session_id/context",
                delete(Self::clear_context),
            )
            .route(
                "/chat/sessions/:session_id/summarize",
                post(Self::summarize),
            )
            .route("/chat/sessions/:session_id/export", get(Self::export))
            .route("/chat/sessions/:session_id/stats", get(Self::stats))
            .with_state(resources)
    }

    /// Extract and authenticate the principal from the authorization header
    fn authenticate(
        headers: &HeaderMap,
        resources: &ServerResources,
    ) -> AppResult<Principal> {
        let header_value = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        resources.auth.validate_bearer(header_value)
    }

    /// Correlation id: the request id assigned by the middleware, or fresh
    fn correlation_id(headers: &HeaderMap) -> String {
        headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map_or_else(
                || format!("req_{}", Uuid::new_v4().simple()),
                ToOwned::to_owned,
            )
    }

    /// Resolve an owned session or `not-found`
    async fn owned_session(
        resources: &ServerResources,
        session_id: &str,
        principal: Principal,
    ) -> AppResult<Session> {
        let session_id = Uuid::parse_str(session_id)
            .map_err(|_| AppError::invalid_input("Invalid sessionId: expected UUID"))?;
        resources
            .sessions
            .get_for_user(session_id, principal.user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a new session
    async fn create_session(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Json(request): Json<CreateSessionRequest>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;

        let known = resources.registry.known_names();
        resources.safety.validate_session_create(
            &SessionCreateInput {
                provider: request.provider.as_deref(),
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                system_prompt: request.system_prompt.as_deref(),
            },
            &known,
        )?;

        let user = resources
            .users
            .get(principal.user_id)
            .await?
            .ok_or_else(|| AppError::not_found("User"))?;

        let provider = request
            .provider
            .or(user.preferences.provider)
            .unwrap_or_else(|| resources.config.chat.default_provider.clone());
        let mut session = Session::new(principal.user_id, provider);
        session.model = request.model.or(user.preferences.model);
        session.system_prompt = request.system_prompt.or(user.preferences.system_prompt);
        session.settings = SessionSettings {
            temperature: request.temperature.or(user.preferences.temperature),
            max_tokens: request.max_tokens,
        };

        resources.sessions.create(&session).await?;

        let response = CreateSessionResponse {
            session_id: session.session_id,
            provider: session.provider,
            model: session.model,
            settings: session.settings,
            system_prompt: session.system_prompt,
        };
        Ok((StatusCode::CREATED, Json(response)).into_response())
    }

    /// List the caller's sessions
    async fn list_sessions(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Query(query): Query<ListSessionsQuery>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;

        let limit = query.limit.clamp(1, 100);
        let offset = query.offset.max(0);
        let sessions = resources
            .sessions
            .list_for_user(principal.user_id, limit, offset)
            .await?;
        let total = resources.sessions.count_for_user(principal.user_id).await?;

        Ok(Json(SessionListResponse { sessions, total }).into_response())
    }

    /// Deactivate a session; later turns against it read as not-found
    async fn deactivate_session(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let session = Self::owned_session(&resources, &session_id, principal).await?;

        let deactivated = resources
            .sessions
            .deactivate(session.session_id, principal.user_id)
            .await?;
        Ok(Json(json!({ "result": { "deactivated": deactivated } })).into_response())
    }

    /// List a session's messages
    async fn get_messages(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
        Query(query): Query<ListMessagesQuery>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let session = Self::owned_session(&resources, &session_id, principal).await?;

        let messages = resources
            .messages
            .list_for_session(session.session_id, query.limit)
            .await?;

        Ok(Json(MessagesResponse {
            session_id: session.session_id,
            messages,
            session,
        })
        .into_response())
    }

    /// Clear a session's context (system messages retained)
    async fn clear_context(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let session = Self::owned_session(&resources, &session_id, principal).await?;

        let deleted = resources.context.clear(session.session_id, true).await?;
        Ok(Json(json!({ "result": { "deletedMessages": deleted } })).into_response())
    }

    /// Force a summarisation pass
    async fn summarize(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let session = Self::owned_session(&resources, &session_id, principal).await?;

        let outcome = resources.context.summarise(session.session_id).await;
        Ok(Json(json!({ "result": outcome })).into_response())
    }

    /// Export a session as a JSON document or plain-text transcript
    async fn export(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
        Query(query): Query<ExportQuery>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let session = Self::owned_session(&resources, &session_id, principal).await?;
        let messages = resources
            .messages
            .list_for_session(session.session_id, None)
            .await?;

        let format = query.format.as_deref().unwrap_or("json");
        match format {
            "json" => {
                let body = serde_json::to_string_pretty(&json!({
                    "session": session,
                    "messages": messages,
                }))?;
                Ok(download_response(
                    body,
                    "application/json",
                    &format!("session-{}.json", session.session_id),
                ))
            }
            "text" => {
                let mut transcript = format!("# {}\n\n", session.title);
                for message in &messages {
                    transcript.push_str(&format!(
                        "[{}] {}: {}\n\n",
                        to_storage_timestamp(message.created_at),
                        message.role.as_str(),
                        message.content
                    ));
                }
                Ok(download_response(
                    transcript,
                    "text/plain; charset=utf-8",
                    &format!("session-{}.txt", session.session_id),
                ))
            }
            other => Err(AppError::invalid_input(format!(
                "Unknown export format: {other}"
            ))),
        }
    }

    /// Context statistics for a session
    async fn stats(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let session = Self::owned_session(&resources, &session_id, principal).await?;

        let stats = resources.context.stats(session.session_id).await?;
        Ok(Json(json!({ "stats": stats })).into_response())
    }

    // ========================================================================
    // Message Turns
    // ========================================================================

    /// Send a message and stream the response via SSE
    async fn send_message_stream(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Json(request): Json<SendMessageRequest>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let correlation_id = Self::correlation_id(&headers);

        let admitted = resources
            .orchestrator
            .admit(TurnRequest {
                principal,
                session_id: Uuid::parse_str(&request.session_id)
                    .map_err(|_| AppError::invalid_input("Invalid sessionId: expected UUID"))?,
                content: request.message,
                provider_override: request.provider,
                correlation_id,
            })
            .await?;
        let rate = admitted.rate;

        let buffer = EventBuffer::new();
        let sink = buffer.clone();
        let orchestrator = resources.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.stream_turn(admitted, &sink, None).await;
        });

        let stream = async_stream::stream! {
            // Dropping the response body (client disconnect) closes the
            // buffer, which the orchestrator observes as a dead sink.
            let _guard = CloseOnDrop(buffer.clone());
            while let Some(event) = buffer.next().await {
                let terminal = event.is_terminal();
                match serde_json::to_string(&event) {
                    Ok(json) => yield Ok::<_, Infallible>(Event::default().data(json)),
                    Err(e) => warn!(error = %e, "Failed to serialize turn event"),
                }
                if terminal {
                    break;
                }
            }
        };

        let mut response = Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        apply_rate_limit_headers(response.headers_mut(), &rate);
        Ok(response)
    }

    /// Send a message and return one JSON body after the turn finishes
    async fn send_message_simple(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Json(request): Json<SendMessageRequest>,
    ) -> Result<Response, AppError> {
        let principal = Self::authenticate(&headers, &resources)?;
        let correlation_id = Self::correlation_id(&headers);

        let admitted = resources
            .orchestrator
            .admit(TurnRequest {
                principal,
                session_id: Uuid::parse_str(&request.session_id)
                    .map_err(|_| AppError::invalid_input("Invalid sessionId: expected UUID"))?,
                content: request.message,
                provider_override: request.provider,
                correlation_id,
            })
            .await?;
        let rate = admitted.rate;

        // Buffering transport: drive the same state machine, discard frames
        let buffer = EventBuffer::new();
        let outcome = resources
            .orchestrator
            .stream_turn(admitted, &buffer, None)
            .await;

        let receipt = match outcome {
            TurnOutcome::Completed(receipt)
            | TurnOutcome::Fallback(receipt)
            | TurnOutcome::Cancelled(receipt) => receipt,
            TurnOutcome::Failed(error) => return Err(error),
        };

        let mut response = Json(SimpleMessageResponse {
            success: true,
            user_message: receipt.user_message,
            assistant_message: receipt.assistant_message,
        })
        .into_response();
        apply_rate_limit_headers(response.headers_mut(), &rate);
        Ok(response)
    }
}

/// Close the buffer when the SSE body is dropped
struct CloseOnDrop(EventBuffer);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Attach the standard rate-limit headers to a response
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let entries = [
        ("X-RateLimit-Limit", decision.total.to_string()),
        ("X-RateLimit-Remaining", decision.remaining.to_string()),
        (
            "X-RateLimit-Reset",
            (decision.reset_at_epoch_ms / 1_000).to_string(),
        ),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn download_response(body: String, content_type: &str, filename: &str) -> Response {
    let mut response = body.into_response();
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}
