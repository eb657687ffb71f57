// ABOUTME: Common data models for users, chat sessions, and messages
// ABOUTME: Defines the persisted entities, role/status enums, and quota accounting
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Core Data Models
//!
//! The three persisted entities of the chat core: [`User`] (principal with
//! quota), [`Session`] (conversation container), and [`Message`] (one turn).
//! Enums carry their wire representation via `as_str` so storage and
//! transports never disagree on spelling.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::TokenUsage;

/// Estimate the token count of a text when the provider did not report one.
///
/// `ceil(chars / 4)` — the conventional rough cut for latin-script text.
#[must_use]
pub fn estimate_tokens(content: &str) -> u32 {
    let chars = content.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

// ============================================================================
// Principal
// ============================================================================

/// Role attached to an authenticated principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Regular end user
    User,
    /// Operator with elevated access
    Admin,
}

impl UserRole {
    /// String representation used in tokens and storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Parse from the stored representation, defaulting unknown values to `User`
    #[must_use]
    pub fn from_str_or_default(value: &str) -> Self {
        match value {
            "admin" => Self::Admin,
            _ => Self::User,
        }
    }
}

/// Already-validated caller identity, produced by the auth middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    /// Authenticated user id
    pub user_id: Uuid,
    /// Role carried by the credential
    pub role: UserRole,
}

// ============================================================================
// User
// ============================================================================

/// Per-user model preferences applied to new sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Preferred provider name
    pub provider: Option<String>,
    /// Preferred model identifier
    pub model: Option<String>,
    /// Preferred sampling temperature
    pub temperature: Option<f32>,
    /// Preferred system prompt
    pub system_prompt: Option<String>,
}

/// Lifetime and daily usage counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUsage {
    /// Tokens consumed since the last quota reset
    pub total_tokens: u64,
    /// Completed turns since the last quota reset
    pub total_requests: u64,
    /// Timestamp of the most recent completed turn
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Daily caps for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuotas {
    /// Maximum tokens per day
    pub daily_token_limit: u64,
    /// Maximum turns per day
    pub daily_request_limit: u64,
    /// Day the counters were last reset
    pub reset_date: NaiveDate,
}

impl Default for UserQuotas {
    fn default() -> Self {
        Self {
            daily_token_limit: 100_000,
            daily_request_limit: 1_000,
            reset_date: Utc::now().date_naive(),
        }
    }
}

/// Principal with quota, created externally and read on every turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user id
    pub id: Uuid,
    /// Login email
    pub email: String,
    /// Role
    pub role: UserRole,
    /// Model preferences
    pub preferences: UserPreferences,
    /// Usage counters, updated at assistant-turn completion
    pub usage: UserUsage,
    /// Daily caps
    pub quotas: UserQuotas,
    /// Whether the account is active
    pub is_active: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a new active user with default preferences and quotas
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            role: UserRole::User,
            preferences: UserPreferences::default(),
            usage: UserUsage::default(),
            quotas: UserQuotas::default(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Whether the user has exhausted either daily cap.
    ///
    /// Counters are logically reset at the day boundary: when `reset_date`
    /// is in the past the usage no longer counts against today's quota.
    #[must_use]
    pub fn has_exceeded_quotas(&self, now: DateTime<Utc>) -> bool {
        if self.quotas.reset_date < now.date_naive() {
            return false;
        }
        self.usage.total_tokens >= self.quotas.daily_token_limit
            || self.usage.total_requests >= self.quotas.daily_request_limit
    }
}

// ============================================================================
// Session
// ============================================================================

/// Tunable generation settings stored per session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens per completion
    pub max_tokens: Option<u32>,
}

/// Running context accounting for a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    /// Sum of token counts of all live messages
    pub total_tokens: u64,
    /// Number of live messages
    pub message_count: u64,
    /// When summarisation last committed
    pub last_summarised_at: Option<DateTime<Utc>>,
    /// Hash of the content the last summary replaced
    pub summary_hash: Option<String>,
}

/// Conversation container, owned by exactly one user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session id
    pub session_id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// Display title, derived from the first user message
    pub title: String,
    /// Provider used for turns in this session
    pub provider: String,
    /// Model override, if any
    pub model: Option<String>,
    /// Session system prompt
    pub system_prompt: Option<String>,
    /// Generation settings
    pub settings: SessionSettings,
    /// Context accounting
    pub context: SessionContext,
    /// Deactivated sessions reject new turns
    pub is_active: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last turn or lifecycle activity
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Create a new active session for a user
    #[must_use]
    pub fn new(user_id: Uuid, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            title: "New conversation".to_owned(),
            provider: provider.into(),
            model: None,
            system_prompt: None,
            settings: SessionSettings::default(),
            context: SessionContext::default(),
            is_active: true,
            created_at: now,
            last_activity_at: now,
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// Role of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End-user turn
    User,
    /// Model response
    Assistant,
    /// System instruction (position 0)
    System,
    /// Compressed replacement of an older user/assistant prefix
    Summary,
}

impl MessageRole {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Summary => "summary",
        }
    }

    /// Parse from the storage representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// Lifecycle status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Created, stream not yet started
    Pending,
    /// Tokens are being appended
    Streaming,
    /// Terminal: content is final
    Completed,
    /// Terminal: failed with a captured error
    Error,
    /// Terminal: client cancelled mid-stream
    Cancelled,
}

impl MessageStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the storage representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "streaming" => Some(Self::Streaming),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status ends the message lifecycle
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Provenance and accounting metadata attached to a message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Provider that produced the message (assistant messages)
    pub provider: Option<String>,
    /// Model that produced the message
    pub model: Option<String>,
    /// Authoritative or estimated token count
    pub token_count: u32,
    /// Full usage reported by the provider, if any
    pub usage: Option<TokenUsage>,
    /// Wall-clock duration of the turn in milliseconds
    pub response_time_ms: Option<u64>,
    /// Correlation id of the producing turn
    pub correlation_id: Option<String>,
    /// Whether the message was produced by a streaming call
    pub is_streaming: bool,
    /// Whether the stream reached its terminal event
    pub streaming_complete: bool,
}

/// Captured failure state of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageError {
    /// Sanitized error message
    pub message: String,
    /// Error code label
    pub code: String,
    /// Whether the client may retry the turn
    pub retryable: bool,
}

/// One turn: user, assistant, system, or summary content
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id
    pub id: Uuid,
    /// Owning session
    pub session_id: Uuid,
    /// User owning the session
    pub user_id: Uuid,
    /// Message role
    pub role: MessageRole,
    /// Message content (empty while streaming)
    pub content: String,
    /// Provenance metadata
    pub metadata: MessageMetadata,
    /// Lifecycle status
    pub status: MessageStatus,
    /// Captured error for `error`/fallback messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    /// Server-assigned creation timestamp (ms precision)
    pub created_at: DateTime<Utc>,
}
