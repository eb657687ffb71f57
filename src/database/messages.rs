// ABOUTME: Database operations for chat messages with status transitions
// ABOUTME: Implements the compare-and-set terminal transition for streamed messages
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::llm::TokenUsage;
use crate::models::{Message, MessageError, MessageMetadata, MessageRole, MessageStatus};
use crate::utils::{from_storage_timestamp, to_storage_timestamp};

/// Per-role message counts for a session
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleCounts {
    /// Number of user messages
    pub user: u64,
    /// Number of assistant messages
    pub assistant: u64,
    /// Number of system messages
    pub system: u64,
    /// Number of summary messages
    pub summary: u64,
}

/// Message record operations
#[derive(Clone)]
pub struct MessageManager {
    pool: SqlitePool,
}

impl MessageManager {
    /// Create a manager over the shared pool
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert(&self, message: &Message) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO messages (
                id, session_id, user_id, role, content,
                provider, model, token_count,
                prompt_tokens, completion_tokens, usage_total_tokens,
                response_time_ms, correlation_id,
                is_streaming, streaming_complete, status,
                error_message, error_code, error_retryable,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.user_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.metadata.provider)
        .bind(&message.metadata.model)
        .bind(i64::from(message.metadata.token_count))
        .bind(message.metadata.usage.map(|u| i64::from(u.prompt_tokens)))
        .bind(
            message
                .metadata
                .usage
                .map(|u| i64::from(u.completion_tokens)),
        )
        .bind(message.metadata.usage.map(|u| i64::from(u.total_tokens)))
        .bind(
            message
                .metadata
                .response_time_ms
                .and_then(|v| i64::try_from(v).ok()),
        )
        .bind(&message.metadata.correlation_id)
        .bind(i64::from(message.metadata.is_streaming))
        .bind(i64::from(message.metadata.streaming_complete))
        .bind(message.status.as_str())
        .bind(message.error.as_ref().map(|e| e.message.clone()))
        .bind(message.error.as_ref().map(|e| e.code.clone()))
        .bind(message.error.as_ref().map(|e| i64::from(e.retryable)))
        .bind(to_storage_timestamp(message.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to insert message: {e}")))?;

        Ok(())
    }

    /// Fetch a message by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to get message: {e}")))?;

        row.map(|r| row_to_message(&r)).transpose()
    }

    /// List a session's messages in chronological order
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_for_session(
        &self,
        session_id: Uuid,
        limit: Option<i64>,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM messages
            WHERE session_id = $1
            ORDER BY created_at ASC
            LIMIT $2
            ",
        )
        .bind(session_id.to_string())
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    /// List completed user/assistant messages created before the cutoff
    /// (the summarisation candidate set), in chronological order
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn summarisation_candidates(
        &self,
        session_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM messages
            WHERE session_id = $1
              AND role IN ('user', 'assistant')
              AND status = 'completed'
              AND created_at < $2
            ORDER BY created_at ASC
            ",
        )
        .bind(session_id.to_string())
        .bind(to_storage_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list candidates: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    /// Terminal compare-and-set: `streaming -> completed | error | cancelled`.
    ///
    /// Returns `false` when the message was already finalised (a replayed
    /// terminal transition is a no-op) or does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_streaming(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        content: &str,
        token_count: u32,
        usage: Option<TokenUsage>,
        response_time_ms: u64,
        error: Option<&MessageError>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET status = $1,
                content = $2,
                token_count = $3,
                prompt_tokens = $4,
                completion_tokens = $5,
                usage_total_tokens = $6,
                response_time_ms = $7,
                streaming_complete = 1,
                error_message = $8,
                error_code = $9,
                error_retryable = $10
            WHERE id = $11 AND status = 'streaming'
            ",
        )
        .bind(status.as_str())
        .bind(content)
        .bind(i64::from(token_count))
        .bind(usage.map(|u| i64::from(u.prompt_tokens)))
        .bind(usage.map(|u| i64::from(u.completion_tokens)))
        .bind(usage.map(|u| i64::from(u.total_tokens)))
        .bind(i64::try_from(response_time_ms).unwrap_or(i64::MAX))
        .bind(error.map(|e| e.message.clone()))
        .bind(error.map(|e| e.code.clone()))
        .bind(error.map(|e| i64::from(e.retryable)))
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to finalize message: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete messages by id, returning how many were removed
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    pub async fn delete_by_ids(&self, ids: &[Uuid]) -> AppResult<u64> {
        let mut deleted = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM messages WHERE id = $1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::database(format!("Failed to delete message: {e}")))?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// Delete a session's messages, optionally retaining system messages
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear_session(&self, session_id: Uuid, keep_system: bool) -> AppResult<u64> {
        let result = if keep_system {
            sqlx::query("DELETE FROM messages WHERE session_id = $1 AND role != 'system'")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await
        } else {
            sqlx::query("DELETE FROM messages WHERE session_id = $1")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await
        }
        .map_err(|e| AppError::database(format!("Failed to clear session messages: {e}")))?;

        Ok(result.rows_affected())
    }

    /// Count a session's messages by role
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn role_counts(&self, session_id: Uuid) -> AppResult<RoleCounts> {
        let rows = sqlx::query(
            "SELECT role, COUNT(*) AS n FROM messages WHERE session_id = $1 GROUP BY role",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to count messages: {e}")))?;

        let mut counts = RoleCounts::default();
        for row in rows {
            let role: String = row.get("role");
            let n = u64::try_from(row.get::<i64, _>("n")).unwrap_or(0);
            match role.as_str() {
                "user" => counts.user = n,
                "assistant" => counts.assistant = n,
                "system" => counts.system = n,
                "summary" => counts.summary = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Whether the session has any user message yet
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn has_user_message(&self, session_id: Uuid) -> AppResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM messages WHERE session_id = $1 AND role = 'user'",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to count user messages: {e}")))?;

        Ok(row.get::<i64, _>("n") > 0)
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> AppResult<Message> {
    let id: String = row.get("id");
    let session_id: String = row.get("session_id");
    let user_id: String = row.get("user_id");
    let role: String = row.get("role");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");

    let usage = match (
        row.get::<Option<i64>, _>("prompt_tokens"),
        row.get::<Option<i64>, _>("completion_tokens"),
        row.get::<Option<i64>, _>("usage_total_tokens"),
    ) {
        (Some(prompt), Some(completion), Some(total)) => Some(TokenUsage {
            prompt_tokens: u32::try_from(prompt).unwrap_or(0),
            completion_tokens: u32::try_from(completion).unwrap_or(0),
            total_tokens: u32::try_from(total).unwrap_or(0),
        }),
        _ => None,
    };

    let error = row
        .get::<Option<String>, _>("error_code")
        .map(|code| MessageError {
            message: row
                .get::<Option<String>, _>("error_message")
                .unwrap_or_default(),
            code,
            retryable: row
                .get::<Option<i64>, _>("error_retryable")
                .is_some_and(|v| v != 0),
        });

    Ok(Message {
        id: Uuid::parse_str(&id)?,
        session_id: Uuid::parse_str(&session_id)?,
        user_id: Uuid::parse_str(&user_id)?,
        role: MessageRole::parse(&role)
            .ok_or_else(|| AppError::database(format!("Unknown message role: {role}")))?,
        content: row.get("content"),
        metadata: MessageMetadata {
            provider: row.get("provider"),
            model: row.get("model"),
            token_count: u32::try_from(row.get::<i64, _>("token_count")).unwrap_or(0),
            usage,
            response_time_ms: row
                .get::<Option<i64>, _>("response_time_ms")
                .and_then(|v| u64::try_from(v).ok()),
            correlation_id: row.get("correlation_id"),
            is_streaming: row.get::<i64, _>("is_streaming") != 0,
            streaming_complete: row.get::<i64, _>("streaming_complete") != 0,
        },
        status: MessageStatus::parse(&status)
            .ok_or_else(|| AppError::database(format!("Unknown message status: {status}")))?,
        error,
        created_at: from_storage_timestamp(&created_at)
            .ok_or_else(|| AppError::database("Corrupt created_at on message row"))?,
    })
}
