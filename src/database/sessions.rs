// ABOUTME: Database operations for chat sessions with owner isolation
// ABOUTME: Handles context counter updates, summary commits, and TTL expiry
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{Session, SessionContext, SessionSettings};
use crate::utils::{from_storage_timestamp, to_storage_timestamp};

/// Session record operations
#[derive(Clone)]
pub struct SessionManager {
    pool: SqlitePool,
}

impl SessionManager {
    /// Create a manager over the shared pool
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new session
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create(&self, session: &Session) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO sessions (
                session_id, user_id, title, provider, model, system_prompt,
                temperature, max_tokens,
                total_tokens, message_count, last_summarised_at, summary_hash,
                is_active, created_at, last_activity_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ",
        )
        .bind(session.session_id.to_string())
        .bind(session.user_id.to_string())
        .bind(&session.title)
        .bind(&session.provider)
        .bind(&session.model)
        .bind(&session.system_prompt)
        .bind(session.settings.temperature)
        .bind(session.settings.max_tokens.map(i64::from))
        .bind(i64::try_from(session.context.total_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(session.context.message_count).unwrap_or(i64::MAX))
        .bind(session.context.last_summarised_at.map(to_storage_timestamp))
        .bind(&session.context.summary_hash)
        .bind(i64::from(session.is_active))
        .bind(to_storage_timestamp(session.created_at))
        .bind(to_storage_timestamp(session.last_activity_at))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create session: {e}")))?;

        Ok(())
    }

    /// Fetch a session by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, session_id: Uuid) -> AppResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to get session: {e}")))?;

        row.map(|r| row_to_session(&r)).transpose()
    }

    /// Fetch a session owned by the given user.
    ///
    /// A session owned by someone else reads as absent; callers translate
    /// that to `not-found`, never to an authorization error.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_for_user(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = $1 AND user_id = $2")
            .bind(session_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to get session: {e}")))?;

        row.map(|r| row_to_session(&r)).transpose()
    }

    /// List a user's sessions, most recently active first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Session>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM sessions
            WHERE user_id = $1
            ORDER BY last_activity_at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list sessions: {e}")))?;

        rows.iter().map(row_to_session).collect()
    }

    /// Count a user's sessions
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_for_user(&self, user_id: Uuid) -> AppResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE user_id = $1")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to count sessions: {e}")))?;

        Ok(u64::try_from(row.get::<i64, _>("n")).unwrap_or(0))
    }

    /// Set the display title when it still has the default value
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_title_if_default(&self, session_id: Uuid, title: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE sessions SET title = $1 WHERE session_id = $2 AND title = 'New conversation'",
        )
        .bind(title)
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to set session title: {e}")))?;

        Ok(())
    }

    /// Add to the session's context counters and bump activity.
    ///
    /// Deltas may be negative; the counters are clamped at zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn add_context_usage(
        &self,
        session_id: Uuid,
        token_delta: i64,
        message_delta: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE sessions
            SET total_tokens = MAX(0, total_tokens + $1),
                message_count = MAX(0, message_count + $2),
                last_activity_at = $3
            WHERE session_id = $4
            ",
        )
        .bind(token_delta)
        .bind(message_delta)
        .bind(to_storage_timestamp(now))
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to update session context: {e}")))?;

        Ok(())
    }

    /// Commit a summarisation: counter adjustment, hash, and timestamp
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn apply_summary(
        &self,
        session_id: Uuid,
        tokens_removed: u64,
        summary_tokens: u64,
        messages_removed: u64,
        summary_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let token_delta =
            i64::try_from(summary_tokens).unwrap_or(0) - i64::try_from(tokens_removed).unwrap_or(0);
        let message_delta = 1 - i64::try_from(messages_removed).unwrap_or(0);

        sqlx::query(
            r"
            UPDATE sessions
            SET total_tokens = MAX(0, total_tokens + $1),
                message_count = MAX(0, message_count + $2),
                last_summarised_at = $3,
                summary_hash = $4
            WHERE session_id = $5
            ",
        )
        .bind(token_delta)
        .bind(message_delta)
        .bind(to_storage_timestamp(now))
        .bind(summary_hash)
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to commit summary: {e}")))?;

        Ok(())
    }

    /// Reset the context counters after a clear
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reset_context(
        &self,
        session_id: Uuid,
        message_count: u64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE sessions
            SET total_tokens = 0, message_count = $1, last_activity_at = $2
            WHERE session_id = $3
            ",
        )
        .bind(i64::try_from(message_count).unwrap_or(0))
        .bind(to_storage_timestamp(now))
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to reset session context: {e}")))?;

        Ok(())
    }

    /// Deactivate a session owned by the given user
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn deactivate(&self, session_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let result =
            sqlx::query("UPDATE sessions SET is_active = 0 WHERE session_id = $1 AND user_id = $2")
                .bind(session_id.to_string())
                .bind(user_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::database(format!("Failed to deactivate session: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Expire sessions idle since before the cutoff, returning how many
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn expire_idle(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = 0 WHERE is_active = 1 AND last_activity_at < $1",
        )
        .bind(to_storage_timestamp(cutoff))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to expire sessions: {e}")))?;

        Ok(result.rows_affected())
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> AppResult<Session> {
    let session_id: String = row.get("session_id");
    let user_id: String = row.get("user_id");
    let last_summarised_at: Option<String> = row.get("last_summarised_at");
    let created_at: String = row.get("created_at");
    let last_activity_at: String = row.get("last_activity_at");

    Ok(Session {
        session_id: Uuid::parse_str(&session_id)?,
        user_id: Uuid::parse_str(&user_id)?,
        title: row.get("title"),
        provider: row.get("provider"),
        model: row.get("model"),
        system_prompt: row.get("system_prompt"),
        settings: SessionSettings {
            temperature: row.get("temperature"),
            max_tokens: row
                .get::<Option<i64>, _>("max_tokens")
                .and_then(|v| u32::try_from(v).ok()),
        },
        context: SessionContext {
            total_tokens: u64::try_from(row.get::<i64, _>("total_tokens")).unwrap_or(0),
            message_count: u64::try_from(row.get::<i64, _>("message_count")).unwrap_or(0),
            last_summarised_at: last_summarised_at
                .as_deref()
                .and_then(from_storage_timestamp),
            summary_hash: row.get("summary_hash"),
        },
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: from_storage_timestamp(&created_at)
            .ok_or_else(|| AppError::database("Corrupt created_at on session row"))?,
        last_activity_at: from_storage_timestamp(&last_activity_at)
            .ok_or_else(|| AppError::database("Corrupt last_activity_at on session row"))?,
    })
}
