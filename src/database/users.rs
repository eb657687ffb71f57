// ABOUTME: Database operations for user records and usage counters
// ABOUTME: Handles quota window resets and the terminal-turn counter increment
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{User, UserPreferences, UserQuotas, UserRole, UserUsage};
use crate::utils::{from_storage_timestamp, to_storage_timestamp};

/// User record operations
#[derive(Clone)]
pub struct UserManager {
    pool: SqlitePool,
}

impl UserManager {
    /// Create a manager over the shared pool
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new user
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (duplicate email included).
    pub async fn create(&self, user: &User) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO users (
                id, email, role,
                preferred_provider, preferred_model, preferred_temperature, preferred_system_prompt,
                total_tokens, total_requests, last_request_at,
                daily_token_limit, daily_request_limit, quota_reset_date,
                is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(&user.preferences.provider)
        .bind(&user.preferences.model)
        .bind(user.preferences.temperature)
        .bind(&user.preferences.system_prompt)
        .bind(i64::try_from(user.usage.total_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(user.usage.total_requests).unwrap_or(i64::MAX))
        .bind(user.usage.last_request_at.map(to_storage_timestamp))
        .bind(i64::try_from(user.quotas.daily_token_limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(user.quotas.daily_request_limit).unwrap_or(i64::MAX))
        .bind(user.quotas.reset_date.to_string())
        .bind(i64::from(user.is_active))
        .bind(to_storage_timestamp(user.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create user: {e}")))?;

        Ok(())
    }

    /// Fetch a user by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, user_id: Uuid) -> AppResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to get user: {e}")))?;

        row.map(|r| row_to_user(&r)).transpose()
    }

    /// Fetch a user by email
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to get user by email: {e}")))?;

        row.map(|r| row_to_user(&r)).transpose()
    }

    /// Record a completed assistant turn for the user.
    ///
    /// Rolls the daily quota window first (zeroing stale counters), then
    /// increments `total_requests` by one and `total_tokens` by the turn's
    /// usage in a single statement, so concurrent terminal transitions from
    /// different sessions never lose an increment.
    ///
    /// # Errors
    ///
    /// Returns an error if either update fails.
    pub async fn record_completed_turn(
        &self,
        user_id: Uuid,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let today = now.date_naive().to_string();

        sqlx::query(
            r"
            UPDATE users
            SET total_tokens = 0, total_requests = 0, quota_reset_date = $1
            WHERE id = $2 AND quota_reset_date < $1
            ",
        )
        .bind(&today)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to roll quota window: {e}")))?;

        sqlx::query(
            r"
            UPDATE users
            SET total_requests = total_requests + 1,
                total_tokens = total_tokens + $1,
                last_request_at = $2
            WHERE id = $3
            ",
        )
        .bind(i64::try_from(tokens).unwrap_or(i64::MAX))
        .bind(to_storage_timestamp(now))
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to record turn usage: {e}")))?;

        Ok(())
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> AppResult<User> {
    let id: String = row.get("id");
    let role: String = row.get("role");
    let last_request_at: Option<String> = row.get("last_request_at");
    let reset_date: String = row.get("quota_reset_date");
    let created_at: String = row.get("created_at");

    Ok(User {
        id: Uuid::parse_str(&id)?,
        email: row.get("email"),
        role: UserRole::from_str_or_default(&role),
        preferences: UserPreferences {
            provider: row.get("preferred_provider"),
            model: row.get("preferred_model"),
            temperature: row.get("preferred_temperature"),
            system_prompt: row.get("preferred_system_prompt"),
        },
        usage: UserUsage {
            total_tokens: u64::try_from(row.get::<i64, _>("total_tokens")).unwrap_or(0),
            total_requests: u64::try_from(row.get::<i64, _>("total_requests")).unwrap_or(0),
            last_request_at: last_request_at.as_deref().and_then(from_storage_timestamp),
        },
        quotas: UserQuotas {
            daily_token_limit: u64::try_from(row.get::<i64, _>("daily_token_limit")).unwrap_or(0),
            daily_request_limit: u64::try_from(row.get::<i64, _>("daily_request_limit"))
                .unwrap_or(0),
            reset_date: reset_date
                .parse::<NaiveDate>()
                .map_err(|e| AppError::database(format!("Corrupt quota_reset_date: {e}")))?,
        },
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: from_storage_timestamp(&created_at)
            .ok_or_else(|| AppError::database("Corrupt created_at on user row"))?,
    })
}
