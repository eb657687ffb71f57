// ABOUTME: Database abstraction for the chat core's three collections
// ABOUTME: Owns the SQLite pool, schema migration, and the per-entity managers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Persistence Layer
//!
//! Three collections back the core: `users`, `sessions`, and `messages`.
//! Each has a manager struct holding the shared pool. Timestamps are stored
//! as RFC3339 strings with millisecond precision so the
//! `(session_id, created_at)` index yields chronological order.

pub mod messages;
pub mod sessions;
pub mod users;

pub use messages::MessageManager;
pub use sessions::SessionManager;
pub use users::UserManager;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{AppError, AppResult};

/// Shared database handle
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the database and prepare the connection pool.
    ///
    /// In-memory databases are pinned to a single connection: every pooled
    /// connection to `sqlite::memory:` would otherwise see its own empty
    /// database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn connect(url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| AppError::config(format!("Invalid DATABASE_URL: {e}")))?
            .create_if_missing(true);

        let max_connections = if url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| AppError::database(format!("Failed to open database: {e}")))?;

        Ok(Self { pool })
    }

    /// Create tables and indices if they do not exist
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Database schema ready");
        Ok(())
    }

    /// Access the underlying pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Verify the database answers queries
    ///
    /// # Errors
    ///
    /// Returns an error if the probe query fails.
    pub async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL DEFAULT 'user',
    preferred_provider TEXT,
    preferred_model TEXT,
    preferred_temperature REAL,
    preferred_system_prompt TEXT,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    total_requests INTEGER NOT NULL DEFAULT 0,
    last_request_at TEXT,
    daily_token_limit INTEGER NOT NULL DEFAULT 100000,
    daily_request_limit INTEGER NOT NULL DEFAULT 1000,
    quota_reset_date TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT 'New conversation',
    provider TEXT NOT NULL,
    model TEXT,
    system_prompt TEXT,
    temperature REAL,
    max_tokens INTEGER,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    last_summarised_at TEXT,
    summary_hash TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_activity
    ON sessions(user_id, last_activity_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    provider TEXT,
    model TEXT,
    token_count INTEGER NOT NULL DEFAULT 0,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    usage_total_tokens INTEGER,
    response_time_ms INTEGER,
    correlation_id TEXT,
    is_streaming INTEGER NOT NULL DEFAULT 0,
    streaming_complete INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'completed',
    error_message TEXT,
    error_code TEXT,
    error_retryable INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session_created
    ON messages(session_id, created_at ASC);
";
