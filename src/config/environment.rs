// ABOUTME: Environment configuration management for deployment-specific settings
// ABOUTME: Orchestrates loading of all configuration domains from environment variables
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! Environment-based configuration management
//!
//! This module is the single place environment variables are read. Every knob
//! has a default so a bare `ServerConfig::from_env()` yields a runnable
//! development configuration; `validate()` rejects combinations that would
//! misbehave at runtime.

use std::env;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::logging::LoggingConfig;

/// Server configuration for the chat orchestration core
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// HTTP listen host
    pub host: String,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Chat orchestration settings
    pub chat: ChatConfig,
    /// Rate limiting configuration
    pub rate_limiting: RateLimitConfig,
    /// Shared counter store configuration
    pub counters: CounterStoreConfig,
    /// Safety gate configuration
    pub safety: SafetyConfig,
    /// CORS configuration
    pub cors: CorsConfig,
    /// Provider adapter configuration
    pub providers: ProviderConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values.
    pub fn from_env() -> AppResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("No .env file found or failed to load: {}", e);
        }

        let config = Self {
            http_port: parse_env("HTTP_PORT", 8081),
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_owned()),
            logging: LoggingConfig::from_env(),
            database: DatabaseConfig::from_env(),
            auth: AuthConfig::from_env(),
            chat: ChatConfig::from_env(),
            rate_limiting: RateLimitConfig::from_env(),
            counters: CounterStoreConfig::from_env(),
            safety: SafetyConfig::from_env(),
            cors: CorsConfig::from_env(),
            providers: ProviderConfig::from_env(),
        };

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns an error if values are out of range or conflicting.
    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=1.0).contains(&self.safety.inbound_confidence_threshold) {
            return Err(AppError::config(format!(
                "SAFETY_INBOUND_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                self.safety.inbound_confidence_threshold
            )));
        }
        if self.chat.summarisation_threshold == 0 {
            return Err(AppError::config(
                "SUMMARISATION_THRESHOLD must be greater than zero",
            ));
        }
        if self.rate_limiting.max_requests == 0 || self.rate_limiting.chat_max_requests == 0 {
            return Err(AppError::config("rate limit maxima must be non-zero"));
        }
        if self.chat.turn_timeout_secs == 0 {
            return Err(AppError::config("TURN_TIMEOUT_SECS must be non-zero"));
        }
        Ok(())
    }

    /// One-line summary for startup logging (no secrets)
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "listen={}:{} db={} default_provider={} counter_store={} summarise_at={}",
            self.host,
            self.http_port,
            if self.database.url.contains(":memory:") {
                "sqlite-memory"
            } else {
                "sqlite"
            },
            self.chat.default_provider,
            if self.counters.redis_url.is_some() {
                "redis"
            } else {
                "in-process"
            },
            self.chat.summarisation_threshold,
        )
    }
}

// ============================================================================
// Sub-configurations
// ============================================================================

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:data/quill.db".to_owned(),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            url: env::var("DATABASE_URL").unwrap_or_else(|_| Self::default().url),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens
    pub jwt_secret: String,
    /// Token validity in hours
    pub token_expiry_hours: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "development-secret-do-not-deploy".to_owned(),
            token_expiry_hours: 24,
        }
    }
}

impl AuthConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            token_expiry_hours: parse_env("TOKEN_EXPIRY_HOURS", defaults.token_expiry_hours),
        }
    }
}

/// Chat orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Provider assigned to new sessions when none is requested
    pub default_provider: String,
    /// Ceiling used to inform prompts; not enforced as a hard cut
    pub max_context_tokens: u64,
    /// Token count above which summarisation is scheduled
    pub summarisation_threshold: u64,
    /// Messages newer than this many minutes are never summarised
    pub summarisation_recent_window_minutes: i64,
    /// Provider used for summarisation calls
    pub summary_provider: String,
    /// Sessions idle longer than this many days are expired
    pub session_ttl_days: i64,
    /// Hard wall-clock limit for one turn, admission to terminal event
    pub turn_timeout_secs: u64,
    /// How long shutdown waits for in-flight turns to finish
    pub shutdown_drain_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_provider: "mock".to_owned(),
            max_context_tokens: 8_000,
            summarisation_threshold: 6_000,
            summarisation_recent_window_minutes: 30,
            summary_provider: "mock".to_owned(),
            session_ttl_days: 30,
            turn_timeout_secs: 120,
            shutdown_drain_secs: 20,
        }
    }
}

impl ChatConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_provider: env::var("DEFAULT_PROVIDER").unwrap_or(defaults.default_provider),
            max_context_tokens: parse_env("MAX_CONTEXT_TOKENS", defaults.max_context_tokens),
            summarisation_threshold: parse_env(
                "SUMMARISATION_THRESHOLD",
                defaults.summarisation_threshold,
            ),
            summarisation_recent_window_minutes: parse_env(
                "SUMMARISATION_RECENT_WINDOW_MINUTES",
                defaults.summarisation_recent_window_minutes,
            ),
            summary_provider: env::var("SUMMARY_PROVIDER").unwrap_or(defaults.summary_provider),
            session_ttl_days: parse_env("SESSION_TTL_DAYS", defaults.session_ttl_days),
            turn_timeout_secs: parse_env("TURN_TIMEOUT_SECS", defaults.turn_timeout_secs),
            shutdown_drain_secs: parse_env("SHUTDOWN_DRAIN_SECS", defaults.shutdown_drain_secs),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length in milliseconds (global IP limit)
    pub window_ms: u64,
    /// Maximum requests per window per IP
    pub max_requests: u32,
    /// Maximum chat turns per user per 15-minute window
    pub chat_max_requests: u32,
    /// Chat window length in milliseconds
    pub chat_window_ms: u64,
    /// Daily token budget charged post-hoc per user
    pub daily_token_budget: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 300,
            chat_max_requests: 50,
            chat_window_ms: 15 * 60 * 1_000,
            daily_token_budget: 100_000,
        }
    }
}

impl RateLimitConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window_ms: parse_env("RATE_LIMIT_WINDOW_MS", defaults.window_ms),
            max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", defaults.max_requests),
            chat_max_requests: parse_env(
                "CHAT_RATE_LIMIT_MAX_REQUESTS",
                defaults.chat_max_requests,
            ),
            chat_window_ms: defaults.chat_window_ms,
            daily_token_budget: parse_env("DAILY_TOKEN_BUDGET", defaults.daily_token_budget),
        }
    }
}

/// Shared counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CounterStoreConfig {
    /// Redis connection URL; absent means in-process counters only
    pub redis_url: Option<String>,
}

impl CounterStoreConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Safety gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Inbound screen blocks only above this confidence
    pub inbound_confidence_threshold: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            inbound_confidence_threshold: 0.95,
        }
    }
}

impl SafetyConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            inbound_confidence_threshold: parse_env(
                "SAFETY_INBOUND_CONFIDENCE_THRESHOLD",
                Self::default().inbound_confidence_threshold,
            ),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Comma-separated allowed origins, or `*`
    pub allowed_origins: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: "*".to_owned(),
        }
    }
}

impl CorsConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| Self::default().allowed_origins),
        }
    }
}

/// Provider adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible endpoint
    pub openai_compat_base_url: String,
    /// API key for the OpenAI-compatible endpoint (empty for local servers)
    pub openai_compat_api_key: Option<String>,
    /// Default model for the OpenAI-compatible endpoint
    pub openai_compat_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            openai_compat_base_url: "http://localhost:11434/v1".to_owned(),
            openai_compat_api_key: None,
            openai_compat_model: "qwen2.5:14b-instruct".to_owned(),
        }
    }
}

impl ProviderConfig {
    /// Load from environment
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            openai_compat_base_url: env::var("OPENAI_COMPAT_BASE_URL")
                .unwrap_or(defaults.openai_compat_base_url),
            openai_compat_api_key: env::var("OPENAI_COMPAT_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            openai_compat_model: env::var("OPENAI_COMPAT_MODEL")
                .unwrap_or(defaults.openai_compat_model),
        }
    }
}

/// Parse an environment variable, falling back to a default on absence or parse failure
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
