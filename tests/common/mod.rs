// ABOUTME: Shared test utilities: in-memory resources, users, sessions, clocks
// ABOUTME: Reduces duplication across the integration test suites
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex, Once};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use quill_chat_server::auth::AuthManager;
use quill_chat_server::config::{
    AuthConfig, ChatConfig, CorsConfig, CounterStoreConfig, DatabaseConfig, ProviderConfig,
    RateLimitConfig, SafetyConfig, ServerConfig,
};
use quill_chat_server::models::{Session, User};
use quill_chat_server::server::ServerResources;
use quill_chat_server::utils::Clock;

static INIT_LOGGER: Once = Once::new();

/// Quiet logging for tests (once per process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

/// Configuration for an isolated in-memory server
pub fn test_config() -> ServerConfig {
    ServerConfig {
        http_port: 0,
        host: "127.0.0.1".to_owned(),
        logging: quill_chat_server::logging::LoggingConfig::default(),
        database: DatabaseConfig {
            url: "sqlite::memory:".to_owned(),
        },
        auth: AuthConfig {
            jwt_secret: "integration-test-secret".to_owned(),
            token_expiry_hours: 1,
        },
        chat: ChatConfig {
            default_provider: "mock".to_owned(),
            summary_provider: "mock".to_owned(),
            ..ChatConfig::default()
        },
        rate_limiting: RateLimitConfig {
            max_requests: 10_000,
            ..RateLimitConfig::default()
        },
        counters: CounterStoreConfig::default(),
        safety: SafetyConfig::default(),
        cors: CorsConfig::default(),
        providers: ProviderConfig::default(),
    }
}

/// Fresh resources over an in-memory database
pub async fn create_test_resources() -> Arc<ServerResources> {
    create_test_resources_with(test_config()).await
}

/// Fresh resources with a customised configuration
pub async fn create_test_resources_with(config: ServerConfig) -> Arc<ServerResources> {
    init_test_logging();
    ServerResources::initialize(config)
        .await
        .expect("test resources")
}

/// Create a standard test user
pub async fn create_test_user(resources: &ServerResources) -> User {
    let user = User::new(format!("user-{}@example.com", Uuid::new_v4().simple()));
    resources.users.create(&user).await.unwrap();
    user
}

/// Create an active session for a user
pub async fn create_test_session(
    resources: &ServerResources,
    user: &User,
    provider: &str,
) -> Session {
    let session = Session::new(user.id, provider);
    resources.sessions.create(&session).await.unwrap();
    session
}

/// Bearer header value for a user
pub fn bearer_for(auth: &AuthManager, user: &User) -> String {
    let token = auth.generate_token(user.id, user.role).unwrap();
    format!("Bearer {token}")
}

/// Settable clock for deterministic recency-window tests
pub struct TestClock {
    now: Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
