// ABOUTME: Server assembly: shared resources, router composition, lifecycle
// ABOUTME: Builds every component once at startup and passes them explicitly
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Server Assembly
//!
//! [`ServerResources`] is the single service container: every component is
//! instantiated once here and handed to the routers explicitly. There are no
//! process-wide singletons beyond configuration. Startup establishes the
//! database and counter store before the listener binds; shutdown stops
//! intake, waits up to the drain window for in-flight turns, then exits.

use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, Router};
use chrono::Duration as ChronoDuration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::auth::AuthManager;
use crate::config::ServerConfig;
use crate::context::ContextManager;
use crate::counters::{build_counter_store, CounterStore};
use crate::database::{Database, MessageManager, SessionManager, UserManager};
use crate::errors::{AppError, AppResult};
use crate::llm::{
    MockProvider, OpenAiCompatibleConfig, OpenAiCompatibleProvider, ProviderRegistry,
};
use crate::middleware::{ip_rate_limit_middleware, request_id_middleware, setup_cors};
use crate::orchestrator::TurnOrchestrator;
use crate::rate_limiting::RateLimiter;
use crate::routes::{health_routes, ChatRoutes};
use crate::safety::SafetyGate;
use crate::utils::{SharedClock, SystemClock};
use crate::websocket::websocket_routes;

/// Interval between session TTL sweeps
const SESSION_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Everything the routes and transports need, wired once at startup
pub struct ServerResources {
    /// Loaded configuration
    pub config: ServerConfig,
    /// Database handle
    pub database: Database,
    /// User records
    pub users: UserManager,
    /// Session records
    pub sessions: SessionManager,
    /// Message records
    pub messages: MessageManager,
    /// Provider adapters
    pub registry: Arc<ProviderRegistry>,
    /// Safety gate
    pub safety: Arc<SafetyGate>,
    /// Rate limiter
    pub rate_limiter: Arc<RateLimiter>,
    /// Shared counter store backing the limiter (None = in-process only)
    pub counter_store: Option<Arc<dyn CounterStore>>,
    /// Context manager
    pub context: ContextManager,
    /// Turn orchestrator
    pub orchestrator: Arc<TurnOrchestrator>,
    /// Token validation
    pub auth: Arc<AuthManager>,
    /// Shared clock
    pub clock: SharedClock,
}

impl ServerResources {
    /// Connect stores, build components, and wire the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be prepared or a component
    /// rejects its configuration.
    pub async fn initialize(config: ServerConfig) -> AppResult<Arc<Self>> {
        let clock: SharedClock = Arc::new(SystemClock);

        let database = Database::connect(&config.database.url).await?;
        database.migrate().await?;

        let counter_store = build_counter_store(&config.counters).await;
        let rate_limiter = Arc::new(RateLimiter::new(counter_store.clone(), clock.clone()));

        let mut registry = ProviderRegistry::new(config.chat.default_provider.clone());
        registry.register(Arc::new(MockProvider::new()));
        registry.register(Arc::new(OpenAiCompatibleProvider::new(
            OpenAiCompatibleConfig {
                base_url: config.providers.openai_compat_base_url.clone(),
                api_key: config.providers.openai_compat_api_key.clone(),
                default_model: config.providers.openai_compat_model.clone(),
            },
        )?));
        let registry = Arc::new(registry);

        if !registry.is_known(&config.chat.default_provider) {
            return Err(AppError::config(format!(
                "DEFAULT_PROVIDER '{}' is not a registered provider",
                config.chat.default_provider
            )));
        }

        let safety = Arc::new(SafetyGate::new(config.safety.clone())?);
        let users = UserManager::new(database.pool().clone());
        let sessions = SessionManager::new(database.pool().clone());
        let messages = MessageManager::new(database.pool().clone());

        let context = ContextManager::new(
            sessions.clone(),
            messages.clone(),
            registry.clone(),
            config.chat.clone(),
            clock.clone(),
        );

        let orchestrator = Arc::new(TurnOrchestrator::new(
            users.clone(),
            sessions.clone(),
            messages.clone(),
            context.clone(),
            registry.clone(),
            safety.clone(),
            rate_limiter.clone(),
            config.chat.clone(),
            config.rate_limiting.clone(),
            clock.clone(),
        ));

        let auth = Arc::new(AuthManager::new(
            &config.auth.jwt_secret,
            config.auth.token_expiry_hours,
        ));

        Ok(Arc::new(Self {
            config,
            database,
            users,
            sessions,
            messages,
            registry,
            safety,
            rate_limiter,
            counter_store,
            context,
            orchestrator,
            auth,
            clock,
        }))
    }
}

/// Compose the full router over the shared resources
pub fn build_router(resources: Arc<ServerResources>) -> Router {
    Router::new()
        .merge(ChatRoutes::routes(resources.clone()))
        .merge(websocket_routes(resources.clone()))
        .merge(health_routes(resources.clone()))
        .layer(middleware::from_fn_with_state(
            resources.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(setup_cors(&resources.config.cors))
}

/// Run the server until a shutdown signal, then drain in-flight turns
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn run(resources: Arc<ServerResources>) -> AppResult<()> {
    spawn_session_sweep(resources.clone());

    let router = build_router(resources.clone());
    let addr = format!(
        "{}:{}",
        resources.config.host, resources.config.http_port
    );
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::internal(format!("Failed to bind {addr}: {e}")))?;

    info!("Listening on {addr} ({})", resources.config.summary());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::internal(format!("Server error: {e}")))?;

    drain_in_flight(&resources).await;
    info!("Shutdown complete");
    Ok(())
}

/// Periodic expiry of sessions idle past the configured TTL
fn spawn_session_sweep(resources: Arc<ServerResources>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let cutoff = resources.clock.now()
                - ChronoDuration::days(resources.config.chat.session_ttl_days);
            match resources.sessions.expire_idle(cutoff).await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "Expired idle sessions"),
                Err(e) => warn!(error = %e, "Session TTL sweep failed"),
            }
        }
    });
}

/// Wait up to the drain window for in-flight turns to reach terminal state
async fn drain_in_flight(resources: &ServerResources) {
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(resources.config.chat.shutdown_drain_secs);

    loop {
        let in_flight = resources.orchestrator.in_flight();
        if in_flight == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(in_flight, "Drain window elapsed with turns still in flight");
            return;
        }
        info!(in_flight, "Draining in-flight turns");
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
