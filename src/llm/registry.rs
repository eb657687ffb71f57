// ABOUTME: Provider registry holding adapters and selecting a working one
// ABOUTME: Implements the preferred -> default -> mock fallback order with fast probes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::{ChatProvider, ConnectionStatus};
use crate::errors::{AppError, AppResult};

/// Upper bound on a connectivity probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Registry of provider adapters
///
/// Holds every registered adapter behind the [`ChatProvider`] contract.
/// Per-turn lookups use [`get`](Self::get) directly;
/// [`get_working`](Self::get_working) probes connectivity and is reserved for
/// session creation and health checks so probes never sit on the turn
/// critical path.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    default_provider: String,
}

impl ProviderRegistry {
    /// Create a registry with the given default provider name
    #[must_use]
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider adapter under its own name
    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(provider.name().to_owned(), provider);
    }

    /// Get a provider by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(name).cloned()
    }

    /// Name of the configured default provider
    #[must_use]
    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Names of all registered providers
    #[must_use]
    pub fn known_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a provider name is registered
    #[must_use]
    pub fn is_known(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Select a working provider: `preferred`, then the default, then `mock`.
    ///
    /// Each candidate is probed with `test_connection()` under a one second
    /// deadline; the first success wins. The mock adapter always succeeds,
    /// so a registry that registers it cannot fail here.
    ///
    /// # Errors
    ///
    /// Returns an error only when no candidate (including mock) answers.
    pub async fn get_working(&self, preferred: Option<&str>) -> AppResult<Arc<dyn ChatProvider>> {
        let mut candidates: Vec<&str> = Vec::with_capacity(3);
        if let Some(name) = preferred {
            candidates.push(name);
        }
        candidates.push(&self.default_provider);
        candidates.push("mock");
        candidates.dedup();

        for name in candidates {
            let Some(provider) = self.providers.get(name) else {
                warn!(provider = name, "Fallback candidate is not registered");
                continue;
            };

            match timeout(PROBE_TIMEOUT, provider.test_connection()).await {
                Ok(ConnectionStatus { success: true, .. }) => {
                    debug!(provider = name, "Provider probe succeeded");
                    return Ok(provider.clone());
                }
                Ok(ConnectionStatus { error, .. }) => {
                    warn!(
                        provider = name,
                        error = error.as_deref().unwrap_or("unknown"),
                        "Provider probe failed"
                    );
                }
                Err(_) => {
                    warn!(provider = name, "Provider probe timed out");
                }
            }
        }

        Err(AppError::new(
            crate::errors::ErrorCode::ProviderUnavailable,
            "No working provider available",
        ))
    }
}
