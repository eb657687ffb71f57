// ABOUTME: Counter store backend selection from configuration
// ABOUTME: Redis when configured and reachable, otherwise none (in-process fallback only)
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use std::sync::Arc;

use tracing::warn;

use super::{CounterStore, RedisCounterStore};
use crate::config::CounterStoreConfig;

/// Build the shared counter store from configuration.
///
/// Returns `None` when no store is configured or the configured store is
/// unreachable at startup; the rate limiter then runs entirely on its
/// in-process fallback. Startup proceeds either way (fail-open).
pub async fn build_counter_store(config: &CounterStoreConfig) -> Option<Arc<dyn CounterStore>> {
    let url = config.redis_url.as_deref()?;

    match RedisCounterStore::connect(url).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!(
                metric = "rate_limit_fallback",
                error = %e,
                "Shared counter store unreachable at startup; using in-process counters"
            );
            None
        }
    }
}
