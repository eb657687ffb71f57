// ABOUTME: Unified rate limiting for turn admission and global request throttling
// ABOUTME: Sliding-window request checks and token-budget checks with fail-open semantics
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Rate Limiter
//!
//! Two orthogonal budgets per key: a request count over a sliding window and
//! a token budget over a fixed window. Keys are namespaced by the caller
//! (`ip:<addr>`, `user:<id>`, `chat:<user_id>`, `tokens:<user_id>`).
//!
//! When a shared counter store is configured the limiter delegates to its
//! atomic operations; when the store fails mid-flight the check repeats on
//! the in-process fallback and emits a `rate_limit_fallback` metric event.
//! Any remaining internal error makes the decision **allow** with a full
//! remaining budget (fail-open) plus a `rate_limit_error` metric event.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::counters::{CounterStore, MemoryCounterStore, TokenCharge, WindowReservation};
use crate::utils::SharedClock;

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the request/charge was admitted
    pub allowed: bool,
    /// Budget remaining after this call
    pub remaining: u32,
    /// Epoch milliseconds when the window resets
    pub reset_at_epoch_ms: u64,
    /// Configured budget for the window
    pub total: u32,
    /// Budget consumed inside the current window
    pub current: u32,
}

impl RateLimitDecision {
    /// Fail-open decision: allow with the whole budget remaining
    #[must_use]
    pub const fn fail_open(max: u32, now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: max,
            reset_at_epoch_ms: now_ms,
            total: max,
            current: 0,
        }
    }

    /// Seconds until the window resets, clamped to at least one
    #[must_use]
    pub fn retry_after_secs(&self, now_ms: u64) -> i64 {
        let delta_ms = self.reset_at_epoch_ms.saturating_sub(now_ms);
        i64::try_from(delta_ms.div_ceil(1_000)).unwrap_or(1).max(1)
    }
}

/// Sliding-window rate limiter over a shared store with local fallback
pub struct RateLimiter {
    shared: Option<Arc<dyn CounterStore>>,
    fallback: MemoryCounterStore,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter; `shared` is the optional cross-instance store
    #[must_use]
    pub fn new(shared: Option<Arc<dyn CounterStore>>, clock: SharedClock) -> Self {
        Self {
            shared,
            fallback: MemoryCounterStore::new(),
            clock,
        }
    }

    /// Admit-or-reject one request for `key` against `max_requests` per
    /// sliding window of `window_ms`.
    pub async fn check_request(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
    ) -> RateLimitDecision {
        let now_ms = self.clock.now_epoch_ms();

        let reservation = match &self.shared {
            Some(store) => match store.slide_window(key, window_ms, now_ms, max_requests).await {
                Ok(reservation) => Ok(reservation),
                Err(e) => {
                    warn!(
                        metric = "rate_limit_fallback",
                        key,
                        error = %e,
                        "Shared counter store failed; using in-process window"
                    );
                    self.fallback
                        .slide_window(key, window_ms, now_ms, max_requests)
                        .await
                }
            },
            None => {
                self.fallback
                    .slide_window(key, window_ms, now_ms, max_requests)
                    .await
            }
        };

        match reservation {
            Ok(WindowReservation {
                admitted,
                current,
                reset_at_ms,
            }) => RateLimitDecision {
                allowed: admitted,
                remaining: max_requests.saturating_sub(current),
                reset_at_epoch_ms: reset_at_ms,
                total: max_requests,
                current,
            },
            Err(e) => {
                warn!(
                    metric = "rate_limit_error",
                    key,
                    error = %e,
                    "Rate limit check failed; failing open"
                );
                RateLimitDecision::fail_open(max_requests, now_ms)
            }
        }
    }

    /// Charge `tokens_to_charge` against the token budget for `key`.
    ///
    /// Charges only when the decision is allow.
    pub async fn check_tokens(
        &self,
        key: &str,
        window_ms: u64,
        tokens_to_charge: u32,
        max_tokens: u32,
    ) -> RateLimitDecision {
        let now_ms = self.clock.now_epoch_ms();

        let charge = match &self.shared {
            Some(store) => match store
                .charge_tokens(key, window_ms, now_ms, tokens_to_charge, max_tokens)
                .await
            {
                Ok(charge) => Ok(charge),
                Err(e) => {
                    warn!(
                        metric = "rate_limit_fallback",
                        key,
                        error = %e,
                        "Shared counter store failed; using in-process token window"
                    );
                    self.fallback
                        .charge_tokens(key, window_ms, now_ms, tokens_to_charge, max_tokens)
                        .await
                }
            },
            None => {
                self.fallback
                    .charge_tokens(key, window_ms, now_ms, tokens_to_charge, max_tokens)
                    .await
            }
        };

        match charge {
            Ok(TokenCharge {
                admitted,
                current,
                reset_at_ms,
            }) => RateLimitDecision {
                allowed: admitted,
                remaining: max_tokens.saturating_sub(current),
                reset_at_epoch_ms: reset_at_ms,
                total: max_tokens,
                current,
            },
            Err(e) => {
                warn!(
                    metric = "rate_limit_error",
                    key,
                    error = %e,
                    "Token budget check failed; failing open"
                );
                RateLimitDecision::fail_open(max_tokens, now_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterError;
    use crate::utils::{Clock, SystemClock};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn slide_window(
            &self,
            _: &str,
            _: u64,
            _: u64,
            _: u32,
        ) -> Result<WindowReservation, CounterError> {
            Err(CounterError::Unavailable("connection refused".to_owned()))
        }
        async fn charge_tokens(
            &self,
            _: &str,
            _: u64,
            _: u64,
            _: u32,
            _: u32,
        ) -> Result<TokenCharge, CounterError> {
            Err(CounterError::Unavailable("connection refused".to_owned()))
        }
        async fn health_check(&self) -> Result<(), CounterError> {
            Err(CounterError::Unavailable("connection refused".to_owned()))
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(None, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_requests_rejected_over_limit() {
        let limiter = limiter();
        for _ in 0..3 {
            let d = limiter.check_request("user:a", 60_000, 3).await;
            assert!(d.allowed);
        }
        let d = limiter.check_request("user:a", 60_000, 3).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.total, 3);
        assert!(d.reset_at_epoch_ms > 0);
    }

    #[tokio::test]
    async fn test_broken_shared_store_falls_back_and_still_limits() {
        let limiter = RateLimiter::new(Some(Arc::new(BrokenStore)), Arc::new(SystemClock));
        assert!(limiter.check_request("k", 60_000, 1).await.allowed);
        // The fallback map carries the state, so the second call is rejected
        assert!(!limiter.check_request("k", 60_000, 1).await.allowed);
    }

    #[tokio::test]
    async fn test_token_charge_only_on_allow() {
        let limiter = limiter();
        let d = limiter.check_tokens("tokens:u", 60_000, 800, 1_000).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 200);

        let d = limiter.check_tokens("tokens:u", 60_000, 300, 1_000).await;
        assert!(!d.allowed);
        // The rejected charge was not applied
        assert_eq!(d.current, 800);
    }

    #[tokio::test]
    async fn test_retry_after_at_least_one_second() {
        let now = Utc::now();
        let clock = Arc::new(FixedClock(now));
        let limiter = RateLimiter::new(None, clock.clone());
        limiter.check_request("k", 10_000, 1).await;
        let d = limiter.check_request("k", 10_000, 1).await;
        assert!(!d.allowed);
        assert!(d.retry_after_secs(clock.now_epoch_ms()) >= 1);
    }
}
