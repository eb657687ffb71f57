// ABOUTME: Shared counter store abstraction backing the rate limiter
// ABOUTME: Pluggable backends (Redis, in-memory) behind one atomic-operations trait
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Counter Store
//!
//! The rate limiter's state lives behind this trait so multi-instance
//! deployments share counters through Redis while single-instance and
//! degraded deployments fall back to an in-process map. Backends implement
//! two atomic operations: a sliding-window reservation over a sorted set of
//! event timestamps, and a window-bounded token charge.

pub mod factory;
pub mod memory;
pub mod redis;

pub use factory::build_counter_store;
pub use memory::MemoryCounterStore;
pub use redis::RedisCounterStore;

use async_trait::async_trait;
use thiserror::Error;

/// Counter store failure; the limiter treats every variant as "fall back"
#[derive(Debug, Error)]
pub enum CounterError {
    /// The backend could not be reached or answered with an error
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a sliding-window reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReservation {
    /// Whether the event was admitted (and recorded)
    pub admitted: bool,
    /// Events in the window after this call
    pub current: u32,
    /// Epoch milliseconds when the oldest window entry expires
    pub reset_at_ms: u64,
}

/// Outcome of a token charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCharge {
    /// Whether the charge was applied
    pub admitted: bool,
    /// Tokens consumed in the window after this call
    pub current: u32,
    /// Epoch milliseconds when the window resets
    pub reset_at_ms: u64,
}

/// Atomic counter operations shared by limiter backends
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Reserve one event in the sliding window for `key`.
    ///
    /// Expires entries older than `now_ms - window_ms`, counts the rest, and
    /// records the event iff the count is below `max`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable.
    async fn slide_window(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        max: u32,
    ) -> Result<WindowReservation, CounterError>;

    /// Charge `amount` tokens against the window-bounded counter for `key`.
    ///
    /// Charges only when the post-charge total stays within `max`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable.
    async fn charge_tokens(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        amount: u32,
        max: u32,
    ) -> Result<TokenCharge, CounterError>;

    /// Verify the backend answers
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable.
    async fn health_check(&self) -> Result<(), CounterError>;
}
