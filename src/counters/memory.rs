// ABOUTME: In-process counter store used standalone or as the degraded fallback
// ABOUTME: Single-mutex maps with opportunistic compaction on a probabilistic schedule
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;

use super::{CounterError, CounterStore, TokenCharge, WindowReservation};

/// Probability that a call sweeps expired entries from every key
const COMPACTION_PROBABILITY: f64 = 0.01;

#[derive(Debug, Default)]
struct TokenWindow {
    consumed: u32,
    reset_at_ms: u64,
}

#[derive(Debug, Default)]
struct Inner {
    windows: HashMap<String, VecDeque<u64>>,
    tokens: HashMap<String, TokenWindow>,
}

/// In-process counter store.
///
/// Under-counts across instances by design; acceptable as the fail-open
/// degradation of the shared store.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    inner: Mutex<Inner>,
}

impl MemoryCounterStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn maybe_compact(inner: &mut Inner, now_ms: u64, window_ms: u64) {
        if rand::thread_rng().gen::<f64>() >= COMPACTION_PROBABILITY {
            return;
        }
        let cutoff = now_ms.saturating_sub(window_ms);
        inner.windows.retain(|_, events| {
            while events.front().is_some_and(|&ts| ts <= cutoff) {
                events.pop_front();
            }
            !events.is_empty()
        });
        inner.tokens.retain(|_, window| window.reset_at_ms > now_ms);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, CounterError> {
        self.inner
            .lock()
            .map_err(|e| CounterError::Unavailable(format!("poisoned lock: {e}")))
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn slide_window(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        max: u32,
    ) -> Result<WindowReservation, CounterError> {
        let mut inner = self.lock()?;
        Self::maybe_compact(&mut inner, now_ms, window_ms);

        let events = inner.windows.entry(key.to_owned()).or_default();
        let cutoff = now_ms.saturating_sub(window_ms);
        while events.front().is_some_and(|&ts| ts <= cutoff) {
            events.pop_front();
        }

        let live = u32::try_from(events.len()).unwrap_or(u32::MAX);
        let admitted = live < max;
        if admitted {
            events.push_back(now_ms);
        }

        let reset_at_ms = events
            .front()
            .map_or(now_ms, |&oldest| oldest.saturating_add(window_ms));

        Ok(WindowReservation {
            admitted,
            current: if admitted { live + 1 } else { live },
            reset_at_ms,
        })
    }

    async fn charge_tokens(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        amount: u32,
        max: u32,
    ) -> Result<TokenCharge, CounterError> {
        let mut inner = self.lock()?;
        Self::maybe_compact(&mut inner, now_ms, window_ms);

        let window = inner.tokens.entry(key.to_owned()).or_default();
        if window.reset_at_ms <= now_ms {
            window.consumed = 0;
            window.reset_at_ms = now_ms.saturating_add(window_ms);
        }

        let admitted = window.consumed.saturating_add(amount) <= max;
        if admitted {
            window.consumed = window.consumed.saturating_add(amount);
        }

        Ok(TokenCharge {
            admitted,
            current: window.consumed,
            reset_at_ms: window.reset_at_ms,
        })
    }

    async fn health_check(&self) -> Result<(), CounterError> {
        self.lock().map(|_| ())
    }
}
