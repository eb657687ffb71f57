// ABOUTME: Redis counter store for multi-instance rate limit sharing
// ABOUTME: Sorted-set sliding windows and TTL-bounded token counters over ConnectionManager
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{CounterError, CounterStore, TokenCharge, WindowReservation};

/// Namespace prefix for every limiter key
const KEY_PREFIX: &str = "quill:rl:";

/// Redis-backed counter store.
///
/// Request windows are sorted sets scored by event timestamp
/// (trim / count / add); token windows are plain counters with a TTL.
/// `ConnectionManager` reconnects automatically; any command failure
/// surfaces as [`CounterError::Unavailable`] and the limiter falls back.
#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created or the initial
    /// connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CounterError> {
        tracing::info!("Connecting to counter store at {}", redis_url);

        let client = redis::Client::open(redis_url)
            .map_err(|e| CounterError::Unavailable(format!("invalid redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CounterError::Unavailable(format!("redis connect failed: {e}")))?;

        tracing::info!("Counter store connected");
        Ok(Self { manager })
    }

    fn window_key(key: &str) -> String {
        format!("{KEY_PREFIX}w:{key}")
    }

    fn token_key(key: &str) -> String {
        format!("{KEY_PREFIX}t:{key}")
    }

    fn unavailable(e: &redis::RedisError) -> CounterError {
        CounterError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn slide_window(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        max: u32,
    ) -> Result<WindowReservation, CounterError> {
        let redis_key = Self::window_key(key);
        let cutoff = now_ms.saturating_sub(window_ms);
        let mut conn = self.manager.clone();

        // Trim expired entries and count the remainder atomically
        let (_, live, oldest): (i64, u32, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&redis_key)
            .arg(0)
            .arg(cutoff)
            .cmd("ZCARD")
            .arg(&redis_key)
            .cmd("ZRANGEBYSCORE")
            .arg(&redis_key)
            .arg("-inf")
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::unavailable(&e))?;

        let admitted = live < max;
        if admitted {
            // Members must be unique per event; the score carries the time
            let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
            let () = redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(&redis_key)
                .arg(now_ms)
                .arg(member)
                .ignore()
                .cmd("PEXPIRE")
                .arg(&redis_key)
                .arg(window_ms)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::unavailable(&e))?;
        }

        let oldest_score = oldest
            .get(1)
            .and_then(|score| score.parse::<u64>().ok())
            .unwrap_or(now_ms);
        let reset_at_ms = oldest_score.saturating_add(window_ms);

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
        let redis_key = Self::token_key(key);
        let mut conn = self.manager.clone();

        let consumed: Option<u32> = conn
            .get(&redis_key)
            .await
            .map_err(|e| Self::unavailable(&e))?;
        let consumed = consumed.unwrap_or(0);

        let admitted = consumed.saturating_add(amount) <= max;
        if admitted {
            let () = redis::pipe()
                .atomic()
                .cmd("INCRBY")
                .arg(&redis_key)
                .arg(amount)
                .ignore()
                // NX keeps the original window deadline on later charges
                .cmd("PEXPIRE")
                .arg(&redis_key)
                .arg(window_ms)
                .arg("NX")
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::unavailable(&e))?;
        }

        let ttl_ms: i64 = conn
            .pttl(&redis_key)
            .await
            .map_err(|e| Self::unavailable(&e))?;
        let reset_at_ms = if ttl_ms > 0 {
            now_ms.saturating_add(u64::try_from(ttl_ms).unwrap_or(window_ms))
        } else {
            now_ms.saturating_add(window_ms)
        };

        Ok(TokenCharge {
            admitted,
            current: if admitted {
                consumed.saturating_add(amount)
            } else {
                consumed
            },
            reset_at_ms,
        })
    }

    async fn health_check(&self) -> Result<(), CounterError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::unavailable(&e))?;
        Ok(())
    }
}
