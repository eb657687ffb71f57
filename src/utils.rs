// ABOUTME: Small shared utilities: injectable clock and timestamp formatting
// ABOUTME: Keeps wall-clock access behind a trait so recency windows are testable
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

/// Injectable time source.
///
/// Summarisation recency windows, session TTL sweeps, and rate-limit windows
/// all depend on wall-clock time; tests substitute a fixed clock.
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Current instant as Unix epoch milliseconds
    fn now_epoch_ms(&self) -> u64 {
        u64::try_from(self.now().timestamp_millis()).unwrap_or(0)
    }
}

/// Production clock backed by `Utc::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle used across components
pub type SharedClock = Arc<dyn Clock>;

/// Format a timestamp for storage: RFC3339 with millisecond precision, UTC.
///
/// Millisecond precision with a fixed `Z` suffix keeps lexicographic and
/// chronological order identical, which the message ordering index relies on.
#[must_use]
pub fn to_storage_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back into a `DateTime<Utc>`
#[must_use]
pub fn from_storage_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_storage_timestamp_round_trip() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
            + chrono::Duration::milliseconds(535);
        let stored = to_storage_timestamp(dt);
        assert!(stored.ends_with('Z'));
        assert_eq!(from_storage_timestamp(&stored), Some(dt));
    }

    #[test]
    fn test_storage_timestamps_sort_lexicographically() {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let earlier = to_storage_timestamp(base);
        let later = to_storage_timestamp(base + chrono::Duration::milliseconds(7));
        assert!(earlier < later);
    }
}
