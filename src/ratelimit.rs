//! Rate-limit window arithmetic and the per-credential concurrency guard.
//!
//! The minute/day counters themselves live in each credential's usage
//! stats and are mutated under the credential store's write lock, so the
//! check and the increment are one critical section. This module only owns
//! the window math and the semaphore table.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Days of per-day usage buckets retained before opportunistic pruning.
pub const USAGE_RETENTION_DAYS: i64 = 30;

/// Minute bucket key: floor(unix seconds / 60).
pub fn minute_epoch(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}

/// Day bucket key, `YYYY-MM-DD`.
pub fn day_key(now: DateTime<Utc>) -> String {
    now.date_naive().to_string()
}

/// Oldest day key still retained at `now`.
pub fn retention_cutoff(now: DateTime<Utc>) -> String {
    day_key(now - chrono::Duration::days(USAGE_RETENTION_DAYS))
}

/// Seconds until the current minute window rolls over; used as the
/// retry-after hint on 429 responses.
pub fn seconds_to_next_minute(now: DateTime<Utc>) -> u64 {
    (60 - now.timestamp().rem_euclid(60)) as u64
}

/// Bounds in-flight executions per credential. Callers that would exceed
/// the tier's `max_concurrent` fail immediately instead of queuing.
#[derive(Default)]
pub struct ConcurrencyGuard {
    permits: DashMap<String, Arc<Semaphore>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self {
            permits: DashMap::new(),
        }
    }

    pub fn acquire(
        &self,
        credential_id: &str,
        max_concurrent: u32,
    ) -> Result<OwnedSemaphorePermit, GatewayError> {
        let semaphore = self
            .permits
            .entry(credential_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max_concurrent as usize)))
            .clone();
        match semaphore.try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => Err(GatewayError::ConcurrencyExceeded),
            Err(TryAcquireError::Closed) => {
                Err(GatewayError::Internal("concurrency guard closed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_keys() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 45).unwrap();
        assert_eq!(minute_epoch(t), t.timestamp() / 60);
        assert_eq!(day_key(t), "2025-06-01");
        assert_eq!(retention_cutoff(t), "2025-05-02");
        assert_eq!(seconds_to_next_minute(t), 15);
    }

    #[test]
    fn minute_epoch_changes_at_boundary() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 59).unwrap();
        let next = t + chrono::Duration::seconds(1);
        assert_eq!(minute_epoch(next), minute_epoch(t) + 1);
    }

    #[test]
    fn concurrency_guard_caps_permits() {
        let guard = ConcurrencyGuard::new();
        let a = guard.acquire("wh_1", 2).unwrap();
        let _b = guard.acquire("wh_1", 2).unwrap();
        assert!(matches!(
            guard.acquire("wh_1", 2),
            Err(GatewayError::ConcurrencyExceeded)
        ));

        // Other credentials are unaffected.
        let _c = guard.acquire("wh_2", 1).unwrap();

        // Releasing a permit frees a slot.
        drop(a);
        assert!(guard.acquire("wh_1", 2).is_ok());
    }
}
