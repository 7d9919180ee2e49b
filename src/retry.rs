//! C3 — Retry Loop: bounded re-attempt of C2.acquire with a fixed
//! inter-attempt delay (spec §4.3). Sleeps are cooperative suspension
//! points, not busy-waits.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::lock::{LeaseToken, LockPrimitive};

/// Acquires a lease on `resource`, retrying up to `attempts` times with a
/// fixed `delay_ms` between tries. Surfaces `LockAcquisitionFailure` on
/// exhaustion — distinguishable from `InsufficientStock` by the caller.
pub async fn acquire_with_retry(
    lock: &Arc<dyn LockPrimitive>,
    resource: &str,
    ttl_seconds: u64,
    attempts: u32,
    delay_ms: u64,
) -> CoreResult<LeaseToken> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match lock.acquire(resource, ttl_seconds).await.map_err(CoreError::internal)? {
            Some(token) => {
                debug!(resource, attempt, "lease acquired via retry loop");
                return Ok(token);
            }
            None => {
                if attempt < attempts {
                    debug!(resource, attempt, attempts, "lease contended, retrying after delay");
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    warn!(resource, attempts, "lock acquisition exhausted all retry attempts");
    Err(CoreError::LockAcquisitionFailure {
        resource: resource.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::fake::FakeLock;

    #[tokio::test]
    async fn succeeds_immediately_when_uncontended() {
        let lock: Arc<dyn LockPrimitive> = Arc::new(FakeLock::default());
        let token = acquire_with_retry(&lock, "r1", 10, 3, 1).await.unwrap();
        lock.release("r1", &token).await.unwrap();
    }

    #[tokio::test]
    async fn exhausts_and_returns_lock_acquisition_failure() {
        let lock: Arc<dyn LockPrimitive> = Arc::new(FakeLock::default());
        let _held = lock.acquire("r1", 10).await.unwrap().unwrap();
        let result = acquire_with_retry(&lock, "r1", 10, 3, 1).await;
        assert!(matches!(result, Err(CoreError::LockAcquisitionFailure { .. })));
    }

    #[tokio::test]
    async fn succeeds_after_holder_releases_mid_retry() {
        let lock: Arc<dyn LockPrimitive> = Arc::new(FakeLock::default());
        let held = lock.acquire("r1", 10).await.unwrap().unwrap();

        let lock_clone = lock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            lock_clone.release("r1", &held).await.unwrap();
        });

        let token = acquire_with_retry(&lock, "r1", 10, 10, 10).await.unwrap();
        lock.release("r1", &token).await.unwrap();
    }
}
