//! Bounded retry for statements that lose the SQLite write lock.
//!
//! Every connection already waits `busy_timeout` inside SQLite before giving
//! up with `SQLITE_BUSY`. This layer retries the whole operation a few more
//! times with a doubling pause, then reports [`MemoryError::Contention`].

use esquire_core::error::MemoryError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// SQLITE_BUSY and SQLITE_LOCKED primary result codes.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Pause before the second attempt; doubles afterwards
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Whether an error means another connection held the lock.
pub fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            // Extended codes keep the primary code in the low byte.
            let primary = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Run `op` until it succeeds, fails with a non-contention error, or the
/// policy runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, MemoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.backoff;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_contention(&e) && attempt < attempts => {
                warn!(attempt, label, "SQLite busy, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) if is_contention(&e) => {
                return Err(MemoryError::Contention {
                    attempts,
                    reason: format!("{label}: {e}"),
                });
            }
            Err(e) => return Err(MemoryError::Storage(format!("{label}: {e}"))),
        }
    }
}
