//! Conflict-aware retry for read-modify-write cycles against the
//! Kubernetes API (HTTP 409 on a stale resourceVersion).
//!
//! # Example
//!
//! ```ignore
//! use hoard_common::retry::retry_on_conflict;
//!
//! retry_on_conflict("persist_status", || async {
//!     let obj = api.get(name).await?;
//!     // ...mutate and write back carrying obj's resourceVersion...
//!     Ok(())
//! }).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::Error;

/// Backoff parameters for conflict retries.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts before the conflict is surfaced
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Bounded config tuned for optimistic-concurrency conflicts.
    ///
    /// Conflicts resolve quickly once the competing writer finishes, so the
    /// delays stay short and the attempt count is small.
    pub fn for_conflicts() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry a read-modify-write cycle while it fails with HTTP 409.
///
/// Every attempt must re-read the resource inside `operation` so the write
/// carries a fresh resourceVersion. Non-conflict errors are returned
/// immediately; only conflicts are retried, with short jittered backoff.
pub async fn retry_on_conflict<F, Fut, T>(operation_name: &str, mut operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let config = RetryConfig::for_conflicts();
    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && attempt < config.max_attempts => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = jittered_delay.as_millis(),
                    "Write conflict, retrying with fresh read"
                );
                tokio::time::sleep(jittered_delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
            Err(e) => {
                if e.is_conflict() {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        "Write conflict persisted after max retries"
                    );
                }
                return Err(e);
            }
        }
    }
    unreachable!("loop returns on the final attempt")
}
