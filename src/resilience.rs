// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry budget, apply throttling, copy bulkhead.
//!
//! - [`RetryConfig`]: Bounded exponential backoff for transient partition faults
//! - [`RateLimiter`]: Token bucket limiting rows applied per second
//! - [`Bulkhead`]: Semaphore limiting concurrent table copies across streams
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), keyspace_migrator::resilience::BulkheadFull> {
//! use keyspace_migrator::resilience::{RateLimiter, Bulkhead, RateLimitConfig};
//!
//! // Throttle: max 1000 rows/sec with burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire_many(25).await; // Blocks if over limit
//!
//! // Bulkhead: max 4 tables copying at once
//! let bulkhead = Bulkhead::new(4);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry budget for transient faults.
///
/// Once `max_attempts` consecutive attempts fail the stream goes to `Error`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// About a minute of retrying before giving up.
    ///
    /// ```text
    /// Attempt  Delay after failure
    /// -------  -------------------
    /// 1        100ms
    /// 2        200ms
    /// 3        400ms
    /// ...
    /// 9        25.6s
    /// 10       give up → Error
    /// ```
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Row throttle shared by copy and tail.
///
/// Every row written to a destination (bulk loaded or applied) costs one
/// token. Tokens refill at `refill_rate` per second up to `burst_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Rows that may be written back to back after an idle period.
    pub burst_size: u32,

    /// Sustained rows per second.
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 1000 rows/sec, bursts of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Destination write throttle, one per stream engine.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Wait until `n` rows may be written.
    ///
    /// Large requests are split into burst-sized chunks so a copy chunk
    /// bigger than the bucket still makes progress.
    pub async fn acquire_many(&self, n: u32) {
        let burst = self.config.burst_size.max(1);
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(burst);
            if let Some(nz) = NonZeroU32::new(chunk) {
                if self.limiter.until_n_ready(nz).await.is_err() {
                    // Chunk exceeds capacity; fall back to one at a time
                    for _ in 0..chunk {
                        self.limiter.until_ready().await;
                    }
                }
            }
            remaining -= chunk;
        }
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// The bulkhead semaphore was closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("copy bulkhead closed (max {max_concurrent} concurrent copies)")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits concurrent table copies.
///
/// The stream engine holds one permit per table being bulk-copied, so many
/// streams starting at once do not snapshot every source table in parallel.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Free copy slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_caps_at_max_without_overflow() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_budget_counts_first_attempt() {
        let config = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        };
        assert!(config.should_retry(1));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[tokio::test]
    async fn test_throttle_chunks_requests_larger_than_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 10,
            refill_rate: 1000,
        });

        let start = std::time::Instant::now();
        limiter.acquire_many(30).await;
        // 20 rows beyond the burst at 1000/s is ~20ms
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_throttle_zero_rows_returns_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 1,
        });
        limiter.acquire_many(0).await;
        limiter.acquire_many(1).await;
    }

    #[tokio::test]
    async fn test_bulkhead_limits_concurrent_copies() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let permit = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.available(), 0);

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                let _p = bulkhead.acquire().await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bulkhead.available(), 1);
    }
}
