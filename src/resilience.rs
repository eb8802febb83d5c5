//! Resilience utilities: retry logic, backoff, rate limiting.
//!
//! - [`RetryConfig`]: Exponential backoff for transient failures
//! - [`retry_with_backoff`]: Drives an async operation until it succeeds,
//!   the attempt budget runs out, or shutdown is signalled
//! - [`RateLimiter`]: Token bucket for upstream detail requests
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> catalog_pipeline::Result<()> {
//! use catalog_pipeline::resilience::{retry_with_backoff, RetryConfig};
//! use tokio::sync::watch;
//!
//! let (_tx, shutdown) = watch::channel(false);
//! let value = retry_with_backoff(&RetryConfig::broker(), "dial", &shutdown, || async {
//!     Ok::<_, catalog_pipeline::PipelineError>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{PipelineError, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Broker reconnect policy: never gives up, only slows down.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        5s
    /// 2        10s
    /// 3        20s
    /// 4        40s
    /// ...
    /// 7+       300s (cap), retry forever
    /// ```
    pub fn broker() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Infinite retry for in-process resources that recover quickly
    /// (channel reopen after its connection is back).
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Cap the exponent; the result is clamped to max_delay anyway
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Run `operation` until it succeeds, with exponential backoff between attempts.
///
/// Each attempt is bounded by `config.connection_timeout`. Gives up after
/// `config.max_attempts` (returning the last error) or as soon as `shutdown`
/// flips to `true` (returning [`PipelineError::Shutdown`]).
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    shutdown: &watch::Receiver<bool>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut shutdown = shutdown.clone();
    let mut attempt: usize = 0;

    loop {
        if *shutdown.borrow() {
            return Err(PipelineError::Shutdown);
        }

        attempt = attempt.saturating_add(1);

        let err = match timeout(config.connection_timeout, operation()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_) => PipelineError::broker_msg(
                operation_name,
                format!("timed out after {}ms", config.connection_timeout.as_millis()),
            ),
        };

        if attempt >= config.max_attempts {
            warn!(operation = operation_name, attempt, error = %err, "Giving up after max attempts");
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Err(PipelineError::Shutdown);
                }
            }
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each operation consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 10 requests/sec with burst of 5.
    fn default() -> Self {
        Self {
            burst_size: 5,
            refill_rate: 10,
        }
    }
}

impl RateLimitConfig {
    /// No rate limiting (unlimited).
    pub fn unlimited() -> Self {
        Self {
            burst_size: u32::MAX,
            refill_rate: u32::MAX,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: DefaultDirectRateLimiter,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, waiting until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}
