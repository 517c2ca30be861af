//! Exponential backoff with jitter and a total wait budget.
//!
//! The resilient transport drives its own attempt loop and asks
//! [`next_delay`] how long to sleep; [`retry_async`] wraps the same policy
//! around an arbitrary async call and is used for identity-provider calls.

use nplbridge_types::config::RetrySettings;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one. Never below 1.
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound on the sum of all sleeps of one call.
    pub max_total_wait_ms: u64,
    /// Each sleep is stretched by up to this fraction of itself.
    pub jitter: f64,
}

impl RetryConfig {
    /// Policy for identity-provider token requests: three quick attempts.
    pub fn for_token_endpoint() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 500,
            max_delay_ms: 5_000,
            max_total_wait_ms: 15_000,
            jitter: 0.1,
        }
    }

    /// Un-jittered delay after the zero-based `attempt`.
    fn base_delay_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.min_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            min_delay_ms: settings.min_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            max_total_wait_ms: settings.max_total_wait_ms,
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Returned by [`retry_async`] when the call never succeeded.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error of the final attempt.
    pub error: E,
    pub attempts: u32,
}

/// Jittered delay after the zero-based `attempt`, capped at `max_delay_ms`.
pub fn backoff_ms(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.base_delay_ms(attempt);
    if config.jitter <= 0.0 || base == 0 {
        return base;
    }
    let stretch = base as f64 * config.jitter * jitter_fraction();
    (base + stretch as u64).min(config.max_delay_ms)
}

/// Sleep before retrying after the zero-based `attempt`, given `waited_ms`
/// already slept. `None` means the wait budget would be exceeded.
///
/// A server hint (`Retry-After`) replaces the computed backoff but is
/// still capped at `max_delay_ms`.
pub fn next_delay(
    config: &RetryConfig,
    attempt: u32,
    hint_ms: Option<u64>,
    waited_ms: u64,
) -> Option<u64> {
    let delay = hint_ms
        .map(|h| h.min(config.max_delay_ms))
        .unwrap_or_else(|| backoff_ms(config, attempt));
    let total = waited_ms.checked_add(delay)?;
    (total <= config.max_total_wait_ms).then_some(delay)
}

/// Run `call` until it succeeds, `is_transient` rejects its error, the
/// attempts run out or the wait budget is spent.
///
/// `hint` may extract a server-requested delay from an error.
pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    mut call: F,
    is_transient: impl Fn(&E) -> bool,
    hint: impl Fn(&E) -> Option<u64>,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut waited_ms = 0u64;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_transient(&error) || attempts >= max_attempts {
            return Err(Exhausted { error, attempts });
        }
        let Some(delay_ms) = next_delay(config, attempts - 1, hint(&error), waited_ms) else {
            return Err(Exhausted { error, attempts });
        };

        debug!(attempt = attempts, delay_ms, error = %error, "Retrying");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        waited_ms += delay_ms;
    }
}

/// Uniform-ish fraction in `[0, 1)` from the clock and a call counter.
///
/// Not for anything but spreading retries.
fn jitter_fraction() -> f64 {
    static CALLS: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    // splitmix64 finalizer
    let mut z = nanos ^ CALLS.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}
