//! Exponential backoff with jitter.
//!
//! Used by [`crate::middleware::retry::RetryMiddleware`] to turn a
//! [`crate::error::ProviderErrorDetails`] into a wait duration, and exposed
//! publicly so callers with their own retry loops (e.g. session-store
//! writers) can reuse the same policy instead of hand-rolling backoff math.

use crate::error::{ErrorCategory, ProviderErrorDetails};
use std::time::Duration;

/// Configuration for exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first. `3` means up to two
    /// retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling applied to the computed delay before jitter.
    pub max_delay: Duration,
    /// Multiplier applied per attempt: `initial_delay * multiplier^attempt`.
    pub backoff_multiplier: f64,
    /// Uniform jitter fraction applied symmetrically, e.g. `0.1` → ±10%.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_delay(mut self, d: Duration) -> Self {
        self.initial_delay = d;
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }

    pub fn jitter_factor(mut self, j: f64) -> Self {
        self.jitter_factor = j;
        self
    }

    /// Computes the jittered delay for a given zero-indexed attempt number,
    /// without consulting any server-provided hint. See [`get_retry_delay`]
    /// for the full precedence chain including `retry_after`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter_range = capped * self.jitter_factor;
        // ±jitter_factor uniform around `capped`.
        let jittered = capped + (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// A retry decision, mirroring `spec.md` §4.3's `GetRetryDelay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Wait this long, then retry.
    RetryAfter(Duration),
    /// Do not retry; the category is non-retryable.
    NonRetryable,
}

/// Implements `GetRetryDelay(details, attempt, config)` precedence exactly
/// as specified:
///
/// 1. Non-retryable categories short-circuit to [`RetryDecision::NonRetryable`].
/// 2. A server-provided `retry_after` is used verbatim (no jitter — the
///    server already told us the right number).
/// 3. Otherwise exponential backoff capped at `max_delay`, jittered ±10%
///    (or whatever `jitter_factor` is configured to).
pub fn get_retry_delay(
    details: &ProviderErrorDetails,
    attempt: u32,
    config: &RetryConfig,
) -> RetryDecision {
    if !details.category.is_retryable() {
        return RetryDecision::NonRetryable;
    }
    if let Some(delay) = details.retry_after {
        return RetryDecision::RetryAfter(delay);
    }
    RetryDecision::RetryAfter(config.backoff_delay(attempt))
}

/// Whether a category should ever be attempted again, independent of the
/// current attempt count. A thin convenience over [`ErrorCategory::is_retryable`]
/// kept here so call sites that only have a category (not full details)
/// don't need to import `error` separately.
pub fn is_retryable_category(category: ErrorCategory) -> bool {
    category.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(category: ErrorCategory) -> ProviderErrorDetails {
        ProviderErrorDetails::new(category, "boom")
    }

    #[test]
    fn retry_config_builder() {
        let config = RetryConfig::new()
            .max_attempts(5)
            .initial_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(30))
            .backoff_multiplier(1.5)
            .jitter_factor(0.2);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.jitter_factor, 0.2);
    }

    #[test]
    fn non_retryable_categories_never_retry() {
        let config = RetryConfig::default();
        for category in [
            ErrorCategory::ClientError,
            ErrorCategory::AuthError,
            ErrorCategory::ContextWindow,
            ErrorCategory::RateLimitTerminal,
        ] {
            let decision = get_retry_delay(&details(category), 0, &config);
            assert_eq!(decision, RetryDecision::NonRetryable);
        }
    }

    #[test]
    fn server_retry_after_used_verbatim() {
        let config = RetryConfig::default();
        let d = details(ErrorCategory::RateLimitRetryable).with_retry_after(Duration::from_secs(7));
        match get_retry_delay(&d, 0, &config) {
            RetryDecision::RetryAfter(delay) => assert_eq!(delay, Duration::from_secs(7)),
            RetryDecision::NonRetryable => panic!("expected retry"),
        }
    }

    #[test]
    fn backoff_grows_with_attempt_and_is_capped() {
        let config = RetryConfig::default()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(10))
            .backoff_multiplier(2.0)
            .jitter_factor(0.0);

        let d0 = details(ErrorCategory::Transient);
        let attempt0 = match get_retry_delay(&d0, 0, &config) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        let attempt3 = match get_retry_delay(&d0, 3, &config) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        assert_eq!(attempt0, Duration::from_secs(1));
        // 1 * 2^3 = 8, under the 10s cap.
        assert_eq!(attempt3, Duration::from_secs(8));

        let attempt10 = match get_retry_delay(&d0, 10, &config) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        assert_eq!(attempt10, Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let config = RetryConfig::default()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(10))
            .backoff_multiplier(1.0)
            .jitter_factor(0.1);
        let d0 = details(ErrorCategory::ServerError);

        for _ in 0..50 {
            match get_retry_delay(&d0, 0, &config) {
                RetryDecision::RetryAfter(delay) => {
                    let secs = delay.as_secs_f64();
                    assert!(secs >= 9.0 && secs <= 11.0, "delay {secs} out of jitter bound");
                }
                RetryDecision::NonRetryable => panic!("expected retry"),
            }
        }
    }

    #[test]
    fn is_retryable_category_matches_error_category() {
        assert!(is_retryable_category(ErrorCategory::Transient));
        assert!(!is_retryable_category(ErrorCategory::ClientError));
    }
}
