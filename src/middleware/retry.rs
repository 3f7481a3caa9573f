//! Wraps one tool invocation with exponential backoff retry (`spec.md` §4.5,
//! §4.3). Outermost of the three `executeFunction`-hooking middlewares: it
//! owns the attempt loop and everything inside it (timeout, then the actual
//! call) is just "the thing being retried".

use crate::error::{Error, ErrorCategory, ProviderErrorDetails, Result};
use crate::event_bus::{Event, EventBus};
use crate::retry::{RetryConfig, RetryDecision, get_retry_delay};
use serde_json::Value;
use std::future::Future;

/// Maps a tool-invocation [`Error`] into the same [`ProviderErrorDetails`]
/// shape [`get_retry_delay`] expects, so retry math stays in one place
/// regardless of whether the failure came from a provider call or a tool
/// handler.
fn details_from_error(err: &Error) -> ProviderErrorDetails {
    ProviderErrorDetails::new(err.category(), err.to_string())
}

pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `f` up to `config.max_attempts` times, emitting
    /// [`Event::FunctionRetry`] before each wait and honoring
    /// [`get_retry_delay`]'s precedence (non-retryable categories abort
    /// immediately; a server-provided `retry_after` is used verbatim;
    /// otherwise jittered backoff).
    pub async fn run<F, Fut>(&self, call_id: &str, bus: &EventBus, f: F) -> Result<Value>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let details = details_from_error(&err);
                    if attempt + 1 >= self.config.max_attempts {
                        log::warn!(
                            "call {call_id} exhausted {} attempts, last error: {err}",
                            self.config.max_attempts
                        );
                        return Err(err);
                    }
                    match get_retry_delay(&details, attempt, &self.config) {
                        RetryDecision::NonRetryable => {
                            log::debug!("call {call_id} failed with non-retryable category {:?}, not retrying", details.category);
                            return Err(err);
                        }
                        RetryDecision::RetryAfter(delay) => {
                            log::debug!(
                                "call {call_id} attempt {} failed ({:?}), retrying in {}ms",
                                attempt + 1,
                                details.category,
                                delay.as_millis()
                            );
                            bus.emit(Event::FunctionRetry {
                                call_id: call_id.to_string(),
                                attempt: attempt + 1,
                                max_attempts: self.config.max_attempts,
                                delay_ms: delay.as_millis() as u64,
                                category: details.category,
                            });
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }
}

/// Whether the crate's own [`Error`] type, raised by a tool handler, would be
/// retried under this chain's configuration. Exposed for tests and for
/// [`super::error_formatting::ErrorFormattingMiddleware`] verbosity decisions
/// that want to mention whether a failure was already retried to exhaustion.
pub fn would_retry(err: &Error, config: &RetryConfig) -> bool {
    let details = details_from_error(err);
    !matches!(get_retry_delay(&details, 0, config), RetryDecision::NonRetryable)
        || details.category == ErrorCategory::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter_factor(0.0)
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let middleware = RetryMiddleware::new(fast_config(3));
        let bus = EventBus::new(16);
        let calls = AtomicU32::new(0);

        let result = middleware
            .run("call-1", &bus, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(serde_json::json!("ok")) }
            })
            .await;

        assert_eq!(result.unwrap(), serde_json::json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_up_to_the_attempt_cap() {
        let middleware = RetryMiddleware::new(fast_config(3));
        let bus = EventBus::new(16);
        let calls = AtomicU32::new(0);

        let result = middleware
            .run("call-2", &bus, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Value, _>(Error::Provider {
                        category: ErrorCategory::Transient,
                        message: "boom".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_category_fails_on_the_first_attempt() {
        let middleware = RetryMiddleware::new(fast_config(5));
        let bus = EventBus::new(16);
        let calls = AtomicU32::new(0);

        let result = middleware
            .run("call-3", &bus, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Value, _>(Error::Provider {
                        category: ErrorCategory::ClientError,
                        message: "bad request".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn emits_function_retry_event_before_each_wait() {
        let middleware = RetryMiddleware::new(fast_config(3));
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();

        let _ = middleware
            .run("call-4", &bus, || async {
                Err::<Value, _>(Error::Provider {
                    category: ErrorCategory::ServerError,
                    message: "down".into(),
                })
            })
            .await;

        let mut retry_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::FunctionRetry { .. }) {
                retry_events += 1;
            }
        }
        assert_eq!(retry_events, 2);
    }
}
