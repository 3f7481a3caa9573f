//! Error taxonomy and crate-level error type.
//!
//! Two distinct error concerns live here:
//!
//! - [`ErrorCategory`] and [`ProviderErrorDetails`] — the classification
//!   taxonomy a [`crate::provider::ProviderErrorClassifier`] maps provider
//!   exceptions into. This is data, not `std::error::Error`: it drives retry
//!   and surfacing decisions in [`crate::middleware::retry::RetryMiddleware`]
//!   and [`crate::agent_loop::AgentLoop`].
//! - [`Error`] — the crate's own `thiserror`-derived error type, returned by
//!   fallible operations that aren't provider calls (session persistence,
//!   tool schema validation, configuration, and so on).

use std::time::Duration;

/// Coarse classification of a provider failure.
///
/// Produced by a [`crate::provider::ProviderErrorClassifier`] from whatever
/// shape of exception/response a concrete provider adapter raises. Nothing
/// downstream of the classifier ever matches on provider-specific status
/// codes or error strings again — only on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unrecognized failure shape. Retried conservatively up to the overall
    /// attempt cap, same as [`ErrorCategory::Transient`].
    Unknown,
    /// Network blip, connection reset, request timeout, 503/504. Retry with
    /// backoff.
    Transient,
    /// 429 without an `insufficient_quota`-style marker. Retry, honoring a
    /// server-provided delay when present.
    RateLimitRetryable,
    /// 429 with a quota-exhaustion marker. Surface to the user; never
    /// retried.
    RateLimitTerminal,
    /// 400/404-shaped request error. The request itself is malformed;
    /// retrying would reproduce the same failure.
    ClientError,
    /// 401/403. May trigger a one-shot credential refresh if the adapter is
    /// configured for one; otherwise terminal.
    AuthError,
    /// 400 whose message matches the provider's context-length marker. May
    /// trigger a one-shot [`crate::history::HistoryReducer`] pass and a
    /// single retry.
    ContextWindow,
    /// 5xx other than 503/504. Retry with backoff.
    ServerError,
}

impl ErrorCategory {
    /// Categories that must never be retried, regardless of attempt budget.
    ///
    /// Mirrors `GetRetryDelay`'s precedence rule #1: these four categories
    /// are non-retryable before anything else (server-hinted delay,
    /// backoff) is even considered.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorCategory::ClientError
                | ErrorCategory::AuthError
                | ErrorCategory::ContextWindow
                | ErrorCategory::RateLimitTerminal
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimitRetryable => "rate_limit_retryable",
            ErrorCategory::RateLimitTerminal => "rate_limit_terminal",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::ContextWindow => "context_window",
            ErrorCategory::ServerError => "server_error",
        };
        write!(f, "{s}")
    }
}

/// Structured detail extracted from a provider failure by a
/// [`crate::provider::ProviderErrorClassifier`].
///
/// Parsing is string/status-code based by design (`spec.md` §4.3 and §9
/// explicitly rule out reflection-based exception parsing, which has no
/// equivalent in Rust anyway). Provider adapters are expected to populate as
/// many fields as the wire response actually carries; everything else stays
/// `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderErrorDetails {
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    pub error_code: Option<String>,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub request_id: Option<String>,
}

impl ProviderErrorDetails {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            status_code: None,
            error_code: None,
            message: message.into(),
            retry_after: None,
            request_id: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error type for everything that isn't a classified provider
/// failure (those travel as [`ProviderErrorDetails`] instead, since a single
/// failed provider call is expected, structured, and often retried rather
/// than propagated as an exception).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session store error: {0}")]
    Store(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("branch not found: {0} / {1}")]
    BranchNotFound(String, String),

    #[error("branch {0} already has an active run")]
    BranchLocked(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{tool}' timed out after {elapsed_ms}ms")]
    ToolTimeout { tool: String, elapsed_ms: u64 },

    #[error("provider error ({category}): {message}")]
    Provider {
        category: ErrorCategory,
        message: String,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    pub fn tool_timeout(tool: impl Into<String>, elapsed_ms: u64) -> Self {
        Error::ToolTimeout {
            tool: tool.into(),
            elapsed_ms,
        }
    }

    pub fn provider(details: &ProviderErrorDetails) -> Self {
        Error::Provider {
            category: details.category,
            message: details.message.clone(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Classifies this error for [`crate::middleware::retry::RetryMiddleware`]'s
    /// purposes. A tool handler raises a plain [`Error`] rather than a
    /// [`ProviderErrorDetails`] (that type is reserved for the
    /// provider-call seam, classified by a
    /// [`crate::provider::ProviderErrorClassifier`] instead), so retryable
    /// tool-invocation failures need their own mapping into the same
    /// taxonomy. `Provider` errors carry their original category through
    /// unchanged; a timeout is `Transient` (worth retrying once more);
    /// everything else defaults to `Unknown`, retried conservatively per
    /// `spec.md` §7's description of that category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Provider { category, .. } => *category,
            Error::ToolTimeout { .. } => ErrorCategory::Transient,
            Error::InvalidInput(_) | Error::ToolNotFound(_) => ErrorCategory::ClientError,
            Error::Cancelled => ErrorCategory::ClientError,
            _ => ErrorCategory::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_categories() {
        assert!(ErrorCategory::Unknown.is_retryable());
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::RateLimitRetryable.is_retryable());
        assert!(ErrorCategory::ServerError.is_retryable());
    }

    #[test]
    fn non_retryable_categories() {
        assert!(!ErrorCategory::ClientError.is_retryable());
        assert!(!ErrorCategory::AuthError.is_retryable());
        assert!(!ErrorCategory::ContextWindow.is_retryable());
        assert!(!ErrorCategory::RateLimitTerminal.is_retryable());
    }

    #[test]
    fn provider_error_details_builder() {
        let details = ProviderErrorDetails::new(ErrorCategory::RateLimitRetryable, "slow down")
            .with_status(429)
            .with_error_code("rate_limited")
            .with_retry_after(Duration::from_secs(2))
            .with_request_id("req_123");

        assert_eq!(details.status_code, Some(429));
        assert_eq!(details.error_code.as_deref(), Some("rate_limited"));
        assert_eq!(details.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(details.request_id.as_deref(), Some("req_123"));
    }

    #[test]
    fn error_display_messages() {
        assert_eq!(Error::config("bad").to_string(), "configuration error: bad");
        assert_eq!(
            Error::tool_timeout("search", 5000).to_string(),
            "tool 'search' timed out after 5000ms"
        );
        assert_eq!(
            Error::BranchLocked("main".into()).to_string(),
            "branch main already has an active run"
        );
    }

    #[test]
    fn error_from_json() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
