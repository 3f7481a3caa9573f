//! Turns a failed tool invocation into the JSON value fed back to the model
//! as its function result (`spec.md` §4.5). Innermost of the three
//! `executeFunction`-hooking middlewares — by the time it runs, retry has
//! already exhausted every attempt, so its only job is choosing how much of
//! the failure to expose.

use crate::error::Error;
use serde_json::Value;

/// How much detail a formatted tool error exposes to the model. `spec.md`
/// §4.5 leaves the exact verbosity policy to the implementation; `Concise`
/// is the safer default for anything that might echo a stack trace or
/// internal path back into the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerbosity {
    /// Just the category and a short message.
    Concise,
    /// Category, message, and the error's `Debug` representation.
    Detailed,
}

pub struct ErrorFormattingMiddleware {
    verbosity: ErrorVerbosity,
}

impl ErrorFormattingMiddleware {
    pub fn new(verbosity: ErrorVerbosity) -> Self {
        Self { verbosity }
    }

    pub fn format(&self, err: &Error) -> Value {
        match self.verbosity {
            ErrorVerbosity::Concise => serde_json::json!({
                "error": true,
                "category": err.category().to_string(),
                "message": err.to_string(),
            }),
            ErrorVerbosity::Detailed => serde_json::json!({
                "error": true,
                "category": err.category().to_string(),
                "message": err.to_string(),
                "debug": format!("{err:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn concise_formatting_omits_debug_representation() {
        let middleware = ErrorFormattingMiddleware::new(ErrorVerbosity::Concise);
        let err = Error::tool_timeout("search", 5000);
        let formatted = middleware.format(&err);
        assert_eq!(formatted["error"], true);
        assert_eq!(formatted["category"], ErrorCategory::Transient.to_string());
        assert!(formatted.get("debug").is_none());
    }

    #[test]
    fn detailed_formatting_includes_debug_representation() {
        let middleware = ErrorFormattingMiddleware::new(ErrorVerbosity::Detailed);
        let err = Error::invalid_input("missing field 'city'");
        let formatted = middleware.format(&err);
        assert!(formatted.get("debug").is_some());
    }
}
