//! Bounds one tool invocation's wall-clock time (`spec.md` §4.5). Sits
//! directly inside [`super::retry::RetryMiddleware`]: a timeout is just
//! another retryable failure (category [`crate::error::ErrorCategory::Transient`]),
//! so `RetryMiddleware` doesn't need to know timeouts exist as a distinct
//! concept.

use crate::error::{Error, Result};
use crate::tools::Tool;
use serde_json::Value;
use std::time::Duration;

pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `tool`'s handler, converting an elapsed deadline into
    /// [`Error::ToolTimeout`] rather than letting it surface as a bare
    /// `tokio::time::error::Elapsed`.
    pub async fn run(&self, tool: &Tool, arguments: Value) -> Result<Value> {
        match tokio::time::timeout(self.timeout, tool.execute(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(Error::tool_timeout(tool.name(), self.timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn completes_normally_when_under_the_deadline() {
        let middleware = TimeoutMiddleware::new(Duration::from_millis(50));
        let tool = Tool::new("fast", "returns immediately", json!({}), |_| async {
            Ok(json!("done"))
        });
        let result = middleware.run(&tool, json!({})).await.unwrap();
        assert_eq!(result, json!("done"));
    }

    #[tokio::test]
    async fn times_out_a_slow_handler() {
        let middleware = TimeoutMiddleware::new(Duration::from_millis(5));
        let tool = Tool::new("slow", "sleeps past the deadline", json!({}), |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("too late"))
        });
        let result = middleware.run(&tool, json!({})).await;
        assert!(matches!(result, Err(Error::ToolTimeout { .. })));
    }
}
