//! Ambient runtime configuration, resolved with the teacher's
//! `get_base_url`/`get_model` precedence rule: explicit value > environment
//! variable > built-in default.
//!
//! Covers the knobs `spec.md` leaves to the embedder rather than pinning as
//! wire-level constants: where branches are persisted, how many agentic
//! iterations/consecutive errors are tolerated before the run gives up, the
//! per-tool timeout, and the default [`RetryConfig`]/[`HistoryReductionConfig`].
//! Log verbosity itself is left to the consumer's own `env_logger`/`log`
//! initialization, per `SPEC_FULL.md` §B — this module only reads, never
//! installs, a logger.

use crate::history::HistoryReductionConfig;
use crate::retry::RetryConfig;
use std::env;
use std::time::Duration;

const STORE_ROOT_ENV: &str = "AGENT_RUNTIME_STORE_ROOT";
const MAX_ITERATIONS_ENV: &str = "AGENT_RUNTIME_MAX_ITERATIONS";
const MAX_CONSECUTIVE_ERRORS_ENV: &str = "AGENT_RUNTIME_MAX_CONSECUTIVE_ERRORS";
const TOOL_TIMEOUT_MS_ENV: &str = "AGENT_RUNTIME_TOOL_TIMEOUT_MS";

const DEFAULT_STORE_ROOT: &str = "./agent-runtime-sessions";
const DEFAULT_MAX_ITERATIONS: u32 = 50;
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;
const DEFAULT_TOOL_TIMEOUT_MS: u64 = 120_000;

/// Process-wide defaults for running [`crate::agent_loop::AgentLoop`]s and
/// persisting [`crate::session::Branch`]es, resolved once at startup and
/// threaded into per-run [`crate::agent_loop::AgentLoopConfig`] values.
///
/// Every field has a built-in default; every field can be overridden by an
/// environment variable; callers needing an explicit value (e.g. a CLI flag)
/// should set the field directly after calling [`RuntimeConfig::from_env`]
/// rather than going through the environment, matching the teacher's
/// explicit-wins-over-env-wins-over-default ladder.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory a [`crate::session::JsonFileSessionStore`] writes
    /// `<sessionId>/session.json` and `<sessionId>/branches/<branchId>.json`
    /// under.
    pub store_root: String,
    pub max_agentic_iterations: u32,
    pub max_consecutive_errors: u32,
    pub tool_timeout: Duration,
    pub retry: RetryConfig,
    pub history_reduction: HistoryReductionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_root: DEFAULT_STORE_ROOT.to_string(),
            max_agentic_iterations: DEFAULT_MAX_ITERATIONS,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            tool_timeout: Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS),
            retry: RetryConfig::default(),
            history_reduction: HistoryReductionConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Builds a config from built-in defaults overridden by environment
    /// variables (`AGENT_RUNTIME_STORE_ROOT`, `AGENT_RUNTIME_MAX_ITERATIONS`,
    /// `AGENT_RUNTIME_MAX_CONSECUTIVE_ERRORS`, `AGENT_RUNTIME_TOOL_TIMEOUT_MS`).
    /// A malformed numeric env var is logged and ignored rather than
    /// panicking, falling back to the built-in default for that field.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let store_root = env::var(STORE_ROOT_ENV).unwrap_or(defaults.store_root);

        let max_agentic_iterations = env::var(MAX_ITERATIONS_ENV)
            .ok()
            .and_then(|v| match v.parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    log::warn!("{MAX_ITERATIONS_ENV} is not a valid u32, ignoring: {v}");
                    None
                }
            })
            .unwrap_or(defaults.max_agentic_iterations);

        let max_consecutive_errors = env::var(MAX_CONSECUTIVE_ERRORS_ENV)
            .ok()
            .and_then(|v| match v.parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    log::warn!("{MAX_CONSECUTIVE_ERRORS_ENV} is not a valid u32, ignoring: {v}");
                    None
                }
            })
            .unwrap_or(defaults.max_consecutive_errors);

        let tool_timeout = env::var(TOOL_TIMEOUT_MS_ENV)
            .ok()
            .and_then(|v| match v.parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    log::warn!("{TOOL_TIMEOUT_MS_ENV} is not a valid u64, ignoring: {v}");
                    None
                }
            })
            .unwrap_or(defaults.tool_timeout);

        Self {
            store_root,
            max_agentic_iterations,
            max_consecutive_errors,
            tool_timeout,
            retry: defaults.retry,
            history_reduction: defaults.history_reduction,
        }
    }

    /// Builds an [`crate::agent_loop::AgentLoopConfig`] for one run, carrying
    /// this config's defaults plus the per-run overrides that only make
    /// sense at invocation time.
    pub fn to_agent_loop_config(
        &self,
        instructions: Option<String>,
        tool_mode: crate::provider::ToolMode,
        temperature: f32,
    ) -> crate::agent_loop::AgentLoopConfig {
        crate::agent_loop::AgentLoopConfig {
            max_agentic_iterations: self.max_agentic_iterations,
            max_consecutive_errors: self.max_consecutive_errors,
            instructions,
            tool_mode,
            temperature,
            max_output_tokens: None,
            retry: self.retry.clone(),
            tool_timeout: self.tool_timeout,
            history_reduction: self.history_reduction.clone(),
        }
    }
}
