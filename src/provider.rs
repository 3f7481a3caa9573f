//! The **consumed** provider interface (`spec.md` §6) and the error
//! classifier that turns a provider's raw failure shape into the crate's
//! [`crate::error::ErrorCategory`] taxonomy (`spec.md` §4.3).
//!
//! This module deliberately contains no vendor wiring. `providers::openai_compatible`
//! is the one reference adapter that implements [`Provider`] against a real
//! wire protocol; anything else (Anthropic, a local llama.cpp server with a
//! different dialect, a mock used by tests) implements the same trait
//! without touching `agent_loop` or the middleware chain.

use crate::error::{ErrorCategory, ProviderErrorDetails};
use crate::event_bus::TokenUsage;
use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value;
use std::pin::Pin;

/// One piece of a provider's streaming response, granular enough that
/// [`crate::agent_loop::AgentLoop`] can forward each directly as an
/// [`crate::event_bus::Event`] without buffering (`spec.md` §4.8 step 2).
#[derive(Debug, Clone)]
pub enum ProviderChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { call_id: String, name: String },
    /// A fragment of a tool call's JSON arguments, as they stream in.
    ToolCallArgsDelta { call_id: String, delta: String },
    ToolCallEnd { call_id: String },
    /// Terminal chunk: generation is complete. `usage`, if the provider
    /// reports it, is forwarded on `AgentTurnFinished`.
    Finished { usage: Option<TokenUsage> },
}

/// A provider's streaming response: a sequence of [`ProviderChunk`]s, each
/// fallible with a classified [`ProviderErrorDetails`] rather than a bare
/// exception (`spec.md` §6: "plus an error channel conforming to the
/// classifier's input expectations").
pub type ProviderStream =
    Pin<Box<dyn Stream<Item = Result<ProviderChunk, ProviderErrorDetails>> + Send>>;

/// Whether the model is allowed, forbidden, or required to call a tool this
/// turn. `spec.md` §6 lists `toolMode` as one of the options a `chat` call
/// carries without enumerating its values; this mirrors the three-way
/// switch every OpenAI-compatible wire protocol in the pack actually
/// exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolMode {
    Auto,
    None,
    Required,
}

/// Per-call options a [`Provider`] needs (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Function schemas of the currently-visible tools, already filtered by
    /// [`crate::tools::ToolRegistry::snapshot_visible`].
    pub tools: Vec<Value>,
    pub tool_mode: ToolMode,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    /// The system prompt, including any container/skill text the
    /// `ContainerMiddleware` injected this iteration.
    pub instructions: Option<String>,
    pub response_format: Option<Value>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            tool_mode: ToolMode::Auto,
            temperature: 0.7,
            max_output_tokens: None,
            instructions: None,
            response_format: None,
        }
    }
}

/// The boundary the core depends on and never implements a concrete vendor
/// client for (`spec.md` §1 Non-goals, §6).
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(
        &self,
        messages: &[crate::types::Message],
        options: &ChatOptions,
    ) -> Result<ProviderStream, ProviderErrorDetails>;
}

/// Parses a provider exception into [`ProviderErrorDetails`].
///
/// `spec.md` §4.3 and §9 explicitly rule out reflection (there is none in
/// Rust to rule out) in favor of message/status-code parsing; each provider
/// adapter implements this trait with whatever wire-specific parsing it
/// needs and falls through to [`classify_generic`] on a miss.
pub trait ProviderErrorClassifier {
    fn classify(&self, status: Option<u16>, body: &str) -> ProviderErrorDetails;
}

/// Markers this crate recognizes across providers without any
/// provider-specific parsing having run first. Kept as a fallback, per
/// `spec.md` §4.3: "generic fallback used if parser yields none".
///
/// | HTTP status / signal | Category |
/// |---|---|
/// | 400 | `ClientError` (or `ContextWindow` if `body` contains `context_marker`) |
/// | 401/403 | `AuthError` |
/// | 404 | `ClientError` |
/// | 408, 503, 504, connection-reset | `Transient` |
/// | 429 + `insufficient_quota`-style marker | `RateLimitTerminal` |
/// | 429 otherwise | `RateLimitRetryable` |
/// | 5xx otherwise | `ServerError` |
/// | anything else | `Unknown` |
pub fn classify_generic(status: Option<u16>, body: &str, context_marker: &str) -> ProviderErrorDetails {
    let category = match status {
        Some(400) if body.contains(context_marker) => ErrorCategory::ContextWindow,
        Some(400) => ErrorCategory::ClientError,
        Some(401) | Some(403) => ErrorCategory::AuthError,
        Some(404) => ErrorCategory::ClientError,
        Some(408) | Some(503) | Some(504) => ErrorCategory::Transient,
        Some(429) if body.contains("insufficient_quota") || body.contains("quota_exceeded") => {
            ErrorCategory::RateLimitTerminal
        }
        Some(429) => ErrorCategory::RateLimitRetryable,
        Some(s) if (500..600).contains(&s) => ErrorCategory::ServerError,
        None if is_connection_reset(body) => ErrorCategory::Transient,
        _ => ErrorCategory::Unknown,
    };

    let mut details = ProviderErrorDetails::new(category, body.to_string());
    if let Some(s) = status {
        details = details.with_status(s);
    }
    details
}

/// Recognizes a connection-reset signal with no HTTP status attached (the
/// request never got a response at all), per `spec.md` §4.3's table, which
/// lists "connection-reset" alongside 408/503/504 under `Transient`.
fn is_connection_reset(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("connection reset")
        || lower.contains("connection was reset")
        || lower.contains("reset by peer")
        || lower.contains("econnreset")
}
