//! # Agent Runtime
//!
//! An execution runtime for LLM agents: an iterate-until-done agent loop, a
//! middleware pipeline around tool execution, a bidirectional event bus for
//! permission/clarification/continuation/client-tool round trips, and a
//! session/branch model supporting ChatGPT-style regenerate and sibling
//! navigation.
//!
//! This crate has no concrete vendor SDK inside its core: [`provider::Provider`]
//! is the boundary every LLM backend implements, and
//! [`providers::openai_compatible`] is the one reference adapter carried
//! along to exercise that boundary end to end.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use agent_runtime::{AgentLoop, AgentLoopConfig, CancellationToken, EventBus, MiddlewareChain};
//! use agent_runtime::providers::openai_compatible::{OpenAiCompatibleConfig, OpenAiCompatibleProvider};
//! use agent_runtime::session::{Branch, SessionManager, InMemorySessionStore};
//! use agent_runtime::tools::ToolRegistry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(OpenAiCompatibleProvider::new(OpenAiCompatibleConfig {
//!         base_url: "http://localhost:11434/v1".into(),
//!         model: "qwen2.5-32b-instruct".into(),
//!         api_key: String::new(),
//!         request_timeout: Duration::from_secs(120),
//!     }));
//!
//!     let chain = MiddlewareChain::new(
//!         Default::default(),
//!         Duration::from_secs(30),
//!         Default::default(),
//!         Default::default(),
//!     );
//!     let agent_loop = AgentLoop::new(provider, chain);
//!
//!     let manager = SessionManager::new(Arc::new(InMemorySessionStore::new()));
//!     manager.create_session("s1", 0).await?;
//!     let mut branch = manager.load("s1", "main").await?;
//!     branch.messages.push(agent_runtime::types::Message::user("hello!"));
//!
//!     let bus = EventBus::new(256);
//!     let registry = ToolRegistry::new();
//!     let config = AgentLoopConfig::default();
//!     let cancel = CancellationToken::new();
//!
//!     agent_loop.run(&mut branch, &registry, &bus, &config, &cancel).await?;
//!     manager.persist_branch(&branch).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module map
//!
//! - [`error`] — the `ErrorCategory` taxonomy and the crate's `Error` type.
//! - [`retry`] — exponential backoff with jitter, reusable outside the
//!   middleware chain.
//! - [`provider`] — the consumed `Provider` trait and streaming chunk types.
//! - [`providers`] — concrete `Provider` adapters (`openai_compatible`).
//! - [`types`] — `Message`/`ContentItem`, the conversational data model.
//! - [`tools`] — `Tool`/`ToolBuilder`/`ToolRegistry`, including
//!   container/skill visibility.
//! - [`event_bus`] — the bidirectional, correlation-id-addressed event
//!   channel.
//! - [`permission`] — the permission cache backing `PermissionMiddleware`.
//! - [`history`] — token-budget-aware history compaction.
//! - [`middleware`] — the six standard middlewares and their chain.
//! - [`session`] — `Session`/`Branch`/`SessionStore`/`SessionManager`.
//! - [`agent_loop`] — the per-turn agent state machine.
//! - [`config`] — process-wide `RuntimeConfig`, env-driven.

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod history;
pub mod middleware;
pub mod permission;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod session;
pub mod tools;
pub mod types;

pub use agent_loop::{AgentLoop, AgentLoopConfig, CancellationToken};
pub use config::RuntimeConfig;
pub use error::{Error, ErrorCategory, ProviderErrorDetails, Result};
pub use event_bus::{Event, EventBus, PermissionChoice, TerminationReason, TokenUsage};
pub use history::{HistoryReductionConfig, Reduction, is_approaching_limit};
pub use middleware::MiddlewareChain;
pub use permission::PermissionBroker;
pub use provider::{ChatOptions, Provider, ProviderChunk, ProviderStream, ToolMode};
pub use retry::RetryConfig;
pub use session::{Branch, ExecutionState, Session, SessionManager, SessionStore};
pub use tools::{Tool, ToolBuilder, ToolRegistry, tool};
pub use types::{ContentItem, Message, MessageRole};

/// Convenience re-exports for the common case: one `use agent_runtime::prelude::*;`
/// pulls in everything needed to build a provider, register tools, and drive
/// an [`AgentLoop`] against a [`SessionManager`]-owned branch.
pub mod prelude {
    pub use crate::{
        AgentLoop, AgentLoopConfig, Branch, CancellationToken, ChatOptions, ContentItem, Error,
        Event, EventBus, ExecutionState, Message, MessageRole, MiddlewareChain, Provider,
        ProviderChunk, Result, RuntimeConfig, Session, SessionManager, SessionStore, Tool,
        ToolBuilder, ToolMode, ToolRegistry, tool,
    };
}
