//! The middleware pipeline (`spec.md` §4.5).
//!
//! No teacher equivalent as a pipeline — the teacher's closest analogue is
//! `hooks.rs`'s `Hooks` struct, which runs a `Vec` of handlers in
//! registration order and returns the first non-`None` decision. That
//! "concrete struct holding concrete handler vectors, no trait-object
//! dyn-dispatch ceremony" shape is kept here: `spec.md` names a *closed* set
//! of six standard middlewares with a fixed canonical order, so
//! [`MiddlewareChain`] is a concrete struct composing six concrete
//! middleware types rather than a generic onion of `dyn Middleware` trait
//! objects. Only `RetryMiddleware`, `TimeoutMiddleware`, and
//! `ErrorFormattingMiddleware` wrap `executeFunction` (the tool-invocation
//! seam); `PermissionMiddleware` and `ContainerMiddleware` only hook
//! `beforeToolExecution`; `HistoryReductionMiddleware` only hooks
//! `beforeIteration`. That asymmetry is exactly what `spec.md` §4.5
//! describes, so the code mirrors it instead of forcing every middleware
//! through every seam.

pub mod container;
pub mod error_formatting;
pub mod history_reduction;
pub mod permission;
pub mod retry;
pub mod timeout;

pub use container::ContainerMiddleware;
pub use error_formatting::{ErrorFormattingMiddleware, ErrorVerbosity};
pub use history_reduction::HistoryReductionMiddleware;
pub use permission::PermissionMiddleware;
pub use retry::RetryMiddleware;
pub use timeout::TimeoutMiddleware;

use crate::event_bus::EventBus;
use crate::history::HistoryReductionConfig;
use crate::retry::RetryConfig;
use crate::tools::{Tool, ToolRegistry};
use crate::types::{FunctionCallContent, Message};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

/// Context threaded through `beforeIteration`/`afterIteration`: the message
/// list about to be sent to the provider, and the tool list the provider
/// will be told about.
pub struct IterationContext<'a> {
    pub messages: &'a mut Vec<Message>,
    pub visible_tools: Vec<Tool>,
    pub system_prompt_additions: Vec<String>,
}

/// One tool call the model requested, carried through
/// `beforeToolExecution`/`executeFunction`.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

impl From<&FunctionCallContent> for PendingToolCall {
    fn from(c: &FunctionCallContent) -> Self {
        Self {
            call_id: c.call_id.clone(),
            name: c.name.clone(),
            arguments: c.arguments.clone(),
        }
    }
}

/// What `beforeToolExecution` decided for one pending call: run it for
/// real, or short-circuit with a synthetic result (a permission denial or a
/// container expansion notice).
pub enum ToolDecision {
    Run(PendingToolCall),
    ShortCircuit { call_id: String, result: Value },
}

/// The full set of configuration the six standard middlewares need. Built
/// once per [`crate::agent_loop::AgentLoop`] run and owned by the chain.
pub struct MiddlewareChain {
    pub retry: RetryMiddleware,
    pub timeout: TimeoutMiddleware,
    pub error_formatting: ErrorFormattingMiddleware,
    pub permission: PermissionMiddleware,
    pub container: ContainerMiddleware,
    pub history_reduction: HistoryReductionMiddleware,
}

impl MiddlewareChain {
    pub fn new(
        retry_config: RetryConfig,
        tool_timeout: Duration,
        error_verbosity: ErrorVerbosity,
        history_config: HistoryReductionConfig,
    ) -> Self {
        Self {
            retry: RetryMiddleware::new(retry_config),
            timeout: TimeoutMiddleware::new(tool_timeout),
            error_formatting: ErrorFormattingMiddleware::new(error_verbosity),
            permission: PermissionMiddleware::new(),
            container: ContainerMiddleware::new(),
            history_reduction: HistoryReductionMiddleware::new(history_config),
        }
    }

    /// Runs the `beforeIteration` chain: history reduction first (it only
    /// touches `ctx.messages`), then container filtering/prompt injection
    /// (it only touches `ctx.visible_tools`/`ctx.system_prompt_additions`).
    /// Order between the two doesn't matter since neither reads the other's
    /// output, but history-reduction-first matches the canonical ordering's
    /// relative position (HistoryReduction is innermost of the
    /// beforeIteration-hooking middlewares).
    pub fn before_iteration(
        &self,
        messages: &mut Vec<Message>,
        registry: &ToolRegistry,
        expanded_containers: &HashSet<String>,
    ) -> IterationContext<'_> {
        let reduction = self.history_reduction.reduce(messages);
        *messages = reduction.messages;

        let visible_tools: Vec<Tool> = registry
            .snapshot_visible(expanded_containers)
            .into_iter()
            .cloned()
            .collect();

        let system_prompt_additions = self.container.active_system_prompts(registry, expanded_containers);

        IterationContext {
            messages,
            visible_tools,
            system_prompt_additions,
        }
    }

    /// Runs the `beforeToolExecution` chain: container expansion first
    /// (so a newly-expanded container's referenced tools are already
    /// visible when permission is consulted on a subsequent call in the
    /// same batch, matching `spec.md` §4.5 canonical order Permission →
    /// Container meaning Container is the *inner* decision for a given
    /// call but container bookkeeping itself must happen before permission
    /// checks the *next* iteration's visibility — not within the same
    /// batch, since all calls in a batch were already decided against the
    /// same snapshot. Kept in registration order here: Permission, then
    /// Container, exactly as the canonical list reads left to right.
    pub async fn before_tool_execution(
        &self,
        calls: Vec<PendingToolCall>,
        bus: &EventBus,
        registry: &ToolRegistry,
        expanded_containers: &mut HashSet<String>,
    ) -> Vec<ToolDecision> {
        let mut decisions = Vec::with_capacity(calls.len());
        for call in calls {
            if registry.is_container(&call.name) {
                let result = self.container.expand(&call.name, registry, expanded_containers);
                decisions.push(ToolDecision::ShortCircuit {
                    call_id: call.call_id,
                    result: serde_json::json!(result),
                });
                continue;
            }

            let approved = self.permission.check(bus, &call).await;
            if approved {
                decisions.push(ToolDecision::Run(call));
            } else {
                decisions.push(ToolDecision::ShortCircuit {
                    call_id: call.call_id,
                    result: serde_json::json!("Permission denied by user."),
                });
            }
        }
        decisions
    }

    /// Runs the `executeFunction` chain for one tool call: Retry wraps
    /// Timeout wraps ErrorFormatting wraps the actual invocation, exactly
    /// the canonical order's first three entries.
    pub async fn execute_function(&self, tool: &Tool, call: &PendingToolCall, bus: &EventBus) -> (Value, bool) {
        let arguments = call.arguments.clone();
        let outcome = self
            .retry
            .run(&call.call_id, bus, || {
                let tool = tool.clone();
                let arguments = arguments.clone();
                async move { self.timeout.run(&tool, arguments).await }
            })
            .await;

        match outcome {
            Ok(value) => (value, false),
            Err(err) => (self.error_formatting.format(&err), true),
        }
    }

    /// Runs `afterMessageTurn`: strips container calls/results
    /// ("immediate transparency", `spec.md` §4.5 ContainerMiddleware point
    /// 3) and persists permission decisions (handled by the caller reading
    /// [`crate::permission::PermissionBroker::persistent_decisions`]
    /// directly, since that state lives on the broker rather than the
    /// chain).
    pub fn after_message_turn(&self, messages: &[Message], container_call_ids: &HashSet<String>) -> Vec<Message> {
        self.container.strip_container_traffic(messages, container_call_ids)
    }
}
