//! The agent loop state machine (`spec.md` §4.8).
//!
//! Grounded on the teacher's `client.rs` `Client::query`/`receive` loop (the
//! iterate-until-no-tool-calls shape, and the `Arc<AtomicBool>` interrupt
//! flag checked between blocking points) generalized to `spec.md` §4.8's
//! eight-step iteration algorithm: stream provider deltas as events instead
//! of buffering, run tool calls through the middleware chain instead of
//! calling handlers directly, and emit a `CancellationToken`-checked
//! suspension point before every iteration instead of only around receive.

use crate::error::{Error, ErrorCategory, ProviderErrorDetails, Result};
use crate::event_bus::{Event, EventBus, TerminationReason, TokenUsage};
use crate::history::HistoryReductionConfig;
use crate::middleware::{MiddlewareChain, PendingToolCall, ToolDecision};
use crate::provider::{ChatOptions, Provider, ProviderChunk, ToolMode};
use crate::retry::{RetryConfig, RetryDecision, get_retry_delay};
use crate::session::{Branch, ExecutionState, PermissionDecisionRecord};
use crate::tools::ToolRegistry;
use crate::types::{ContentItem, FunctionResultContent, Message, MessageRole};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag, checked at the suspension points `spec.md`
/// §5 names (before each iteration, and the provider stream itself is
/// dropped if set mid-stream). Grounded on the teacher's `Client::interrupted`
/// `Arc<AtomicBool>`, generalized from a single-client flag to a per-run
/// token so callers construct a fresh one per [`AgentLoop::run`] call.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run-scoped tunables that aren't part of [`crate::config::RuntimeConfig`]'s
/// process-wide defaults but vary per agent invocation (`spec.md` §4.8,
/// §4.9's per-run `maxAgenticIterations` override).
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_agentic_iterations: u32,
    pub max_consecutive_errors: u32,
    pub instructions: Option<String>,
    pub tool_mode: ToolMode,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    pub retry: RetryConfig,
    pub tool_timeout: Duration,
    pub history_reduction: HistoryReductionConfig,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_agentic_iterations: 50,
            max_consecutive_errors: 3,
            instructions: None,
            tool_mode: ToolMode::Auto,
            temperature: 0.7,
            max_output_tokens: None,
            retry: RetryConfig::default(),
            tool_timeout: Duration::from_secs(120),
            history_reduction: HistoryReductionConfig::default(),
        }
    }
}

/// Drives one run of the agentic loop against a single [`Branch`], emitting
/// every step as an [`Event`] on an [`EventBus`] and mutating the branch's
/// messages/[`ExecutionState`] in place. Does not persist the branch itself
/// — the caller (typically holding a [`crate::session::BranchLock`]) saves it
/// via [`crate::session::SessionManager::persist_branch`] after `run`
/// returns, and may do so between iterations too via the `STATE_SNAPSHOT`/
/// `CHECKPOINT` events if it wants incremental durability.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    chain: MiddlewareChain,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, chain: MiddlewareChain) -> Self {
        Self { provider, chain }
    }

    /// Runs the loop to completion: either the assistant responds with no
    /// further tool calls, the iteration limit is hit and a denied
    /// continuation ends the run, the consecutive-error cap is exceeded, or
    /// `cancel` is observed set.
    ///
    /// Implements `spec.md` §4.8's eight steps per iteration:
    /// 1. `beforeIteration` (history reduction, tool/prompt visibility)
    /// 2. stream the provider call as content-delta events
    /// 3. no tool calls + normal finish -> done
    /// 4. `beforeToolExecution` + `executeFunction` per call, concurrently
    /// 5. append one aggregated tool-role message, emit `ToolCallResult`s
    /// 6. `afterMessageTurn` (container transparency)
    /// 7. advance the iteration counter; over the cap -> `ContinuationRequest`
    /// 8. loop
    pub async fn run(
        &self,
        branch: &mut Branch,
        registry: &ToolRegistry,
        bus: &EventBus,
        config: &AgentLoopConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let turn_id = format!("turn-{}", branch.id);
        bus.emit(Event::MessageTurnStarted {
            turn_id: turn_id.clone(),
        });

        let mut state = branch.execution_state.clone().unwrap_or_default();

        let result = self.run_inner(branch, registry, bus, config, cancel, &turn_id, &mut state).await;
        branch.execution_state = Some(state);

        match &result {
            Ok(TerminationReason::CancelledByUser) => bus.emit(Event::MessageTurnError {
                turn_id: turn_id.clone(),
                reason: TerminationReason::CancelledByUser,
                message: "run cancelled".to_string(),
            }),
            Ok(reason) => bus.emit(Event::MessageTurnFinished {
                turn_id: turn_id.clone(),
                reason: *reason,
            }),
            Err(err) => bus.emit(Event::MessageTurnError {
                turn_id: turn_id.clone(),
                reason: TerminationReason::Fatal,
                message: err.to_string(),
            }),
        }
        bus.cancel_pending();

        result.map(|_| ())
    }

    async fn run_inner(
        &self,
        branch: &mut Branch,
        registry: &ToolRegistry,
        bus: &EventBus,
        config: &AgentLoopConfig,
        cancel: &CancellationToken,
        turn_id: &str,
        state: &mut ExecutionState,
    ) -> Result<TerminationReason> {
        loop {
            if cancel.is_cancelled() {
                return Ok(TerminationReason::CancelledByUser);
            }

            if state.iteration >= config.max_agentic_iterations {
                let continuation_id = format!("{turn_id}-cont-{}", state.iteration);
                bus.emit(Event::ContinuationRequest {
                    continuation_id: continuation_id.clone(),
                    iteration: state.iteration,
                });
                let approved = match bus.await_response(continuation_id).recv().await {
                    Ok(Event::ContinuationResponse { approved, .. }) => approved,
                    _ => false,
                };
                if !approved {
                    return Ok(TerminationReason::IterationLimit);
                }
            }

            bus.emit(Event::AgentTurnStarted {
                turn_id: turn_id.to_string(),
                iteration: state.iteration,
            });

            let ctx = self
                .chain
                .before_iteration(&mut branch.messages, registry, &state.expanded_containers);
            let system_prompt = merge_instructions(config.instructions.as_deref(), &ctx.system_prompt_additions);
            let options = ChatOptions {
                tools: ctx.visible_tools.iter().map(|t| t.to_function_schema()).collect(),
                tool_mode: config.tool_mode,
                temperature: config.temperature,
                max_output_tokens: config.max_output_tokens,
                instructions: system_prompt,
                response_format: None,
            };
            let messages_snapshot = ctx.messages.clone();

            if cancel.is_cancelled() {
                return Ok(TerminationReason::CancelledByUser);
            }

            let model_call_id = format!("{turn_id}-model-{}", state.iteration);
            let call_result = self
                .call_model_with_retry(&model_call_id, bus, cancel, &config.retry, &messages_snapshot, &options)
                .await;

            match call_result {
                Err(details) => {
                    self.handle_iteration_error(bus, state, config, Error::provider(&details))?;
                    if state.consecutive_error_count > config.max_consecutive_errors {
                        return Ok(TerminationReason::ConsecutiveErrors);
                    }
                    state.iteration += 1;
                    continue;
                }
                Ok(StreamOutcome {
                    assistant_content,
                    usage,
                }) => {
                    state.consecutive_error_count = 0;
                    bus.emit(Event::AgentTurnFinished {
                        turn_id: turn_id.to_string(),
                        iteration: state.iteration,
                        usage,
                    });

                    let assistant_message = Message::assistant(assistant_content);
                    branch.messages.push(assistant_message.clone());

                    if !assistant_message.has_function_calls() {
                        return Ok(TerminationReason::AssistantResponded);
                    }

                    let calls: Vec<PendingToolCall> = assistant_message
                        .function_calls()
                        .map(PendingToolCall::from)
                        .collect();

                    let decisions = self
                        .chain
                        .before_tool_execution(calls, bus, registry, &mut state.expanded_containers)
                        .await;

                    let mut results = Vec::with_capacity(decisions.len());
                    let mut container_call_ids = HashSet::new();
                    let outcomes = futures::future::join_all(decisions.into_iter().map(|decision| {
                        self.run_decision(decision, registry, bus)
                    }))
                    .await;

                    for outcome in outcomes {
                        if outcome.was_container_expansion {
                            container_call_ids.insert(outcome.call_id.clone());
                        }
                        bus.emit(Event::ToolCallResult {
                            call_id: outcome.call_id.clone(),
                            result: outcome.result.clone(),
                            is_error: outcome.is_error,
                        });
                        state.completed_tool_call_ids.insert(outcome.call_id.clone());
                        results.push(FunctionResultContent {
                            call_id: outcome.call_id,
                            result: outcome.result,
                        });
                    }

                    branch.messages.push(Message::tool_results(results));
                    branch.messages = self.chain.after_message_turn(&branch.messages, &container_call_ids);
                    state.middleware_state.permission.decisions = self
                        .chain
                        .permission
                        .persistent_decisions()
                        .into_iter()
                        .map(|(tool_name, arguments_fingerprint, allow)| PermissionDecisionRecord {
                            tool_name,
                            arguments_fingerprint,
                            allow,
                        })
                        .collect();

                    state.iteration += 1;
                    log::debug!("checkpoint reached at iteration {}", state.iteration);
                    bus.emit(Event::StateSnapshot {
                        turn_id: turn_id.to_string(),
                        iteration: state.iteration,
                    });
                    bus.emit(Event::Checkpoint { iteration: state.iteration });
                }
            }
        }
    }

    /// Increments the consecutive-error counter and decides whether the run
    /// can continue; never itself terminates the loop so `run_inner` stays
    /// in control of the return path.
    fn handle_iteration_error(
        &self,
        bus: &EventBus,
        state: &mut ExecutionState,
        _config: &AgentLoopConfig,
        err: Error,
    ) -> Result<()> {
        state.consecutive_error_count += 1;
        bus.emit(Event::MiddlewareProgress {
            name: "agent_loop".to_string(),
            detail: err.to_string(),
        });
        Ok(())
    }

    async fn run_decision(&self, decision: ToolDecision, registry: &ToolRegistry, bus: &EventBus) -> ToolOutcome {
        match decision {
            ToolDecision::ShortCircuit { call_id, result } => ToolOutcome {
                call_id,
                result,
                is_error: false,
                was_container_expansion: true,
            },
            ToolDecision::Run(call) => {
                bus.emit(Event::ToolCallStart {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                });
                let Some(tool) = registry.find_by_name(&call.name) else {
                    return ToolOutcome {
                        call_id: call.call_id,
                        result: serde_json::json!(format!("tool '{}' not found", call.name)),
                        is_error: true,
                        was_container_expansion: false,
                    };
                };
                let (result, is_error) = self.chain.execute_function(tool, &call, bus).await;
                ToolOutcome {
                    call_id: call.call_id,
                    result,
                    is_error,
                    was_container_expansion: false,
                }
            }
        }
    }

    /// Runs one model call (`provider.chat` + draining its stream) through
    /// the same retry engine `executeFunction` uses for tools (`spec.md`
    /// §4.3/§4.5/§7, scenario S3): classify via the `ProviderErrorDetails`
    /// the provider already returns, emit `FunctionRetry` before each wait,
    /// and honor `get_retry_delay`'s precedence (non-retryable categories
    /// abort immediately; a server `retry_after` is used verbatim;
    /// otherwise jittered backoff). Kept as its own small loop rather than
    /// routed through [`crate::middleware::retry::RetryMiddleware`] because
    /// that middleware operates on the tool-invocation seam's already-erased
    /// [`Error`] type, which drops the `retry_after`/status/request-id this
    /// call needs to honor a 429's `Retry-After` verbatim.
    async fn call_model_with_retry(
        &self,
        call_id: &str,
        bus: &EventBus,
        cancel: &CancellationToken,
        retry_config: &RetryConfig,
        messages: &[Message],
        options: &ChatOptions,
    ) -> std::result::Result<StreamOutcome, ProviderErrorDetails> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderErrorDetails::new(ErrorCategory::Unknown, "run cancelled"));
            }

            let attempt_result = match self.provider.chat(messages, options).await {
                Ok(stream) => self.consume_stream(stream, bus, cancel).await,
                Err(details) => Err(details),
            };

            let details = match attempt_result {
                Ok(outcome) => return Ok(outcome),
                Err(details) => details,
            };

            if attempt + 1 >= retry_config.max_attempts {
                log::warn!(
                    "model call {call_id} exhausted {} attempts, last error: {}",
                    retry_config.max_attempts,
                    details.message
                );
                return Err(details);
            }

            match get_retry_delay(&details, attempt, retry_config) {
                RetryDecision::NonRetryable => {
                    log::debug!(
                        "model call {call_id} failed with non-retryable category {:?}, not retrying",
                        details.category
                    );
                    return Err(details);
                }
                RetryDecision::RetryAfter(delay) => {
                    log::debug!(
                        "model call {call_id} attempt {} failed ({:?}), retrying in {}ms",
                        attempt + 1,
                        details.category,
                        delay.as_millis()
                    );
                    bus.emit(Event::FunctionRetry {
                        call_id: call_id.to_string(),
                        attempt: attempt + 1,
                        max_attempts: retry_config.max_attempts,
                        delay_ms: delay.as_millis() as u64,
                        category: details.category,
                    });
                    sleep_cancellable(delay, cancel).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Drains one provider stream, forwarding each [`ProviderChunk`] as its
    /// matching content-delta [`Event`] pair (`spec.md` §4.8 step 2) and
    /// assembling the assistant message's content items in arrival order.
    /// Stops early, returning whatever was assembled so far, if `cancel` is
    /// set mid-stream.
    async fn consume_stream(
        &self,
        mut stream: crate::provider::ProviderStream,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> std::result::Result<StreamOutcome, ProviderErrorDetails> {
        let mut content = Vec::new();
        let mut text_buf = String::new();
        let mut reasoning_buf = String::new();
        let mut text_open = false;
        let mut reasoning_open = false;
        let mut pending_calls: Vec<(String, String, String)> = Vec::new();
        let message_id = "assistant-message".to_string();
        let mut usage = None;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let chunk = chunk?;
            match chunk {
                ProviderChunk::TextDelta(delta) => {
                    if !text_open {
                        bus.emit(Event::TextMessageStart {
                            message_id: message_id.clone(),
                        });
                        text_open = true;
                    }
                    bus.emit(Event::TextMessageDelta {
                        message_id: message_id.clone(),
                        delta: delta.clone(),
                    });
                    text_buf.push_str(&delta);
                }
                ProviderChunk::ReasoningDelta(delta) => {
                    if !reasoning_open {
                        bus.emit(Event::ReasoningMessageStart {
                            message_id: message_id.clone(),
                        });
                        reasoning_open = true;
                    }
                    bus.emit(Event::ReasoningMessageDelta {
                        message_id: message_id.clone(),
                        delta: delta.clone(),
                    });
                    reasoning_buf.push_str(&delta);
                }
                ProviderChunk::ToolCallStart { call_id, name } => {
                    bus.emit(Event::ToolCallStart {
                        call_id: call_id.clone(),
                        name: name.clone(),
                    });
                    pending_calls.push((call_id, name, String::new()));
                }
                ProviderChunk::ToolCallArgsDelta { call_id, delta } => {
                    bus.emit(Event::ToolCallArgs {
                        call_id: call_id.clone(),
                        delta: delta.clone(),
                    });
                    if let Some(entry) = pending_calls.iter_mut().find(|(id, ..)| *id == call_id) {
                        entry.2.push_str(&delta);
                    }
                }
                ProviderChunk::ToolCallEnd { call_id } => {
                    bus.emit(Event::ToolCallEnd {
                        call_id: call_id.clone(),
                    });
                }
                ProviderChunk::Finished { usage: u } => {
                    usage = u;
                }
            }
        }

        if reasoning_open {
            bus.emit(Event::ReasoningMessageEnd {
                message_id: message_id.clone(),
            });
            content.push(ContentItem::reasoning(reasoning_buf));
        }
        if text_open {
            bus.emit(Event::TextMessageEnd {
                message_id: message_id.clone(),
            });
            content.push(ContentItem::text(text_buf));
        }
        for (call_id, name, args_json) in pending_calls {
            let arguments = serde_json::from_str(&args_json).unwrap_or(serde_json::Value::Null);
            content.push(ContentItem::function_call(call_id, name, arguments));
        }

        Ok(StreamOutcome {
            assistant_content: content,
            usage,
        })
    }
}

struct StreamOutcome {
    assistant_content: Vec<ContentItem>,
    usage: Option<TokenUsage>,
}

struct ToolOutcome {
    call_id: String,
    result: serde_json::Value,
    is_error: bool,
    was_container_expansion: bool,
}

/// Sleeps for `duration`, polling `cancel` in short slices so a cancellation
/// signalled mid-wait is honored promptly instead of after the full retry
/// delay elapses (`spec.md` §5: suspension points, including "awaiting a
/// sleep in RetryMiddleware", must observe cancellation).
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(Duration::from_millis(50))).await;
    }
}

/// Combines the base system instructions with container/skill prompt
/// fragments contributed by this iteration's expanded tools (`spec.md`
/// §4.5 ContainerMiddleware point 2).
fn merge_instructions(base: Option<&str>, additions: &[String]) -> Option<String> {
    if base.is_none() && additions.is_empty() {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    if let Some(b) = base {
        parts.push(b);
    }
    for a in additions {
        parts.push(a);
    }
    Some(parts.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{ErrorVerbosity, MiddlewareChain};
    use crate::provider::ProviderChunk;
    use crate::session::Branch;
    use crate::tools::tool;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex as StdMutex;

    struct ScriptedProvider {
        responses: StdMutex<Vec<Vec<ProviderChunk>>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _options: &ChatOptions,
        ) -> std::result::Result<crate::provider::ProviderStream, crate::error::ProviderErrorDetails> {
            let mut responses = self.responses.lock().unwrap();
            let chunks = if responses.is_empty() {
                vec![ProviderChunk::Finished { usage: None }]
            } else {
                responses.remove(0)
            };
            Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
        }
    }

    fn chain() -> MiddlewareChain {
        MiddlewareChain::new(
            RetryConfig::default(),
            Duration::from_secs(5),
            ErrorVerbosity::Concise,
            HistoryReductionConfig::default(),
        )
    }

    #[tokio::test]
    async fn run_terminates_when_assistant_responds_with_no_tool_calls() {
        let provider = Arc::new(ScriptedProvider {
            responses: StdMutex::new(vec![vec![
                ProviderChunk::TextDelta("hello there".into()),
                ProviderChunk::Finished { usage: None },
            ]]),
        });
        let agent_loop = AgentLoop::new(provider, chain());
        let registry = ToolRegistry::new();
        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let mut branch = Branch::main("s1", 0);
        branch.messages.push(Message::user("hi"));
        let config = AgentLoopConfig::default();
        let cancel = CancellationToken::new();

        agent_loop
            .run(&mut branch, &registry, &bus, &config, &cancel)
            .await
            .unwrap();

        assert_eq!(branch.messages.last().unwrap().role, MessageRole::Assistant);
        assert_eq!(branch.messages.last().unwrap().text(), "hello there");

        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            if let Event::MessageTurnFinished { reason, .. } = event {
                assert_eq!(reason, TerminationReason::AssistantResponded);
                saw_finished = true;
            }
        }
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn run_executes_a_tool_call_and_loops_once_more() {
        let provider = Arc::new(ScriptedProvider {
            responses: StdMutex::new(vec![
                vec![
                    ProviderChunk::ToolCallStart {
                        call_id: "c1".into(),
                        name: "add".into(),
                    },
                    ProviderChunk::ToolCallArgsDelta {
                        call_id: "c1".into(),
                        delta: "{\"a\":1,\"b\":2}".into(),
                    },
                    ProviderChunk::ToolCallEnd { call_id: "c1".into() },
                    ProviderChunk::Finished { usage: None },
                ],
                vec![
                    ProviderChunk::TextDelta("the sum is 3".into()),
                    ProviderChunk::Finished { usage: None },
                ],
            ]),
        });
        let mut registry = ToolRegistry::new();
        registry.register(tool("add", "adds two numbers").build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!(a + b))
        }));

        let agent_loop = AgentLoop::new(provider, chain());
        let bus = EventBus::new(64);
        let mut branch = Branch::main("s1", 0);
        branch.messages.push(Message::user("what is 1 + 2?"));
        let config = AgentLoopConfig::default();
        let cancel = CancellationToken::new();

        // The default chain's PermissionMiddleware round-trips through the
        // bus for every call, so something has to answer PermissionRequest
        // or `run` would wait on it forever.
        let mut events = bus.subscribe();
        let auto_approve = async {
            while let Ok(event) = events.recv().await {
                if let Event::PermissionRequest { permission_id, .. } = event {
                    bus.respond(
                        &permission_id,
                        Event::PermissionResponse {
                            permission_id,
                            choice: crate::event_bus::PermissionChoice::AllowAlways,
                        },
                    );
                }
            }
        };

        tokio::select! {
            result = agent_loop.run(&mut branch, &registry, &bus, &config, &cancel) => {
                result.unwrap();
            }
            _ = auto_approve => unreachable!("event stream never closes while bus is alive"),
        }

        let tool_message = branch
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .expect("expected a tool-result message");
        assert_eq!(tool_message.content[0].call_id(), Some("c1"));

        let last = branch.messages.last().unwrap();
        assert_eq!(last.text(), "the sum is 3");
        assert_eq!(branch.execution_state.as_ref().unwrap().iteration, 1);
    }

    #[tokio::test]
    async fn cancellation_before_the_first_iteration_ends_the_run_immediately() {
        let provider = Arc::new(ScriptedProvider {
            responses: StdMutex::new(vec![]),
        });
        let agent_loop = AgentLoop::new(provider, chain());
        let registry = ToolRegistry::new();
        let bus = EventBus::new(64);
        let mut branch = Branch::main("s1", 0);
        let config = AgentLoopConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        agent_loop
            .run(&mut branch, &registry, &bus, &config, &cancel)
            .await
            .unwrap();

        assert!(branch.messages.is_empty());
    }
}
