//! The bidirectional event channel (`spec.md` §4.1).
//!
//! An [`EventBus`] is owned by exactly one run (one [`crate::agent_loop::AgentLoop`]
//! execution against one branch). It fans out an ordered event stream to
//! subscribers via a `tokio::sync::broadcast` channel — which already gives
//! us "exactly-once delivery per subscriber, ordering preserved per run" for
//! free — and separately maintains a [`CorrelationRegistry`] of one-shot
//! waiters for the four paired request/response event kinds.
//!
//! No teacher equivalent: the teacher SDK streams assistant output directly
//! to the caller (see `client.rs`'s `eventsource-stream` usage) rather than
//! through a typed, subscribable bus with a response channel. This module is
//! grounded on `spec.md` §4.1 and on the `LoopEvent`-shaped enums and
//! request/response correlation patterns found across
//! `examples/other_examples/`'s agent-loop sources, adapted to this crate's
//! [`crate::types::ContentItem`]/[`crate::error::ErrorCategory`] types.

use crate::error::{Error, ErrorCategory, Result};
use crate::types::ContentItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};

/// Token accounting carried on turn-completion events. `spec.md` doesn't
/// mandate this field, but doesn't forbid it either, and several pack
/// examples (e.g. `LoopEvent::TurnCompleted`) carry it on the comparable
/// event — see `SPEC_FULL.md` §C.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Why a message turn ended, carried on `MessageTurnFinished`/`MessageTurnError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    AssistantResponded,
    IterationLimit,
    ConsecutiveErrors,
    CancelledByUser,
    Fatal,
}

/// One entry of a `PermissionRequest`/`ContinuationRequest`/etc.'s
/// correlation id. Distinct newtypes would let the compiler keep the four
/// id spaces apart, but a run only ever has one request outstanding per
/// kind in practice and the spec refers to all four uniformly as
/// "correlationId", so a single `String` is kept here for fidelity to the
/// spec's vocabulary rather than introduced ceremony.
pub type CorrelationId = String;

/// The full event taxonomy (`spec.md` §4.1), externally tagged to match the
/// wire format's `SCREAMING_SNAKE_CASE` `type` discriminator (§6) and
/// carrying an explicit schema `version` on every variant via
/// [`Event::version`] rather than per-field duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // --- Turn lifecycle ---
    #[serde(rename = "MESSAGE_TURN_STARTED")]
    MessageTurnStarted { turn_id: String },
    #[serde(rename = "MESSAGE_TURN_FINISHED")]
    MessageTurnFinished {
        turn_id: String,
        reason: TerminationReason,
    },
    #[serde(rename = "MESSAGE_TURN_ERROR")]
    MessageTurnError {
        turn_id: String,
        reason: TerminationReason,
        message: String,
    },
    #[serde(rename = "AGENT_TURN_STARTED")]
    AgentTurnStarted { turn_id: String, iteration: u32 },
    #[serde(rename = "AGENT_TURN_FINISHED")]
    AgentTurnFinished {
        turn_id: String,
        iteration: u32,
        usage: Option<TokenUsage>,
    },
    #[serde(rename = "STATE_SNAPSHOT")]
    StateSnapshot { turn_id: String, iteration: u32 },

    // --- Content streaming ---
    #[serde(rename = "TEXT_MESSAGE_START")]
    TextMessageStart { message_id: String },
    #[serde(rename = "TEXT_MESSAGE_DELTA")]
    TextMessageDelta { message_id: String, delta: String },
    #[serde(rename = "TEXT_MESSAGE_END")]
    TextMessageEnd { message_id: String },
    #[serde(rename = "REASONING_MESSAGE_START")]
    ReasoningMessageStart { message_id: String },
    #[serde(rename = "REASONING_MESSAGE_DELTA")]
    ReasoningMessageDelta { message_id: String, delta: String },
    #[serde(rename = "REASONING_MESSAGE_END")]
    ReasoningMessageEnd { message_id: String },

    // --- Tool execution ---
    #[serde(rename = "TOOL_CALL_START")]
    ToolCallStart { call_id: String, name: String },
    #[serde(rename = "TOOL_CALL_ARGS")]
    ToolCallArgs { call_id: String, delta: String },
    #[serde(rename = "TOOL_CALL_END")]
    ToolCallEnd { call_id: String },
    #[serde(rename = "TOOL_CALL_RESULT")]
    ToolCallResult {
        call_id: String,
        result: Value,
        is_error: bool,
    },

    // --- Bidirectional: permission ---
    #[serde(rename = "PERMISSION_REQUEST")]
    PermissionRequest {
        permission_id: CorrelationId,
        tool_name: String,
        arguments: Value,
    },
    #[serde(rename = "PERMISSION_RESPONSE")]
    PermissionResponse {
        permission_id: CorrelationId,
        choice: PermissionChoice,
    },

    // --- Bidirectional: clarification ---
    #[serde(rename = "CLARIFICATION_REQUEST")]
    ClarificationRequest {
        clarification_id: CorrelationId,
        prompt: String,
    },
    #[serde(rename = "CLARIFICATION_RESPONSE")]
    ClarificationResponse {
        clarification_id: CorrelationId,
        answer: String,
    },

    // --- Bidirectional: continuation ---
    #[serde(rename = "CONTINUATION_REQUEST")]
    ContinuationRequest {
        continuation_id: CorrelationId,
        iteration: u32,
    },
    #[serde(rename = "CONTINUATION_RESPONSE")]
    ContinuationResponse {
        continuation_id: CorrelationId,
        approved: bool,
    },

    // --- Bidirectional: client tools ---
    #[serde(rename = "CLIENT_TOOL_INVOKE_REQUEST")]
    ClientToolInvokeRequest {
        request_id: CorrelationId,
        tool_name: String,
        call_id: String,
        arguments: Value,
    },
    #[serde(rename = "CLIENT_TOOL_INVOKE_RESPONSE")]
    ClientToolInvokeResponse {
        request_id: CorrelationId,
        content: Vec<ContentItem>,
        success: bool,
        error_message: Option<String>,
    },

    // --- Observability ---
    #[serde(rename = "FUNCTION_RETRY")]
    FunctionRetry {
        call_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        category: ErrorCategory,
    },
    #[serde(rename = "MIDDLEWARE_PROGRESS")]
    MiddlewareProgress { name: String, detail: String },
    #[serde(rename = "CONTAINER_EXPANDED")]
    ContainerExpanded {
        container_name: String,
        referenced_tools: Vec<String>,
    },
    #[serde(rename = "CHECKPOINT")]
    Checkpoint { iteration: u32 },
}

impl Event {
    /// Schema version embedded on every event per `spec.md` §6. A single
    /// constant today; bumped crate-wide if the wire format ever changes
    /// incompatibly.
    pub const SCHEMA_VERSION: &'static str = "1.0";

    /// True for the two event kinds that end a run's subscription
    /// (`spec.md` §4.1 `subscribe()`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::MessageTurnFinished { .. } | Event::MessageTurnError { .. })
    }
}

/// A client's decision in response to a `PermissionRequest` (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    Ask,
    AllowAlways,
    DenyAlways,
    Deny,
}

impl PermissionChoice {
    pub fn is_approval(self) -> bool {
        matches!(self, PermissionChoice::Ask | PermissionChoice::AllowAlways)
    }
}

/// Registry of one-shot waiters keyed by correlation id, backing
/// `EventBus::respond`. Kept as its own type (rather than folded into
/// `EventBus`) so `AgentLoop` can cancel every outstanding waiter at run
/// termination without needing a second borrow of the bus itself.
#[derive(Default)]
struct CorrelationRegistry {
    waiters: Mutex<HashMap<CorrelationId, oneshot::Sender<Event>>>,
}

impl CorrelationRegistry {
    fn register(&self, id: CorrelationId) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);
        rx
    }

    /// Delivers `response` to the waiter for `id`, if one is still
    /// registered. Matches `spec.md` §4.1's "delivered to a single waiter";
    /// a second `respond` call for the same id silently has no effect,
    /// since the first already removed the entry.
    fn respond(&self, id: &str, response: Event) {
        if let Some(tx) = self.waiters.lock().unwrap().remove(id) {
            let _ = tx.send(response);
        }
    }

    /// Drops every outstanding waiter, which resolves each corresponding
    /// `recv().await` with a `RecvError` — how cancellation at run
    /// termination reaches the four bidirectional event kinds (`spec.md`
    /// §8 invariant 2: "an unmatched request at run termination is
    /// cancelled").
    fn cancel_all(&self) {
        self.waiters.lock().unwrap().clear();
    }
}

/// The event bus for one run. `emit` is non-blocking (`spec.md` §4.1);
/// backpressure is the caller's concern (the agent loop only emits between
/// suspension points, so nothing races to fill the channel).
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    correlations: CorrelationRegistry,
}

impl EventBus {
    /// `capacity` bounds the broadcast channel's internal ring buffer; a
    /// subscriber that falls behind by more than `capacity` events misses
    /// the oldest ones (reported as `RecvError::Lagged`, not silently
    /// dropped) rather than blocking the producer, preserving "never
    /// drops [for the producer]; backpressure is applied by suspending the
    /// loop" as the responsibility of a *subscriber* rather than the bus.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            correlations: CorrelationRegistry::default(),
        }
    }

    /// Appends an event to the stream. Errors only if there are currently
    /// no subscribers, which this crate treats as a no-op rather than a
    /// failure — a run emitting into the void (e.g. during a unit test
    /// that never subscribed) is not a bug.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// A fresh subscription to this run's event stream, starting from the
    /// next emitted event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Registers a pending correlated request and returns a future that
    /// resolves when [`EventBus::respond`] is called with a matching id, or
    /// errors if the run is cancelled first.
    pub fn await_response(&self, correlation_id: impl Into<String>) -> PendingResponse {
        let id = correlation_id.into();
        let rx = self.correlations.register(id);
        PendingResponse { rx }
    }

    /// Delivers a response to the waiter registered under `correlation_id`,
    /// per `spec.md` §4.1's `respond(correlationId, response)`.
    pub fn respond(&self, correlation_id: &str, response: Event) {
        self.correlations.respond(correlation_id, response);
    }

    /// Cancels every outstanding correlated request. Called once by
    /// [`crate::agent_loop::AgentLoop`] as part of run termination.
    pub fn cancel_pending(&self) {
        self.correlations.cancel_all();
    }
}

/// A future-like handle for a pending correlated response. Wraps the
/// `oneshot::Receiver` so callers get a [`crate::error::Error::Cancelled`]
/// instead of a raw `RecvError` when the registry is torn down.
pub struct PendingResponse {
    rx: oneshot::Receiver<Event>,
}

impl PendingResponse {
    pub async fn recv(self) -> Result<Event> {
        self.rx.await.map_err(|_| Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_terminal_classification() {
        let finished = Event::MessageTurnFinished {
            turn_id: "t1".into(),
            reason: TerminationReason::AssistantResponded,
        };
        assert!(finished.is_terminal());

        let started = Event::MessageTurnStarted { turn_id: "t1".into() };
        assert!(!started.is_terminal());
    }

    #[test]
    fn permission_choice_approval() {
        assert!(PermissionChoice::Ask.is_approval());
        assert!(PermissionChoice::AllowAlways.is_approval());
        assert!(!PermissionChoice::Deny.is_approval());
        assert!(!PermissionChoice::DenyAlways.is_approval());
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_emission_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(Event::MessageTurnStarted { turn_id: "t1".into() });
        bus.emit(Event::TextMessageStart { message_id: "m1".into() });
        bus.emit(Event::TextMessageDelta {
            message_id: "m1".into(),
            delta: "hi".into(),
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::MessageTurnStarted { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::TextMessageStart { .. }));
        let third = rx.recv().await.unwrap();
        assert!(matches!(third, Event::TextMessageDelta { .. }));
    }

    #[tokio::test]
    async fn respond_delivers_to_the_matching_waiter_only() {
        let bus = EventBus::new(16);
        let pending = bus.await_response("perm-1");

        bus.respond(
            "perm-1",
            Event::PermissionResponse {
                permission_id: "perm-1".into(),
                choice: PermissionChoice::AllowAlways,
            },
        );

        let response = pending.recv().await.unwrap();
        match response {
            Event::PermissionResponse { choice, .. } => assert_eq!(choice, PermissionChoice::AllowAlways),
            _ => panic!("wrong event delivered"),
        }
    }

    #[tokio::test]
    async fn cancel_pending_resolves_waiters_with_cancelled_error() {
        let bus = EventBus::new(16);
        let pending = bus.await_response("cont-1");
        bus.cancel_pending();

        let result = pending.recv().await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn respond_with_no_registered_waiter_is_a_silent_no_op() {
        let bus = EventBus::new(16);
        bus.respond(
            "nonexistent",
            Event::ContinuationResponse {
                continuation_id: "nonexistent".into(),
                approved: true,
            },
        );
    }
}
