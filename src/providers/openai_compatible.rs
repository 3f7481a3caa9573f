//! A generic OpenAI-*compatible* chat-completions adapter.
//!
//! Built from the teacher's `client.rs` (request assembly, SSE handling) +
//! `utils.rs` (`ToolCallAggregator`/`parse_sse_stream`) + `types.rs` (the
//! OpenAI wire structs), generalized from the teacher's single-shot
//! `ContentBlock` buffering to the incremental [`crate::provider::ProviderChunk`]
//! stream `spec.md` §4.8 step 2 requires (`TextDelta`/`ToolCallArgs` must be
//! forwarded as they arrive, not buffered until `finish_reason`).
//!
//! This is explicitly a boundary adapter (`spec.md` §1 Non-goals: "the
//! specific LLM provider clients"), kept behind [`crate::provider::Provider`]
//! only to exercise [`crate::agent_loop::AgentLoop`] end to end against a
//! real wire protocol in integration tests.

use crate::error::ProviderErrorDetails;
use crate::provider::{
    ChatOptions, Provider, ProviderChunk, ProviderErrorClassifier, ProviderStream, ToolMode,
    classify_generic,
};
use crate::types::{ContentItem, Message, MessageRole};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

const CONTEXT_LENGTH_MARKER: &str = "context_length_exceeded";

/// Classifies OpenAI-compatible error bodies. Most local servers (LM Studio,
/// Ollama, llama.cpp, vLLM) echo OpenAI's `{"error": {"message", "code",
/// "type"}}` envelope closely enough that a single classifier covers all of
/// them; anything it can't parse falls through to [`classify_generic`].
pub struct OpenAiCompatibleClassifier;

#[derive(Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiErrorBody,
}

#[derive(Deserialize)]
struct OpenAiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

impl ProviderErrorClassifier for OpenAiCompatibleClassifier {
    fn classify(&self, status: Option<u16>, body: &str) -> ProviderErrorDetails {
        let parsed: Option<OpenAiErrorEnvelope> = serde_json::from_str(body).ok();
        if parsed.is_none() {
            log::debug!("error body did not match the OpenAI error envelope, classifying generically: {body}");
        }
        let message = parsed
            .as_ref()
            .map(|e| e.error.message.clone())
            .unwrap_or_else(|| body.to_string());
        let mut details = classify_generic(status, &message, CONTEXT_LENGTH_MARKER);
        if let Some(code) = parsed.and_then(|e| e.error.code) {
            details = details.with_error_code(code);
        }
        log::debug!("classified provider error as {:?} (status={status:?})", details.category);
        details
    }
}

/// Configuration for one [`OpenAiCompatibleProvider`] instance. Base URL and
/// model resolution follow the teacher's `config.rs` precedence
/// (explicit > environment variable > built-in default); see
/// [`crate::config::RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

pub struct OpenAiCompatibleProvider {
    http: reqwest::Client,
    config: OpenAiCompatibleConfig,
    classifier: OpenAiCompatibleClassifier,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: OpenAiCompatibleConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client configuration should always be valid");
        Self {
            http,
            config,
            classifier: OpenAiCompatibleClassifier,
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ProviderStream, ProviderErrorDetails> {
        let mut wire_messages = Vec::new();
        if let Some(instructions) = &options.instructions {
            wire_messages.push(OpenAiMessage::system(instructions));
        }
        for message in messages {
            wire_messages.extend(to_wire_messages(message));
        }

        let tool_choice = match options.tool_mode {
            ToolMode::Auto => Some(Value::String("auto".into())),
            ToolMode::None => Some(Value::String("none".into())),
            ToolMode::Required => Some(Value::String("required".into())),
        };

        let request = OpenAiRequest {
            model: self.config.model.clone(),
            messages: wire_messages,
            stream: true,
            temperature: Some(options.temperature),
            max_tokens: options.max_output_tokens,
            tools: if options.tools.is_empty() { None } else { Some(options.tools.clone()) },
            tool_choice,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classifier.classify(None, &e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(self.classifier.classify(Some(status), &body));
        }

        Ok(aggregate_stream(parse_sse(response)))
    }
}

/// Converts one core [`Message`] to zero or more OpenAI-wire messages. A
/// `Tool`-role message can carry several [`ContentItem::FunctionResult`]s
/// (`spec.md` §4.8 step 5 aggregates a whole batch into one message), but
/// OpenAI's wire format addresses one `tool_call_id` per message, so each
/// result becomes its own wire message.
fn to_wire_messages(message: &Message) -> Vec<OpenAiMessage> {
    match message.role {
        MessageRole::Tool => message
            .content
            .iter()
            .filter_map(|item| match item {
                ContentItem::FunctionResult(r) => Some(OpenAiMessage {
                    role: "tool".into(),
                    content: Some(r.result.to_string()),
                    tool_calls: None,
                    tool_call_id: Some(r.call_id.clone()),
                }),
                _ => None,
            })
            .collect(),
        MessageRole::Assistant => {
            let text = message.text();
            let tool_calls: Vec<OpenAiToolCall> = message
                .function_calls()
                .map(|c| OpenAiToolCall {
                    id: c.call_id.clone(),
                    call_type: "function".into(),
                    function: OpenAiFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.to_string(),
                    },
                })
                .collect();
            vec![OpenAiMessage {
                role: "assistant".into(),
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
            }]
        }
        MessageRole::System => vec![OpenAiMessage::system(message.text())],
        MessageRole::User => vec![OpenAiMessage {
            role: "user".into(),
            content: Some(message.text()),
            tool_calls: None,
            tool_call_id: None,
        }],
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(text.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiChunk {
    choices: Vec<OpenAiChunkChoice>,
}

#[derive(Deserialize)]
struct OpenAiChunkChoice {
    delta: OpenAiChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Deserialize)]
struct OpenAiToolCallDelta {
    index: u32,
    id: Option<String>,
    function: Option<OpenAiFunctionCallDelta>,
}

#[derive(Deserialize)]
struct OpenAiFunctionCallDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Parses a raw HTTP streaming body as Server-Sent Events, same protocol
/// handling as the teacher's `utils::parse_sse_stream`: lines prefixed
/// `data: `, the `[DONE]` sentinel skipped, everything else decoded as one
/// [`OpenAiChunk`] per line.
fn parse_sse(response: reqwest::Response) -> impl Stream<Item = Result<OpenAiChunk, ProviderErrorDetails>> {
    response.bytes_stream().filter_map(|result| async move {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => return Some(Err(classify_generic(None, &e.to_string(), CONTEXT_LENGTH_MARKER))),
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    continue;
                }
                return Some(
                    serde_json::from_str::<OpenAiChunk>(data)
                        .map_err(|e| classify_generic(None, &e.to_string(), CONTEXT_LENGTH_MARKER)),
                );
            }
        }
        None
    })
}

/// Bookkeeping for one in-flight tool call across chunks: whether its
/// `ToolCallStart` has been emitted yet (it requires both an id and a name,
/// which may not arrive in the same delta).
#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    started: bool,
}

/// Turns a stream of [`OpenAiChunk`]s into a stream of [`ProviderChunk`]s,
/// forwarding text/tool-call fragments as soon as they arrive instead of
/// buffering until `finish_reason` the way the teacher's `ToolCallAggregator`
/// did — `spec.md` §4.8 step 2 requires deltas to reach the event bus as
/// they stream, not all at once at the end.
fn aggregate_stream(
    inner: impl Stream<Item = Result<OpenAiChunk, ProviderErrorDetails>> + Send + 'static,
) -> ProviderStream {
    let state = (HashMap::<u32, PendingCall>::new(),);
    let stream = inner.scan(state, |(pending,), item| {
        let chunks = match item {
            Err(e) => return futures::future::ready(Some(vec![Err(e)])),
            Ok(chunk) => {
                let mut out = Vec::new();
                for choice in chunk.choices {
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            out.push(Ok(ProviderChunk::TextDelta(text)));
                        }
                    }
                    if let Some(reasoning) = choice.delta.reasoning_content {
                        if !reasoning.is_empty() {
                            out.push(Ok(ProviderChunk::ReasoningDelta(reasoning)));
                        }
                    }
                    if let Some(tool_calls) = choice.delta.tool_calls {
                        for delta in tool_calls {
                            let entry = pending.entry(delta.index).or_default();
                            if let Some(id) = delta.id {
                                entry.id = Some(id);
                            }
                            if let Some(function) = delta.function {
                                if let Some(name) = function.name {
                                    entry.name = Some(name);
                                }
                                if !entry.started {
                                    if let (Some(id), Some(name)) = (&entry.id, &entry.name) {
                                        out.push(Ok(ProviderChunk::ToolCallStart {
                                            call_id: id.clone(),
                                            name: name.clone(),
                                        }));
                                        entry.started = true;
                                    }
                                }
                                if let Some(args) = function.arguments {
                                    if entry.started {
                                        if let Some(id) = &entry.id {
                                            out.push(Ok(ProviderChunk::ToolCallArgsDelta {
                                                call_id: id.clone(),
                                                delta: args,
                                            }));
                                        }
                                    }
                                }
                            }
                        }
                    }
                    if let Some(reason) = choice.finish_reason {
                        if reason == "tool_calls" {
                            for call in pending.values() {
                                if let Some(id) = &call.id {
                                    out.push(Ok(ProviderChunk::ToolCallEnd { call_id: id.clone() }));
                                }
                            }
                            pending.clear();
                        }
                        out.push(Ok(ProviderChunk::Finished { usage: None }));
                    }
                }
                out
            }
        };
        futures::future::ready(Some(chunks))
    });

    Box::pin(stream.flat_map(futures::stream::iter)) as Pin<Box<dyn Stream<Item = _> + Send>>
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_parses_openai_error_envelope() {
        let classifier = OpenAiCompatibleClassifier;
        let body = r#"{"error": {"message": "exceeded your current quota", "code": "insufficient_quota"}}"#;
        let details = classifier.classify(Some(429), body);
        assert_eq!(details.category, crate::error::ErrorCategory::RateLimitTerminal);
        assert_eq!(details.error_code.as_deref(), Some("insufficient_quota"));
    }

    #[test]
    fn classifier_falls_back_to_generic_on_unparseable_body() {
        let classifier = OpenAiCompatibleClassifier;
        let details = classifier.classify(Some(500), "upstream exploded");
        assert_eq!(details.category, crate::error::ErrorCategory::ServerError);
    }

    #[test]
    fn wire_message_conversion_splits_tool_results_one_per_call() {
        let msg = Message::tool_results(vec![
            crate::types::FunctionResultContent { call_id: "c1".into(), result: serde_json::json!("a") },
            crate::types::FunctionResultContent { call_id: "c2".into(), result: serde_json::json!("b") },
        ]);
        let wire = to_wire_messages(&msg);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(wire[1].tool_call_id.as_deref(), Some("c2"));
    }

    #[test]
    fn wire_message_conversion_carries_assistant_tool_calls() {
        let msg = Message::assistant(vec![
            ContentItem::text("checking"),
            ContentItem::function_call("c1", "get_weather", serde_json::json!({"city": "Seattle"})),
        ]);
        let wire = to_wire_messages(&msg);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].content.as_deref(), Some("checking"));
        assert_eq!(wire[0].tool_calls.as_ref().unwrap().len(), 1);
    }
}
