//! Tool calling with permission example
//!
//! Registers a calculator tool and drives the bidirectional event bus's
//! permission round trip by hand: every tool call is approved once and the
//! approval is generalized to "always allow this tool" after the first ask,
//! the way an interactive CLI front-end would.

use agent_runtime::event_bus::{Event, PermissionChoice};
use agent_runtime::session::{InMemorySessionStore, SessionManager};
use agent_runtime::tools::{tool, ToolRegistry};
use agent_runtime::types::Message;
use agent_runtime::{AgentLoop, AgentLoopConfig, CancellationToken, EventBus, MiddlewareChain};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A scripted provider standing in for a real OpenAI-compatible server, so
/// this example runs without a local model.
struct ScriptedProvider;

#[async_trait]
impl agent_runtime::Provider for ScriptedProvider {
    async fn chat(
        &self,
        messages: &[Message],
        _options: &agent_runtime::ChatOptions,
    ) -> Result<agent_runtime::ProviderStream, agent_runtime::ProviderErrorDetails> {
        use agent_runtime::ProviderChunk;
        use futures::stream;

        let already_called = messages.iter().any(|m| m.has_function_calls());
        let chunks = if !already_called {
            vec![
                ProviderChunk::ToolCallStart {
                    call_id: "call_1".into(),
                    name: "add".into(),
                },
                ProviderChunk::ToolCallArgsDelta {
                    call_id: "call_1".into(),
                    delta: r#"{"a":2,"b":2}"#.into(),
                },
                ProviderChunk::ToolCallEnd { call_id: "call_1".into() },
                ProviderChunk::Finished { usage: None },
            ]
        } else {
            vec![
                ProviderChunk::TextDelta("2 + 2 is 4.".into()),
                ProviderChunk::Finished { usage: None },
            ]
        };
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut registry = ToolRegistry::new();
    registry.register(tool("add", "Adds two numbers").param("a", "number").param("b", "number").build(
        |args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!(a + b))
        },
    ));

    let chain = MiddlewareChain::new(
        Default::default(),
        Duration::from_secs(30),
        Default::default(),
        Default::default(),
    );
    let agent_loop = AgentLoop::new(Arc::new(ScriptedProvider), chain);

    let manager = SessionManager::new(Arc::new(InMemorySessionStore::new()));
    manager.create_session("s1", 0).await?;
    let mut branch = manager.load("s1", "main").await?;
    branch.messages.push(Message::user("what is 2 + 2?"));

    let bus = EventBus::new(256);
    let mut events = bus.subscribe();
    let config = AgentLoopConfig::default();
    let cancel = CancellationToken::new();

    let answer_permission_requests = async {
        while let Ok(event) = events.recv().await {
            match event {
                Event::PermissionRequest {
                    permission_id,
                    tool_name,
                    ..
                } => {
                    println!("approving '{tool_name}' for the rest of this run");
                    bus.respond(
                        &permission_id,
                        Event::PermissionResponse {
                            permission_id,
                            choice: PermissionChoice::AllowAlways,
                        },
                    );
                }
                Event::ToolCallResult { call_id, result, .. } => {
                    println!("tool call {call_id} returned {result}");
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        result = agent_loop.run(&mut branch, &registry, &bus, &config, &cancel) => {
            result?;
        }
        _ = answer_permission_requests => {}
    }

    println!("final answer: {}", branch.messages.last().unwrap().text());
    manager.persist_branch(&branch).await?;

    Ok(())
}
