//! S5 — a container tool's invocation reveals previously hidden tools and is
//! then stripped from persisted history ("immediate transparency").

use agent_runtime::event_bus::{Event, PermissionChoice};
use agent_runtime::middleware::ErrorVerbosity;
use agent_runtime::provider::{ChatOptions, Provider, ProviderChunk, ProviderStream};
use agent_runtime::session::Branch;
use agent_runtime::tools::{ToolRegistry, tool};
use agent_runtime::{
    AgentLoop, AgentLoopConfig, CancellationToken, EventBus, MiddlewareChain, Message, MessageRole,
    RetryConfig,
};
use async_trait::async_trait;
use futures::stream;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

struct ScriptedProvider {
    responses: StdMutex<Vec<Vec<ProviderChunk>>>,
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(
        &self,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<ProviderStream, agent_runtime::ProviderErrorDetails> {
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
        Default::default(),
    )
}

#[tokio::test]
async fn expanding_a_container_reveals_its_tools_and_is_stripped_from_history() {
    let provider = Arc::new(ScriptedProvider {
        responses: StdMutex::new(vec![
            // Iteration 1: open the "toolbox" container.
            vec![
                ProviderChunk::ToolCallStart {
                    call_id: "open1".into(),
                    name: "toolbox".into(),
                },
                ProviderChunk::ToolCallArgsDelta {
                    call_id: "open1".into(),
                    delta: "{}".into(),
                },
                ProviderChunk::ToolCallEnd { call_id: "open1".into() },
                ProviderChunk::Finished { usage: None },
            ],
            // Iteration 2: now that "inner" is visible, call it.
            vec![
                ProviderChunk::ToolCallStart {
                    call_id: "inner1".into(),
                    name: "inner".into(),
                },
                ProviderChunk::ToolCallArgsDelta {
                    call_id: "inner1".into(),
                    delta: "{}".into(),
                },
                ProviderChunk::ToolCallEnd { call_id: "inner1".into() },
                ProviderChunk::Finished { usage: None },
            ],
            // Iteration 3: done.
            vec![
                ProviderChunk::TextDelta("all set".into()),
                ProviderChunk::Finished { usage: None },
            ],
        ]),
    });

    let mut registry = ToolRegistry::new();
    registry.register(
        tool("toolbox", "a bundle of tools").container(vec!["inner".into()], "toolbox opened"),
    );
    registry.register(tool("inner", "a previously hidden tool").build(|_args| async move {
        Ok(serde_json::json!("inner ran"))
    }));

    let agent_loop = AgentLoop::new(provider, chain());
    let bus = EventBus::new(256);
    let mut events = bus.subscribe();
    let mut branch = Branch::main("s1", 0);
    branch.messages.push(Message::user("open the toolbox and use inner"));
    let config = AgentLoopConfig::default();
    let cancel = CancellationToken::new();

    let auto_approve = async {
        while let Ok(event) = events.recv().await {
            if let Event::PermissionRequest { permission_id, .. } = event {
                bus.respond(
                    &permission_id,
                    Event::PermissionResponse {
                        permission_id,
                        choice: PermissionChoice::AllowAlways,
                    },
                );
            }
        }
    };

    tokio::select! {
        result = agent_loop.run(&mut branch, &registry, &bus, &config, &cancel) => {
            result.unwrap();
        }
        _ = auto_approve => {}
    }

    // The container's call/result never shows up in persisted history —
    // "immediate transparency".
    assert!(
        branch.messages.iter().all(|m| m
            .content
            .iter()
            .all(|c| c.call_id() != Some("open1"))),
        "the toolbox expansion call/result must be stripped from history"
    );

    // "inner" ran for real and left its call/result in history.
    let inner_result = branch
        .messages
        .iter()
        .find(|m| m.role == MessageRole::Tool && m.content.iter().any(|c| c.call_id() == Some("inner1")))
        .expect("inner's tool-result message must survive in history");
    assert_eq!(inner_result.content[0].call_id(), Some("inner1"));

    assert_eq!(branch.messages.last().unwrap().text(), "all set");
}
