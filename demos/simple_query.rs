//! Simple query example
//!
//! Demonstrates the minimum wiring needed to run one message turn against a
//! local OpenAI-compatible server and print the streamed response.

use agent_runtime::event_bus::Event;
use agent_runtime::providers::openai_compatible::{OpenAiCompatibleConfig, OpenAiCompatibleProvider};
use agent_runtime::session::{InMemorySessionStore, SessionManager};
use agent_runtime::tools::ToolRegistry;
use agent_runtime::types::Message;
use agent_runtime::{AgentLoop, AgentLoopConfig, CancellationToken, EventBus, MiddlewareChain};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let provider = Arc::new(OpenAiCompatibleProvider::new(OpenAiCompatibleConfig {
        base_url: "http://localhost:11434/v1".into(),
        model: "qwen3:8b".into(),
        api_key: String::new(),
        request_timeout: Duration::from_secs(120),
    }));

    let chain = MiddlewareChain::new(
        Default::default(),
        Duration::from_secs(30),
        Default::default(),
        Default::default(),
    );
    let agent_loop = AgentLoop::new(provider, chain);

    let manager = SessionManager::new(Arc::new(InMemorySessionStore::new()));
    manager.create_session("s1", 0).await?;
    let mut branch = manager.load("s1", "main").await?;
    branch
        .messages
        .push(Message::user("What's the capital of France? Please be brief."));

    let bus = EventBus::new(256);
    let mut events = bus.subscribe();
    let registry = ToolRegistry::new();
    let config = AgentLoopConfig {
        instructions: Some("You are a helpful assistant".to_string()),
        ..AgentLoopConfig::default()
    };
    let cancel = CancellationToken::new();

    println!("Sending query to model...\n");
    print!("Response: ");

    let print_deltas = async {
        while let Ok(event) = events.recv().await {
            if let Event::TextMessageDelta { delta, .. } = event {
                print!("{delta}");
                std::io::Write::flush(&mut std::io::stdout()).ok();
            }
        }
    };

    tokio::select! {
        result = agent_loop.run(&mut branch, &registry, &bus, &config, &cancel) => {
            result?;
        }
        _ = print_deltas => {}
    }

    manager.persist_branch(&branch).await?;
    println!("\n\nQuery complete!");

    Ok(())
}
