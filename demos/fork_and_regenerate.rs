//! Fork-and-regenerate example
//!
//! Shows the ChatGPT-style "regenerate this response" flow: fork a branch at
//! the message index right after the user's turn, producing a sibling that
//! shares the prefix up to that point but can be driven independently.

use agent_runtime::session::{InMemorySessionStore, SessionManager};
use agent_runtime::types::Message;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let manager = SessionManager::new(Arc::new(InMemorySessionStore::new()));
    manager.create_session("s1", 0).await?;

    let mut main_branch = manager.load("s1", "main").await?;
    main_branch.messages.push(Message::user("Tell me a fact about otters."));
    main_branch
        .messages
        .push(Message::assistant(vec![agent_runtime::ContentItem::text(
            "Otters hold hands while sleeping so they don't drift apart.",
        )]));
    manager.persist_branch(&main_branch).await?;

    // The user didn't like that answer — fork right after their question
    // (index 1, exclusive of the assistant reply) and regenerate.
    let mut regenerated = manager
        .fork_branch_at_message("s1", "main", 1, "regen-1")
        .await?;
    assert_eq!(regenerated.messages.len(), 1);
    regenerated
        .messages
        .push(Message::assistant(vec![agent_runtime::ContentItem::text(
            "Otters have a pocket of loose skin under each foreleg to store rocks and food.",
        )]));
    manager.persist_branch(&regenerated).await?;

    println!(
        "regen-1 forked from {:?} at message index {:?}",
        regenerated.parent_id, regenerated.forked_at_message_index
    );
    println!("main:  {}", main_branch.messages.last().unwrap().text());
    println!("regen: {}", regenerated.messages.last().unwrap().text());

    // Switching the session's active branch is how a client tells the
    // runtime which sibling subsequent turns should extend.
    let session = manager.activate_branch("s1", "regen-1").await?;
    println!("active branch is now: {}", session.active_branch_id);

    Ok(())
}
