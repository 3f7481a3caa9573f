//! Container/skill visibility and "immediate transparency" (`spec.md` §4.4,
//! §4.5). Hooks `beforeToolExecution` (expanding a container on invocation)
//! and `afterMessageTurn` (stripping the expansion call/result from
//! persisted history); `beforeIteration`'s tool/prompt filtering is driven
//! by [`crate::tools::ToolRegistry`] directly via [`MiddlewareChain::before_iteration`](super::MiddlewareChain::before_iteration),
//! with this middleware only contributing the system-prompt half.

use crate::tools::ToolRegistry;
use crate::types::{ContentItem, Message, MessageRole};
use std::collections::HashSet;

#[derive(Default)]
pub struct ContainerMiddleware;

impl ContainerMiddleware {
    pub fn new() -> Self {
        Self
    }

    /// Expands `name`, marking it as expanded on `expanded` and returning
    /// the text fed back to the model as that call's function result.
    /// Idempotent: expanding an already-expanded container just re-returns
    /// its `function_result_text`.
    pub fn expand(
        &self,
        name: &str,
        registry: &ToolRegistry,
        expanded: &mut HashSet<String>,
    ) -> String {
        let Some(expansion) = registry.expansion(name) else {
            log::warn!("attempted to expand '{name}', which is not a container or skill tool");
            return format!("'{name}' is not a container or skill tool.");
        };
        if expanded.insert(name.to_string()) {
            log::debug!("expanded container '{name}', revealing {:?}", expansion.referenced_tools);
        }
        expansion.function_result_text
    }

    /// System-prompt fragments contributed by every currently-expanded
    /// skill. Containers (non-skill) contribute nothing here.
    pub fn active_system_prompts(&self, registry: &ToolRegistry, expanded: &HashSet<String>) -> Vec<String> {
        expanded
            .iter()
            .filter_map(|name| registry.expansion(name))
            .filter_map(|expansion| expansion.system_prompt_text)
            .collect()
    }

    /// "Immediate transparency" (`spec.md` §4.5 ContainerMiddleware point 3):
    /// once a turn ends, the function-call/function-result pair that
    /// expanded a container is stripped from the persisted history so it
    /// never occupies context budget on a later turn. Messages left with no
    /// content after stripping are dropped entirely.
    pub fn strip_container_traffic(&self, messages: &[Message], container_call_ids: &HashSet<String>) -> Vec<Message> {
        messages
            .iter()
            .filter_map(|message| {
                let retained: Vec<ContentItem> = message
                    .content
                    .iter()
                    .filter(|item| !item.call_id().is_some_and(|id| container_call_ids.contains(id)))
                    .cloned()
                    .collect();

                if retained.is_empty() && message.role != MessageRole::System && message.role != MessageRole::User {
                    None
                } else if retained.is_empty() {
                    Some(message.clone())
                } else {
                    Some(Message::new(message.role, retained))
                }
            })
            .collect()
    }
}
