//! Core conversational data model: messages and their content items.
//!
//! `spec.md` §3 describes a closed sum of content-item kinds rather than the
//! flat-string-or-OpenAI-format split the teacher crate used for a single
//! vendor wire protocol. [`ContentItem`] is that closed sum; [`Message`]
//! pairs it with a role exactly as the data model specifies: tool-role
//! messages carry only [`ContentItem::FunctionResult`] items whose call ids
//! must match a prior assistant [`ContentItem::FunctionCall`] in the same
//! branch (enforced by [`crate::agent_loop::AgentLoop`], not by this type).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One piece of a message's content.
///
/// Modeled as a closed sum with an external `type` discriminator, matching
/// the event wire format's tagging convention (`spec.md` §6) so the same
/// `#[serde(tag = "type")]` style is used crate-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    /// User-visible natural language text.
    Text(TextContent),
    /// Extended-thinking text, kept separate from user-visible text so
    /// clients can choose whether to render it.
    Reasoning(ReasoningContent),
    /// A request from the assistant to invoke a tool.
    FunctionCall(FunctionCallContent),
    /// The result of a previously requested tool invocation.
    FunctionResult(FunctionResultContent),
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text(TextContent { text: text.into() })
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        ContentItem::Reasoning(ReasoningContent { text: text.into() })
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        ContentItem::FunctionCall(FunctionCallContent {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        })
    }

    pub fn function_result(call_id: impl Into<String>, result: Value) -> Self {
        ContentItem::FunctionResult(FunctionResultContent {
            call_id: call_id.into(),
            result,
        })
    }

    /// Call id of this item, for the two content kinds that carry one.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ContentItem::FunctionCall(c) => Some(&c.call_id),
            ContentItem::FunctionResult(c) => Some(&c.call_id),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentItem::Text(t) => Some(&t.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallContent {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResultContent {
    pub call_id: String,
    pub result: Value,
}

/// One message in a branch's history.
///
/// Invariant (enforced by callers that build tool-role messages, notably
/// [`crate::agent_loop::AgentLoop`] step 5): a `Tool`-role message's content
/// is entirely [`ContentItem::FunctionResult`] items, and every `call_id`
/// among them matches a `FunctionCall` emitted by a prior `Assistant`
/// message still visible in the same branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentItem>,
}

impl Message {
    pub fn new(role: MessageRole, content: Vec<ContentItem>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: vec![ContentItem::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentItem::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentItem>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    /// Builds the single tool-role message that aggregates every result from
    /// one iteration's parallel tool dispatch (`spec.md` §4.8 step 5). The
    /// caller is responsible for passing results in the original call order;
    /// this constructor does not reorder them.
    pub fn tool_results(results: Vec<FunctionResultContent>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: results.into_iter().map(ContentItem::FunctionResult).collect(),
        }
    }

    /// All function calls present in this message, in content order.
    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCallContent> {
        self.content.iter().filter_map(|c| match c {
            ContentItem::FunctionCall(f) => Some(f),
            _ => None,
        })
    }

    /// True if this is an assistant message with no function calls — the
    /// natural-stop condition in `spec.md` §4.8 step 3.
    pub fn has_function_calls(&self) -> bool {
        self.function_calls().next().is_some()
    }

    /// Concatenation of every [`ContentItem::Text`] item, in order. Used by
    /// the reference provider adapter and by tests asserting on assembled
    /// text.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentItem::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_constructors() {
        let sys = Message::system("be concise");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.text(), "be concise");

        let user = Message::user("hello");
        assert_eq!(user.role, MessageRole::User);

        let asst = Message::assistant(vec![ContentItem::text("hi there")]);
        assert_eq!(asst.role, MessageRole::Assistant);
        assert!(!asst.has_function_calls());
    }

    #[test]
    fn tool_results_aggregates_in_order() {
        let msg = Message::tool_results(vec![
            FunctionResultContent {
                call_id: "call_1".into(),
                result: json!("first"),
            },
            FunctionResultContent {
                call_id: "call_2".into(),
                result: json!("second"),
            },
        ]);
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.content.len(), 2);
        assert_eq!(msg.content[0].call_id(), Some("call_1"));
        assert_eq!(msg.content[1].call_id(), Some("call_2"));
    }

    #[test]
    fn has_function_calls_detects_tool_use() {
        let msg = Message::assistant(vec![
            ContentItem::text("let me check"),
            ContentItem::function_call("call_1", "get_weather", json!({"city": "Seattle"})),
        ]);
        assert!(msg.has_function_calls());
        let calls: Vec<_> = msg.function_calls().collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
    }

    #[test]
    fn content_item_serde_tagging() {
        let item = ContentItem::text("hello");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");

        let call = ContentItem::function_call("c1", "search", json!({"q": "rust"}));
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function_call");
        assert_eq!(json["name"], "search");
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::assistant(vec![
            ContentItem::reasoning("thinking..."),
            ContentItem::text("done"),
        ]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
