//! Token-budget-aware history compaction (`spec.md` §4.7).
//!
//! Generalizes the teacher's `context.rs` (`estimate_tokens`/
//! `truncate_messages`/`is_approaching_limit`, character-based
//! approximation over `ContentBlock`) to this crate's [`crate::types::ContentItem`]
//! sum type, and turns the teacher's opt-in manual helpers into the pure
//! `reduce` function `spec.md` §4.7 specifies, driven automatically by
//! [`crate::middleware::history_reduction::HistoryReductionMiddleware`].

use crate::types::{ContentItem, Message, MessageRole};

/// Configuration for [`reduce`], enumerated exactly as `spec.md` §4.7 lists.
#[derive(Debug, Clone)]
pub struct HistoryReductionConfig {
    pub enabled: bool,
    /// Model-specific maximum context size, in estimated tokens.
    pub context_window_size: Option<usize>,
    /// Fraction of `context_window_size` that triggers a reduction pass.
    /// Must exceed `preserve_percentage`.
    pub trigger_percentage: f32,
    /// Fraction of `context_window_size` to compact down to.
    pub preserve_percentage: f32,
    /// Used only when `context_window_size` is `None` (see
    /// [`HistoryReductionConfig::effective_mode`]).
    pub target_message_count: usize,
    /// If, after percentage-based compaction, the message count still
    /// exceeds this, the compacted middle is replaced by one summary
    /// message instead of being dropped outright.
    pub summarization_threshold: Option<usize>,
}

impl Default for HistoryReductionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            context_window_size: None,
            trigger_percentage: 0.9,
            preserve_percentage: 0.5,
            target_message_count: 40,
            summarization_threshold: None,
        }
    }
}

enum Mode {
    Percentage { window: usize },
    MessageCount { target: usize },
}

impl HistoryReductionConfig {
    /// Resolves the Open Question `spec.md` §9 leaves ambiguous: percentage
    /// mode wins whenever `context_window_size` is `Some`; `target_message_count`
    /// is the fallback only when it is `None`. Recorded as a fixed design
    /// decision in `DESIGN.md`.
    fn effective_mode(&self) -> Mode {
        match self.context_window_size {
            Some(window) => Mode::Percentage { window },
            None => Mode::MessageCount {
                target: self.target_message_count,
            },
        }
    }
}

/// Character-based token approximation (1 token ≈ 4 characters), carried
/// over from the teacher's `estimate_tokens` and extended to
/// [`ContentItem::Reasoning`]/[`ContentItem::FunctionCall`]/
/// [`ContentItem::FunctionResult`].
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0usize;
    for message in messages {
        total_chars += 8; // role formatting overhead
        for item in &message.content {
            total_chars += match item {
                ContentItem::Text(t) => t.text.len(),
                ContentItem::Reasoning(r) => r.text.len(),
                ContentItem::FunctionCall(c) => {
                    c.name.len() + c.call_id.len() + c.arguments.to_string().len()
                }
                ContentItem::FunctionResult(r) => r.call_id.len() + r.result.to_string().len(),
            };
        }
    }
    total_chars += 16; // conversation-level overhead
    total_chars.div_ceil(4)
}

/// Result of a [`reduce`] pass.
pub struct Reduction {
    pub messages: Vec<Message>,
    pub summary_inserted: bool,
}

/// A call-id a message's content references, either as the originating
/// function call or as its matching result.
fn referenced_call_ids(message: &Message) -> impl Iterator<Item = &str> {
    message.content.iter().filter_map(ContentItem::call_id)
}

/// `spec.md` §4.7's invariant: if the last message before compaction is a
/// tool-result for call-id `X`, the function-call with `X` must survive.
/// Returns the index of the earliest message that must be preserved to
/// satisfy that invariant, or `messages.len()` if it doesn't apply.
fn earliest_index_required_by_trailing_tool_result(messages: &[Message]) -> usize {
    let Some(last) = messages.last() else {
        return messages.len();
    };
    if last.role != MessageRole::Tool {
        return messages.len();
    }
    let trailing_ids: Vec<&str> = referenced_call_ids(last).collect();
    if trailing_ids.is_empty() {
        return messages.len();
    }
    for (i, message) in messages.iter().enumerate() {
        if message.role == MessageRole::Assistant
            && referenced_call_ids(message).any(|id| trailing_ids.contains(&id))
        {
            return i;
        }
    }
    messages.len()
}

/// Compacts `messages` per `config`. Pure: no I/O, no summarization model
/// call (`spec.md` §4.7 describes summarization as "delegated external" —
/// this function performs the truncation half and marks where a caller may
/// splice in a generated summary via `summary_inserted`/the returned index
/// convention below).
///
/// Always preserves: the leading system message (if present), the latest
/// user message, and whatever prefix [`earliest_index_required_by_trailing_tool_result`]
/// demands.
pub fn reduce(messages: &[Message], config: &HistoryReductionConfig) -> Reduction {
    if !config.enabled || messages.is_empty() {
        return Reduction {
            messages: messages.to_vec(),
            summary_inserted: false,
        };
    }

    let should_reduce = match config.effective_mode() {
        Mode::Percentage { window } => {
            let estimated = estimate_tokens(messages);
            estimated as f32 > window as f32 * config.trigger_percentage
        }
        Mode::MessageCount { target } => messages.len() > target,
    };
    if !should_reduce {
        return Reduction {
            messages: messages.to_vec(),
            summary_inserted: false,
        };
    }

    let keep_count = match config.effective_mode() {
        Mode::Percentage { window } => {
            let budget = (window as f32 * config.preserve_percentage) as usize;
            // Walk backward accumulating estimated tokens until the budget
            // is spent, rather than a fixed message count.
            let mut kept = 0usize;
            let mut spent = 0usize;
            for message in messages.iter().rev() {
                let cost = estimate_tokens(std::slice::from_ref(message));
                if spent + cost > budget && kept > 0 {
                    break;
                }
                spent += cost;
                kept += 1;
            }
            kept.max(1)
        }
        Mode::MessageCount { target } => target.min(messages.len()),
    };

    let has_system = messages[0].role == MessageRole::System;
    let required_start = earliest_index_required_by_trailing_tool_result(messages)
        .min(messages.len().saturating_sub(keep_count));

    let tail_start = messages
        .len()
        .saturating_sub(keep_count)
        .min(required_start);

    let mut result = Vec::new();
    if has_system {
        result.push(messages[0].clone());
    }

    let body_start = if has_system { tail_start.max(1) } else { tail_start };
    let dropped = body_start.saturating_sub(if has_system { 1 } else { 0 });
    let summary_inserted = config
        .summarization_threshold
        .is_some_and(|threshold| dropped > 0 && messages.len() > threshold);

    if summary_inserted {
        result.push(Message::system(format!(
            "[history reduced: {dropped} earlier messages omitted]"
        )));
    }

    result.extend_from_slice(&messages[body_start..]);

    Reduction {
        messages: result,
        summary_inserted,
    }
}

/// Convenience combining [`estimate_tokens`] with a limit/margin check, kept
/// from the teacher's `is_approaching_limit` for callers that want a cheap
/// check without running a full [`reduce`] pass.
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estimate_tokens_empty_is_zero() {
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn estimate_tokens_grows_with_content() {
        let short = vec![Message::user("hi")];
        let long = vec![Message::user("x".repeat(1000))];
        assert!(estimate_tokens(&long) > estimate_tokens(&short));
    }

    #[test]
    fn disabled_config_is_a_no_op() {
        let messages = vec![Message::user("a"), Message::user("b")];
        let config = HistoryReductionConfig {
            enabled: false,
            ..Default::default()
        };
        let reduction = reduce(&messages, &config);
        assert_eq!(reduction.messages.len(), 2);
        assert!(!reduction.summary_inserted);
    }

    #[test]
    fn message_count_mode_used_when_no_context_window() {
        let mut messages = vec![Message::system("be helpful")];
        for i in 0..10 {
            messages.push(Message::user(format!("message {i}")));
        }
        let config = HistoryReductionConfig {
            enabled: true,
            context_window_size: None,
            target_message_count: 4,
            ..Default::default()
        };
        let reduction = reduce(&messages, &config);
        assert!(reduction.messages.len() < messages.len());
        assert_eq!(reduction.messages[0].role, MessageRole::System);
    }

    #[test]
    fn percentage_mode_wins_when_context_window_is_set() {
        let mut messages = vec![Message::system("sys")];
        for i in 0..50 {
            messages.push(Message::user(format!("msg {i}")));
        }
        let config = HistoryReductionConfig {
            enabled: true,
            context_window_size: Some(200), // tiny window forces a trigger
            trigger_percentage: 0.5,
            preserve_percentage: 0.3,
            target_message_count: 1000, // would not trigger alone
            ..Default::default()
        };
        let reduction = reduce(&messages, &config);
        assert!(reduction.messages.len() < messages.len());
    }

    #[test]
    fn trailing_tool_result_keeps_its_function_call() {
        let mut messages = vec![Message::system("sys")];
        for i in 0..20 {
            messages.push(Message::user(format!("filler {i}")));
        }
        messages.push(Message::assistant(vec![ContentItem::function_call(
            "call_1",
            "get_weather",
            json!({"city": "Seattle"}),
        )]));
        messages.push(Message::tool_results(vec![
            crate::types::FunctionResultContent {
                call_id: "call_1".into(),
                result: json!("sunny"),
            },
        ]));

        let config = HistoryReductionConfig {
            enabled: true,
            context_window_size: None,
            target_message_count: 2,
            ..Default::default()
        };
        let reduction = reduce(&messages, &config);
        let has_call = reduction
            .messages
            .iter()
            .any(|m| m.function_calls().any(|c| c.call_id == "call_1"));
        assert!(has_call, "function call for trailing tool result must survive");
    }

    #[test]
    fn is_approaching_limit_respects_margin() {
        let messages = vec![Message::user("x".repeat(1000))];
        assert!(!is_approaching_limit(&messages, 1000, 0.9));
        assert!(is_approaching_limit(&messages, 200, 0.9));
    }
}
