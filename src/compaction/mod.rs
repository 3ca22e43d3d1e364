//! History compaction: deciding when the context is too large, choosing what
//! to drop, and replacing it with a generated summary entry.

mod cut;
mod engine;
mod file_ops;
pub mod summarize;

pub use cut::{find_cut_point, prepare_compaction, CompactionPreparation, CutPoint};
pub use engine::{CompactionEngine, CompactionResult};
pub use file_ops::{extract_file_operations, FileOperationSet};
pub use summarize::{serialize_messages_for_summary, Summarizer};

use chrono::{DateTime, Utc};

use crate::config::CompactionSettings;
use crate::session::context::{wrap_branch_summary, wrap_compaction_summary};
use crate::session::{EntryPayload, SessionContext, SessionEntry};
use crate::types::{ContentBlock, Message, StopReason, ToolContent};

pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4)
}

fn estimate_json_tokens(value: &serde_json::Value) -> usize {
    if value.is_null() {
        return 0;
    }
    estimate_text_tokens(&serde_json::to_string(value).unwrap_or_default())
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = 4usize;
    match message {
        Message::User { content, .. } => tokens += estimate_text_tokens(content),
        Message::Assistant(assistant) => {
            for block in &assistant.content {
                tokens += match block {
                    ContentBlock::Text { text } => estimate_text_tokens(text),
                    ContentBlock::Reasoning { text, signature } => {
                        estimate_text_tokens(text)
                            + signature.as_deref().map(estimate_text_tokens).unwrap_or(0)
                    }
                    ContentBlock::ToolCall(call) => {
                        estimate_text_tokens(&call.name) + estimate_json_tokens(&call.arguments) + 8
                    }
                };
            }
        }
        Message::ToolResult(result) => {
            tokens += estimate_text_tokens(&result.tool_call_id) + 8;
            for part in &result.content {
                tokens += match part {
                    ToolContent::Text { text } => estimate_text_tokens(text),
                    ToolContent::Image { data, .. } => estimate_text_tokens(data) + 8,
                };
            }
        }
        Message::Custom { payload, .. } => tokens += estimate_json_tokens(payload),
    }
    tokens
}

/// Estimated cost of keeping an entry in the materialized context.
/// Entries that never materialize cost nothing.
pub fn estimate_entry_tokens(entry: &SessionEntry) -> usize {
    match &entry.payload {
        EntryPayload::Message { message } => estimate_message_tokens(message),
        EntryPayload::CompactionSummary(record) => {
            estimate_text_tokens(&wrap_compaction_summary(&record.summary)) + 4
        }
        EntryPayload::BranchMarker {
            summary: Some(summary),
            ..
        } => estimate_text_tokens(&wrap_branch_summary(summary)) + 4,
        _ => 0,
    }
}

/// Estimated size of a message sequence.
///
/// The most recent successful assistant message that reports usage anchors the
/// estimate: its usage total covers everything up to it, and only the messages
/// after it are estimated.
pub fn estimate_context_tokens(messages: &[Message]) -> usize {
    estimate_with_usage_since(messages, None)
}

/// Like [`estimate_context_tokens`], but ignores usage reported before the
/// context's latest compaction, which measured history that is now summarized.
pub fn estimate_session_tokens(context: &SessionContext) -> usize {
    let since = context
        .latest_compaction
        .as_ref()
        .and_then(|_| context.messages.first())
        .map(Message::timestamp);
    estimate_with_usage_since(&context.messages, since)
}

fn estimate_with_usage_since(messages: &[Message], since: Option<DateTime<Utc>>) -> usize {
    let anchor = messages.iter().rposition(|message| {
        message.as_assistant().is_some_and(|assistant| {
            !matches!(
                assistant.stop_reason,
                StopReason::Error | StopReason::Aborted
            ) && !assistant.usage.is_zero()
                && since.map_or(true, |since| assistant.timestamp > since)
        })
    });
    match anchor {
        Some(index) => {
            let reported = messages[index]
                .as_assistant()
                .map(|assistant| assistant.usage.total() as usize)
                .unwrap_or_default();
            reported
                + messages[index + 1..]
                    .iter()
                    .map(estimate_message_tokens)
                    .sum::<usize>()
        }
        None => messages.iter().map(estimate_message_tokens).sum(),
    }
}

/// True when `tokens` leaves less than the reserve free in the window.
pub fn should_compact(tokens: usize, context_window: usize, settings: &CompactionSettings) -> bool {
    settings.enabled && tokens > context_window.saturating_sub(settings.reserve_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantMessage, ToolCall, Usage};
    use pretty_assertions::assert_eq;

    #[test]
    fn text_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn tool_calls_carry_fixed_overhead() {
        let message: Message = AssistantMessage::new(
            vec![ContentBlock::ToolCall(ToolCall::new(
                "c1",
                "read",
                serde_json::json!({}),
            ))],
            StopReason::ToolUse,
        )
        .into();
        // 4 message + 1 name + 1 "{}" + 8 call
        assert_eq!(estimate_message_tokens(&message), 14);
    }

    #[test]
    fn budget_example_triggers_compaction() {
        let settings = CompactionSettings {
            enabled: true,
            reserve_tokens: 20,
            keep_recent_tokens: 50,
        };
        assert!(should_compact(90, 100, &settings));
        assert!(!should_compact(80, 100, &settings));
        assert!(!should_compact(
            90,
            100,
            &CompactionSettings {
                enabled: false,
                ..settings
            }
        ));
    }

    #[test]
    fn context_estimate_anchors_on_last_reported_usage() {
        let usage = Usage {
            input_tokens: 900,
            output_tokens: 100,
            ..Usage::default()
        };
        let messages = vec![
            Message::user("x".repeat(400)),
            AssistantMessage::text_only("ok").with_usage(usage).into(),
            Message::user("abcd"),
        ];
        assert_eq!(estimate_context_tokens(&messages), 1000 + 5);

        let mut failed = AssistantMessage::text_only("").with_usage(usage);
        failed.stop_reason = StopReason::Error;
        let messages = vec![Message::user("abcd"), failed.into()];
        assert_eq!(estimate_context_tokens(&messages), 5 + 4);
    }
}
