//! Summary generation for compaction.
//!
//! The summarizer makes a plain completion call over a transient transcript.
//! It sends no tool definitions and never touches the session it summarizes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::cut::CompactionPreparation;
use super::file_ops::FileOperationSet;
use crate::error::{Result, StrandError};
use crate::provider::{complete, GenerationSettings, ModelClient, ModelRequest};
use crate::types::{ContentBlock, Message, ToolContent};
use crate::util::retry::RetryPolicy;

pub const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are a context summarization assistant. \
You read a transcript of a conversation between a user and an AI coding agent and write a \
structured summary that another instance of the agent will use to continue the work. \
Do not continue the conversation and do not answer questions found in the transcript. \
Only output the summary.";

const SUMMARY_FORMAT: &str = "Use this format:

## Goal
- What the user is trying to accomplish.

## Constraints
- Requirements, preferences and limits stated by the user.

## Progress
- What has been done, with concrete results.

## Decisions
- Choices made and the reasons given for them.

## Next Steps
- What remains, in order.

## Critical Context
- Exact identifiers, file paths, error messages and values needed to continue.

Be concise. Prefer bullets. Keep exact names and paths.";

const INITIAL_SUMMARY_PROMPT: &str =
    "Summarize the conversation above so the work can continue from the summary alone.";

const UPDATE_SUMMARY_PROMPT: &str = "The conversation above continues from the previous \
summary. Produce an updated summary that merges the previous summary with the new \
messages. Keep everything from the previous summary that is still relevant, move \
finished items to Progress and update Next Steps.";

const TURN_PREFIX_PROMPT: &str = "The messages above are the opening of a turn whose later \
part is kept verbatim. Summarize what the user asked and what was done so far in this \
turn, so the kept part makes sense. Be brief: a short Goal and Progress section is enough.";

const TOOL_RESULT_CHAR_LIMIT: usize = 2_000;

/// Render messages as plain transcript lines for the summarization prompt.
pub fn serialize_messages_for_summary(messages: &[Message]) -> String {
    let mut lines = Vec::new();

    for message in messages {
        match message {
            Message::User { content, .. } => lines.push(format!("[user] {content}")),
            Message::Assistant(assistant) => {
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text { text } if !text.is_empty() => {
                            lines.push(format!("[assistant] {text}"));
                        }
                        ContentBlock::Reasoning { text, .. } if !text.is_empty() => {
                            lines.push(format!("[assistant.thinking] {text}"));
                        }
                        ContentBlock::ToolCall(call) => {
                            let args = serde_json::to_string(&call.arguments)
                                .unwrap_or_else(|_| "{}".to_string());
                            lines.push(format!("[assistant.tool_call] {} {}", call.name, args));
                        }
                        _ => {}
                    }
                }
            }
            Message::ToolResult(result) => {
                let mut text = String::new();
                for part in &result.content {
                    match part {
                        ToolContent::Text { text: part } => text.push_str(part),
                        ToolContent::Image { .. } => text.push_str("[image]"),
                    }
                }
                lines.push(format!(
                    "[tool] id={} name={} is_error={} result={}",
                    result.tool_call_id,
                    result.tool_name,
                    result.is_error,
                    truncate_chars(&text, TOOL_RESULT_CHAR_LIMIT)
                ));
            }
            Message::Custom { custom_type, .. } => {
                lines.push(format!("[custom] {custom_type} <omitted>"));
            }
        }
    }

    lines.join("\n")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!(
            "{}... [{} more characters truncated]",
            &text[..cut],
            text[cut..].chars().count()
        ),
        None => text.to_string(),
    }
}

/// Append the file manifest in the tagged form later compactions read back.
fn append_file_sections(summary: &mut String, file_ops: &FileOperationSet) {
    let read: Vec<&String> = file_ops.read_only().collect();
    if !read.is_empty() {
        summary.push_str("\n\n<read-files>\n");
        for path in read {
            summary.push_str(path);
            summary.push('\n');
        }
        summary.push_str("</read-files>");
    }
    if !file_ops.modified_files.is_empty() {
        summary.push_str("\n\n<modified-files>\n");
        for path in &file_ops.modified_files {
            summary.push_str(path);
            summary.push('\n');
        }
        summary.push_str("</modified-files>");
    }
}

/// Generates compaction summaries with a model.
#[derive(Clone)]
pub struct Summarizer {
    client: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    settings: GenerationSettings,
}

impl Summarizer {
    pub fn new(client: Arc<dyn ModelClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Summary text for a prepared compaction, including the file manifest.
    pub async fn summarize(
        &self,
        preparation: &CompactionPreparation,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let history = if preparation.messages_to_summarize.is_empty() {
            preparation.previous_summary.clone()
        } else {
            Some(
                self.summarize_history(
                    &preparation.messages_to_summarize,
                    preparation.previous_summary.as_deref(),
                    cancel,
                )
                .await?,
            )
        };

        let mut summary = if preparation.split_turn && !preparation.turn_prefix_messages.is_empty()
        {
            let prefix = self
                .complete_prompt(
                    format!(
                        "<conversation>\n{}\n</conversation>\n\n{TURN_PREFIX_PROMPT}",
                        serialize_messages_for_summary(&preparation.turn_prefix_messages)
                    ),
                    cancel,
                )
                .await?;
            match history {
                Some(history) => {
                    format!("{history}\n\n---\n\n**Turn Context (split turn):**\n\n{prefix}")
                }
                None => format!("**Turn Context (split turn):**\n\n{prefix}"),
            }
        } else {
            history.unwrap_or_else(|| "No prior history.".to_string())
        };

        append_file_sections(&mut summary, &preparation.file_ops);
        Ok(summary)
    }

    async fn summarize_history(
        &self,
        messages: &[Message],
        previous_summary: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let transcript = serialize_messages_for_summary(messages);
        let prompt = match previous_summary {
            Some(previous) => format!(
                "<conversation>\n{transcript}\n</conversation>\n\n<previous-summary>\n{previous}\n</previous-summary>\n\n{UPDATE_SUMMARY_PROMPT}\n\n{SUMMARY_FORMAT}"
            ),
            None => format!(
                "<conversation>\n{transcript}\n</conversation>\n\n{INITIAL_SUMMARY_PROMPT}\n\n{SUMMARY_FORMAT}"
            ),
        };
        self.complete_prompt(prompt, cancel).await
    }

    async fn complete_prompt(&self, prompt: String, cancel: &CancellationToken) -> Result<String> {
        let request = ModelRequest {
            system_prompt: Some(SUMMARIZATION_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            settings: self.settings.clone(),
        };
        let client = self.client.as_ref();
        let attempt = self
            .retry
            .execute(|| complete(client, &request, cancel.clone()));
        let message = tokio::select! {
            _ = cancel.cancelled() => return Err(StrandError::Aborted),
            message = attempt => message?,
        };

        let text = message.text().trim().to_string();
        if text.is_empty() {
            return Err(StrandError::InvalidState(
                "compaction summary model returned empty output".to_string(),
            ));
        }
        Ok(text)
    }
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("model", &self.client.model_id())
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::scripted::ScriptedModel;
    use crate::types::{AssistantMessage, StopReason, ToolCall, ToolResultMessage};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn preparation(split_turn: bool) -> CompactionPreparation {
        let mut file_ops = FileOperationSet::default();
        file_ops.read_files.insert("README.md".into());
        file_ops.modified_files.insert("src/lib.rs".into());
        CompactionPreparation {
            leaf_id: "leaf".into(),
            first_kept_entry_id: "kept".into(),
            messages_to_summarize: vec![Message::user("fix the bug")],
            turn_prefix_messages: if split_turn {
                vec![Message::user("now add tests")]
            } else {
                Vec::new()
            },
            split_turn,
            previous_summary: None,
            file_ops,
            tokens_before: 100,
            kept_tokens: 50,
        }
    }

    #[test]
    fn transcript_lines_follow_message_roles() {
        let messages = vec![
            Message::user("hi"),
            AssistantMessage::new(
                vec![
                    ContentBlock::Text {
                        text: "reading".into(),
                    },
                    ContentBlock::ToolCall(ToolCall::new("c1", "read", json!({ "path": "a" }))),
                ],
                StopReason::ToolUse,
            )
            .into(),
            ToolResultMessage {
                tool_call_id: "c1".into(),
                tool_name: "read".into(),
                content: vec![ToolContent::text("contents")],
                details: serde_json::Value::Null,
                is_error: false,
                timestamp: Utc::now(),
            }
            .into(),
        ];
        assert_eq!(
            serialize_messages_for_summary(&messages),
            "[user] hi\n[assistant] reading\n[assistant.tool_call] read {\"path\":\"a\"}\n[tool] id=c1 name=read is_error=false result=contents"
        );
    }

    #[test]
    fn long_tool_results_are_truncated() {
        let text = truncate_chars(&"a".repeat(10), 4);
        assert_eq!(text, "aaaa... [6 more characters truncated]");
    }

    #[tokio::test]
    async fn summary_carries_file_manifest_and_sends_no_tools() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text("## Goal\n- fix the bug");
        let summarizer = Summarizer::new(model.clone(), RetryPolicy::default());

        let summary = summarizer
            .summarize(&preparation(false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            summary,
            "## Goal\n- fix the bug\n\n<read-files>\nREADME.md\n</read-files>\n\n<modified-files>\nsrc/lib.rs\n</modified-files>"
        );
        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].tools.is_empty());
        assert_eq!(
            requests[0].system_prompt.as_deref(),
            Some(SUMMARIZATION_SYSTEM_PROMPT)
        );
    }

    #[tokio::test]
    async fn split_turn_joins_history_and_prefix_summaries() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text("history").push_text("prefix");
        let summarizer = Summarizer::new(model.clone(), RetryPolicy::default());
        let mut prep = preparation(true);
        prep.file_ops = FileOperationSet::default();

        let summary = summarizer
            .summarize(&prep, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            summary,
            "history\n\n---\n\n**Turn Context (split turn):**\n\nprefix"
        );
        assert_eq!(model.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let model = Arc::new(ScriptedModel::new());
        model
            .push_error(StrandError::provider("503 service unavailable", Some(503)))
            .push_text("recovered");
        let summarizer = Summarizer::new(model.clone(), RetryPolicy::default());
        let mut prep = preparation(false);
        prep.file_ops = FileOperationSet::default();

        let summary = summarizer
            .summarize(&prep, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, "recovered");
    }
}
