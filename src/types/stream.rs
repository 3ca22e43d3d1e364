//! Incremental output of a streamed model turn.

use serde::{Deserialize, Serialize};

use super::message::{AssistantMessage, ContentBlock, StopReason, ToolCall};
use super::usage::Usage;

/// One streamed increment.
///
/// `ToolCallDelta` carries the call as known so far; a later delta with the
/// same id replaces the earlier one. `Done` carries the final message and ends
/// the turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantDelta {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCallDelta { call: ToolCall },
    Usage { usage: Usage },
    Done { message: AssistantMessage },
}

/// Folds deltas into an assistant message, for snapshots while streaming and
/// for finalizing streams that end without a `Done`.
#[derive(Debug, Clone, Default)]
pub struct AssistantAccumulator {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
}

impl AssistantAccumulator {
    /// Apply one non-terminal delta. Returns false for `Done`, which is left to the caller.
    pub fn apply(&mut self, delta: &AssistantDelta) -> bool {
        match delta {
            AssistantDelta::TextDelta { text } => self.text.push_str(text),
            AssistantDelta::ReasoningDelta { text } => self.reasoning.push_str(text),
            AssistantDelta::ToolCallDelta { call } => {
                match self.tool_calls.iter_mut().find(|c| c.id == call.id) {
                    Some(existing) => *existing = call.clone(),
                    None => self.tool_calls.push(call.clone()),
                }
            }
            AssistantDelta::Usage { usage } => self.usage = *usage,
            AssistantDelta::Done { .. } => return false,
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty()
    }

    /// The message as accumulated so far.
    pub fn snapshot(&self, stop_reason: StopReason) -> AssistantMessage {
        let mut content = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(ContentBlock::Reasoning {
                text: self.reasoning.clone(),
                signature: None,
            });
        }
        if !self.text.is_empty() {
            content.push(ContentBlock::Text {
                text: self.text.clone(),
            });
        }
        content.extend(self.tool_calls.iter().cloned().map(ContentBlock::ToolCall));
        AssistantMessage::new(content, stop_reason).with_usage(self.usage)
    }

    /// Final message for a stream that ended without `Done`.
    pub fn finish(self) -> AssistantMessage {
        let stop_reason = if self.tool_calls.is_empty() {
            StopReason::Stop
        } else {
            StopReason::ToolUse
        };
        self.snapshot(stop_reason)
    }
}
