//! A model that replays queued turns.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ModelClient, ModelRequest, ModelStream};
use crate::error::{Result, StrandError};
use crate::types::{AssistantDelta, AssistantMessage, ContentBlock, StopReason, ToolCall, Usage};

/// One scripted response.
#[derive(Debug)]
pub enum ScriptedTurn {
    /// Stream the message as deltas, then `Done`.
    Message {
        message: AssistantMessage,
        delay_per_delta: Option<Duration>,
    },
    /// Fail when the turn is requested.
    Fail(StrandError),
    /// Stream some text, then fail mid-stream.
    FailMidStream { text: String, error: StrandError },
    /// Stream that ends without a `Done` delta.
    Truncated(Vec<AssistantDelta>),
    /// Stream that never produces anything.
    Pending,
}

/// Deterministic [`ModelClient`] that pops one [`ScriptedTurn`] per request
/// and records every request it receives.
#[derive(Debug)]
pub struct ScriptedModel {
    model_id: String,
    context_window: usize,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            model_id: "scripted".to_string(),
            context_window: 128_000,
            turns: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn push(&self, turn: ScriptedTurn) -> &Self {
        self.lock_turns().push_back(turn);
        self
    }

    pub fn push_message(&self, message: AssistantMessage) -> &Self {
        self.push(ScriptedTurn::Message {
            message,
            delay_per_delta: None,
        })
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push_message(AssistantMessage::text_only(text))
    }

    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) -> &Self {
        let content = calls.into_iter().map(ContentBlock::ToolCall).collect();
        self.push_message(AssistantMessage::new(content, StopReason::ToolUse))
    }

    pub fn push_error(&self, error: StrandError) -> &Self {
        self.push(ScriptedTurn::Fail(error))
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock_turns().len()
    }

    fn lock_turns(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedTurn>> {
        self.turns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn message_deltas(message: &AssistantMessage) -> Vec<AssistantDelta> {
    let mut deltas = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text { text } if !text.is_empty() => {
                deltas.push(AssistantDelta::TextDelta { text: text.clone() });
            }
            ContentBlock::Reasoning { text, .. } if !text.is_empty() => {
                deltas.push(AssistantDelta::ReasoningDelta { text: text.clone() });
            }
            ContentBlock::ToolCall(call) => {
                deltas.push(AssistantDelta::ToolCallDelta { call: call.clone() });
            }
            _ => {}
        }
    }
    if message.usage != Usage::default() {
        deltas.push(AssistantDelta::Usage {
            usage: message.usage,
        });
    }
    deltas.push(AssistantDelta::Done {
        message: message.clone(),
    });
    deltas
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn stream_turn(
        &self,
        request: &ModelRequest,
        _cancel: CancellationToken,
    ) -> Result<ModelStream> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        let turn = self
            .lock_turns()
            .pop_front()
            .ok_or_else(|| StrandError::InvalidState("scripted model has no turns left".into()))?;

        let stream: ModelStream = match turn {
            ScriptedTurn::Message {
                message,
                delay_per_delta,
            } => {
                let deltas = message_deltas(&message);
                Box::pin(async_stream::stream! {
                    for delta in deltas {
                        if let Some(delay) = delay_per_delta {
                            tokio::time::sleep(delay).await;
                        }
                        yield Ok(delta);
                    }
                })
            }
            ScriptedTurn::Fail(error) => return Err(error),
            ScriptedTurn::FailMidStream { text, error } => Box::pin(async_stream::stream! {
                yield Ok(AssistantDelta::TextDelta { text });
                yield Err(error);
            }),
            ScriptedTurn::Truncated(deltas) => Box::pin(futures::stream::iter(
                deltas.into_iter().map(Ok),
            )),
            ScriptedTurn::Pending => Box::pin(futures::stream::pending()),
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::complete;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn replays_turns_in_order_and_records_requests() {
        let model = ScriptedModel::new();
        model.push_text("first").push_text("second");

        let request = ModelRequest::default();
        let cancel = CancellationToken::new();
        let first = complete(&model, &request, cancel.clone()).await.unwrap();
        let second = complete(&model, &request, cancel.clone()).await.unwrap();

        assert_eq!(first.text(), "first");
        assert_eq!(second.text(), "second");
        assert_eq!(model.requests().len(), 2);
        assert!(complete(&model, &request, cancel).await.is_err());
    }

    #[tokio::test]
    async fn truncated_stream_is_finalized_from_deltas() {
        let model = ScriptedModel::new();
        model.push(ScriptedTurn::Truncated(vec![AssistantDelta::TextDelta {
            text: "partial".into(),
        }]));
        let message = complete(&model, &ModelRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(message.text(), "partial");
        assert_eq!(message.stop_reason, StopReason::Stop);
    }
}
