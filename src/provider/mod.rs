//! Model-turn contract.
//!
//! Network code lives outside this crate; hosts implement [`ModelClient`] for
//! their provider. [`scripted::ScriptedModel`] replays canned turns for tests
//! and offline runs.

pub mod scripted;

use bon::Builder;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StrandError};
use crate::tools::ToolDefinition;
use crate::types::{AssistantAccumulator, AssistantDelta, AssistantMessage, Message};

/// Stream of deltas for one model turn. The last item is `AssistantDelta::Done`.
pub type ModelStream = BoxStream<'static, Result<AssistantDelta>>;

/// Sampling parameters forwarded to the model.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, Default, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Option<Vec<String>>,
    pub reasoning_effort: Option<String>,
}

/// Everything the model sees for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub settings: GenerationSettings,
}

/// A language model reachable through streaming turns.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier, for logs.
    fn model_id(&self) -> &str;

    /// Context window in tokens.
    fn context_window(&self) -> usize;

    /// Start one turn.
    ///
    /// Errors returned here, or yielded by the stream, are classified with
    /// [`StrandError::kind`] to decide between retry, compaction and failure.
    async fn stream_turn(
        &self,
        request: &ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream>;
}

/// Run one turn to completion and return the final message.
pub async fn complete(
    client: &dyn ModelClient,
    request: &ModelRequest,
    cancel: CancellationToken,
) -> Result<AssistantMessage> {
    let mut stream = client.stream_turn(request, cancel.clone()).await?;
    let mut accumulator = AssistantAccumulator::default();
    loop {
        let delta = tokio::select! {
            _ = cancel.cancelled() => return Err(StrandError::Aborted),
            delta = stream.next() => delta,
        };
        match delta {
            Some(Ok(AssistantDelta::Done { message })) => return Ok(message),
            Some(Ok(delta)) => {
                accumulator.apply(&delta);
            }
            Some(Err(err)) => return Err(err),
            None => return Ok(accumulator.finish()),
        }
    }
}
