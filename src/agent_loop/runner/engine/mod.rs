use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::compaction::{CompactionEngine, CompactionResult};
use crate::error::StrandError;
use crate::provider::ModelClient;
use crate::session::{EntryId, EntryPayload};
use crate::tools::ToolExecutor;
use crate::types::Message;

use super::super::events::{AgentEvent, CompactionReason};
use super::super::types::{LoopState, RunOutcome, TerminalState};
use super::control::AgentEventEmitter;
use super::message_events::emit_message_lifecycle;
use super::{MessageBatchFn, RunRequest};

mod llm_phase;
mod tool_phase;

pub use llm_phase::MAX_OVERFLOW_RECOVERIES;

use llm_phase::{run_llm_phase, LlmPhaseOutcome};
use tool_phase::{run_tool_phase, ToolPhaseOutcome};

enum LoopExit {
    Done,
    Aborted,
    Failed(StrandError),
}

impl From<StrandError> for LoopExit {
    fn from(err: StrandError) -> Self {
        match err {
            StrandError::Aborted => Self::Aborted,
            err => Self::Failed(err),
        }
    }
}

/// Everything one spawned run owns.
pub(super) struct LoopRun {
    pub(super) request: RunRequest,
    pub(super) client: Arc<dyn ModelClient>,
    pub(super) executor: ToolExecutor,
    pub(super) compaction: CompactionEngine,
    pub(super) emitter: AgentEventEmitter,
    pub(super) cancel: CancellationToken,
}

impl LoopRun {
    pub(super) async fn drive(self) {
        let run_id = self.emitter.run_id();
        tracing::debug!(
            run_id = %run_id,
            model = %self.client.model_id(),
            input_messages = self.request.input.len(),
            "run start"
        );
        self.emitter.emit(AgentEvent::AgentStart { run_id });

        let exit = self.run_turns().await;
        let outcome = self.outcome(exit).await;
        match &outcome.error {
            Some(error) => {
                tracing::warn!(run_id = %run_id, state = %outcome.state, error = %error, "run end")
            }
            None => tracing::debug!(run_id = %run_id, state = %outcome.state, "run end"),
        }
        self.emitter.finish(outcome);
    }

    async fn run_turns(&self) -> LoopExit {
        let run_id = self.emitter.run_id();
        let mut pending = self.request.input.clone();
        let mut turn_index = 0usize;

        loop {
            'inner: loop {
                if self.cancel.is_cancelled() {
                    return LoopExit::Aborted;
                }
                if let Some(max_turns) = self.request.config.max_turns {
                    if turn_index >= max_turns {
                        return LoopExit::Failed(StrandError::InvalidState(format!(
                            "turn limit reached (max_turns={max_turns})"
                        )));
                    }
                }

                turn_index += 1;
                self.emitter.emit(AgentEvent::TurnStart { run_id, turn_index });
                for message in pending.drain(..) {
                    if let Err(err) = self.append_message(message).await {
                        return err.into();
                    }
                }

                let assistant = match run_llm_phase(self, turn_index).await {
                    LlmPhaseOutcome::Ready(message) => message,
                    LlmPhaseOutcome::Aborted => return LoopExit::Aborted,
                    LlmPhaseOutcome::Failed(err) => return err.into(),
                };

                let had_tool_calls = match run_tool_phase(self, turn_index, assistant).await {
                    ToolPhaseOutcome::Completed { had_tool_calls } => had_tool_calls,
                    ToolPhaseOutcome::Steered(messages) => {
                        pending = messages;
                        continue 'inner;
                    }
                    ToolPhaseOutcome::Aborted => return LoopExit::Aborted,
                    ToolPhaseOutcome::Failed(err) => return err.into(),
                };

                let Some(steering) = self.poll_steering().await else {
                    return LoopExit::Aborted;
                };
                if !steering.is_empty() {
                    pending = steering;
                    continue 'inner;
                }
                if !had_tool_calls {
                    break 'inner;
                }
            }

            let follow_ups = self
                .poll_batch(self.request.get_follow_up_messages.as_ref())
                .await;
            let Some(follow_ups) = follow_ups else {
                return LoopExit::Aborted;
            };
            if follow_ups.is_empty() {
                return LoopExit::Done;
            }
            tracing::debug!(
                run_id = %run_id,
                count = follow_ups.len(),
                "follow-up messages queued"
            );
            pending = follow_ups;
        }
    }

    async fn outcome(&self, exit: LoopExit) -> RunOutcome {
        let (state, error) = match exit {
            LoopExit::Done => (TerminalState::Done, None),
            LoopExit::Aborted => (TerminalState::Aborted, None),
            LoopExit::Failed(err) => (TerminalState::Error, Some(err)),
        };

        let tree = self.request.session.read().await;
        let messages = match tree.build_context(None) {
            Ok(context) => context.messages,
            Err(err) => {
                tracing::warn!(
                    run_id = %self.emitter.run_id(),
                    error = %err,
                    "failed to materialize final context"
                );
                Vec::new()
            }
        };

        RunOutcome {
            run_id: self.emitter.run_id(),
            state,
            error_kind: error.as_ref().map(StrandError::kind),
            error: error.map(|err| err.to_string()),
            leaf_id: tree.leaf_id().map(str::to_string),
            messages,
            finished_at: Utc::now(),
        }
    }

    /// Append `message` under the current leaf.
    pub(super) async fn persist(&self, message: Message) -> Result<EntryId, StrandError> {
        let mut tree = self.request.session.write().await;
        Ok(tree.append(EntryPayload::message(message))?)
    }

    /// Append `message` and announce it.
    pub(super) async fn append_message(&self, message: Message) -> Result<EntryId, StrandError> {
        let id = self.persist(message.clone()).await?;
        emit_message_lifecycle(&self.emitter, &message);
        Ok(id)
    }

    /// `None` when the run was aborted while waiting.
    async fn poll_batch(&self, provider: Option<&MessageBatchFn>) -> Option<Vec<Message>> {
        let Some(provider) = provider else {
            return Some(Vec::new());
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            messages = provider() => Some(messages),
        }
    }

    pub(super) async fn poll_steering(&self) -> Option<Vec<Message>> {
        let resume = self.emitter.state();
        self.emitter.set_state(LoopState::AwaitingSteering);
        let steering = self
            .poll_batch(self.request.get_steering_messages.as_ref())
            .await;
        self.emitter.set_state(resume);
        if let Some(messages) = &steering {
            if !messages.is_empty() {
                tracing::debug!(
                    run_id = %self.emitter.run_id(),
                    count = messages.len(),
                    "steering messages queued"
                );
            }
        }
        steering
    }

    /// Compact the session, bracketed by compaction events.
    pub(super) async fn compact(
        &self,
        reason: CompactionReason,
    ) -> Result<Option<CompactionResult>, StrandError> {
        if self.cancel.is_cancelled() {
            return Err(StrandError::Aborted);
        }
        let run_id = self.emitter.run_id();
        self.emitter.emit(AgentEvent::CompactionStart { run_id, reason });

        let force = reason == CompactionReason::Overflow;
        let result = self
            .compaction
            .compact(&self.request.session, None, &self.cancel, force)
            .await;

        let (entry_id, record, error) = match &result {
            Ok(Some(compacted)) => (
                Some(compacted.entry_id.clone()),
                Some(compacted.record.clone()),
                None,
            ),
            Ok(None) => (None, None, None),
            Err(err) => (None, None, Some(err.to_string())),
        };
        self.emitter.emit(AgentEvent::CompactionEnd {
            run_id,
            reason,
            entry_id,
            record,
            error,
        });
        result
    }
}
