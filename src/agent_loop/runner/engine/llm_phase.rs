use futures::StreamExt;
use tokio::time::{self, Duration};

use crate::error::{ErrorKind, StrandError};
use crate::provider::{ModelRequest, ModelStream};
use crate::types::{AssistantAccumulator, AssistantDelta, AssistantMessage, Message, StopReason};

use super::super::super::events::{AgentEvent, CompactionReason};
use super::super::super::types::LoopState;
use super::super::message_events::{
    emit_assistant_end, emit_message_end_if_open, emit_message_start_if_needed,
    without_tool_calls,
};
use super::super::default_convert_to_llm;
use super::LoopRun;

/// Context-overflow recoveries allowed within one turn.
pub const MAX_OVERFLOW_RECOVERIES: usize = 3;

pub(super) enum LlmPhaseOutcome {
    Ready(AssistantMessage),
    Aborted,
    Failed(StrandError),
}

/// How one attempt at streaming a model turn ended.
enum TurnAttempt {
    /// `MessageStart` has been emitted; the caller persists and closes it.
    Completed(AssistantMessage),
    Aborted {
        partial: AssistantMessage,
        message_open: bool,
    },
    Failed {
        error: StrandError,
        partial: AssistantMessage,
        message_open: bool,
    },
}

pub(super) async fn run_llm_phase(run: &LoopRun, turn_index: usize) -> LlmPhaseOutcome {
    let run_id = run.emitter.run_id();
    run.emitter.set_state(LoopState::Streaming);

    match run
        .compaction
        .needs_compaction(&run.request.session, None)
        .await
    {
        Ok(false) => {}
        Ok(true) => match run.compact(CompactionReason::Threshold).await {
            Ok(_) => {}
            Err(StrandError::Aborted) => return LlmPhaseOutcome::Aborted,
            Err(err) => return LlmPhaseOutcome::Failed(err),
        },
        Err(err) => return LlmPhaseOutcome::Failed(err),
    }

    let retry = run.request.config.retry;
    let mut attempt = 0u32;
    let mut overflow_recoveries = 0usize;

    loop {
        if run.cancel.is_cancelled() {
            return LlmPhaseOutcome::Aborted;
        }
        let request = match build_model_request(run).await {
            Ok(request) => request,
            Err(err) => return LlmPhaseOutcome::Failed(err),
        };

        let (error, partial, mut message_open) = match stream_turn(run, &request).await {
            TurnAttempt::Completed(message) => {
                if let Err(err) = run.persist(message.clone().into()).await {
                    return LlmPhaseOutcome::Failed(err);
                }
                run.emitter.emit(AgentEvent::MessageEnd {
                    message: message.clone().into(),
                });
                tracing::debug!(
                    run_id = %run_id,
                    turn_index,
                    stop_reason = %message.stop_reason,
                    tool_calls = message.tool_calls().count(),
                    text_len = message.text().len(),
                    "model turn complete"
                );
                return LlmPhaseOutcome::Ready(message);
            }
            TurnAttempt::Aborted {
                partial,
                mut message_open,
            } => {
                if !partial.is_empty() {
                    if let Err(err) = run.persist(partial.clone().into()).await {
                        tracing::warn!(
                            run_id = %run_id,
                            error = %err,
                            "failed to keep partial message"
                        );
                    }
                }
                emit_message_end_if_open(&run.emitter, &mut message_open, &partial);
                return LlmPhaseOutcome::Aborted;
            }
            TurnAttempt::Failed {
                error,
                partial,
                message_open,
            } => (error, partial, message_open),
        };

        if matches!(error, StrandError::Aborted) || run.cancel.is_cancelled() {
            emit_message_end_if_open(&run.emitter, &mut message_open, &partial);
            return LlmPhaseOutcome::Aborted;
        }

        match error.kind() {
            ErrorKind::Retryable => {
                emit_message_end_if_open(&run.emitter, &mut message_open, &partial);
                attempt += 1;
                if attempt > retry.max_retries {
                    let error = StrandError::RetryAbandoned {
                        reason: format!("giving up after {} retries", retry.max_retries),
                        source: Box::new(error),
                    };
                    return fail_turn(run, error, partial, message_open).await;
                }

                let hint = error.retry_after_ms();
                if let (Some(hint), Some(max_retry_delay_ms)) =
                    (hint, run.request.config.max_retry_delay_ms)
                {
                    if max_retry_delay_ms > 0 && hint > max_retry_delay_ms {
                        let error = StrandError::RetryAbandoned {
                            reason: format!(
                                "retry delay {hint}ms exceeds max_retry_delay_ms={max_retry_delay_ms}"
                            ),
                            source: Box::new(error),
                        };
                        return fail_turn(run, error, partial, message_open).await;
                    }
                }

                let delay = retry.delay_for(attempt, hint);
                let delay_ms = delay.as_millis() as u64;
                tracing::warn!(
                    run_id = %run_id,
                    turn_index,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms,
                    error = %error,
                    "retrying model turn"
                );
                run.emitter.emit(AgentEvent::RetryScheduled {
                    run_id,
                    attempt,
                    max_retries: retry.max_retries,
                    delay_ms,
                    error: error.to_string(),
                });
                tokio::select! {
                    biased;
                    _ = run.cancel.cancelled() => return LlmPhaseOutcome::Aborted,
                    _ = time::sleep(delay) => {}
                }
            }
            ErrorKind::ContextOverflow => {
                emit_message_end_if_open(&run.emitter, &mut message_open, &partial);
                overflow_recoveries += 1;
                if !run.compaction.settings().enabled {
                    return fail_turn(run, error, partial, message_open).await;
                }
                if overflow_recoveries > MAX_OVERFLOW_RECOVERIES {
                    let error = StrandError::ContextOverflow(format!(
                        "still over the context window after {MAX_OVERFLOW_RECOVERIES} compactions: {error}"
                    ));
                    return fail_turn(run, error, partial, message_open).await;
                }
                tracing::warn!(
                    run_id = %run_id,
                    turn_index,
                    overflow_recoveries,
                    error = %error,
                    "context overflow; compacting before reissuing the turn"
                );
                match run.compact(CompactionReason::Overflow).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        let error = StrandError::ContextOverflow(format!(
                            "no history left to compact: {error}"
                        ));
                        return fail_turn(run, error, partial, message_open).await;
                    }
                    Err(StrandError::Aborted) => return LlmPhaseOutcome::Aborted,
                    Err(err) => return fail_turn(run, err, partial, message_open).await,
                }
            }
            ErrorKind::Fatal => return fail_turn(run, error, partial, message_open).await,
        }
    }
}

/// Record the failed turn as an error message so the history shows where the run stopped.
async fn fail_turn(
    run: &LoopRun,
    error: StrandError,
    mut partial: AssistantMessage,
    mut message_open: bool,
) -> LlmPhaseOutcome {
    partial.stop_reason = StopReason::Error;
    partial.error_message = Some(error.to_string());
    if let Err(err) = run.persist(partial.clone().into()).await {
        tracing::warn!(
            run_id = %run.emitter.run_id(),
            error = %err,
            "failed to record turn error"
        );
    }
    emit_assistant_end(&run.emitter, &mut message_open, &partial);
    LlmPhaseOutcome::Failed(error)
}

async fn build_model_request(run: &LoopRun) -> Result<ModelRequest, StrandError> {
    let context = run.request.session.read().await.build_context(None)?;
    let messages = match &run.request.convert_to_llm {
        Some(convert) => convert(context.messages).await,
        None => default_convert_to_llm(context.messages),
    };
    Ok(ModelRequest {
        system_prompt: run.request.config.system_prompt.clone(),
        messages,
        tools: run.executor.definitions(),
        settings: run.request.settings.clone(),
    })
}

/// Next delta, or a timeout error once the stream has been silent for `idle_timeout_ms`.
async fn next_delta(
    stream: &mut ModelStream,
    idle_timeout_ms: u64,
) -> Option<Result<AssistantDelta, StrandError>> {
    if idle_timeout_ms == 0 {
        return stream.next().await;
    }
    match time::timeout(Duration::from_millis(idle_timeout_ms), stream.next()).await {
        Ok(next) => next,
        Err(_) => Some(Err(StrandError::Timeout(idle_timeout_ms))),
    }
}

async fn stream_turn(run: &LoopRun, request: &ModelRequest) -> TurnAttempt {
    let mut accumulator = AssistantAccumulator::default();
    let mut message_open = false;

    let opened = tokio::select! {
        biased;
        _ = run.cancel.cancelled() => None,
        result = run.client.stream_turn(request, run.cancel.child_token()) => Some(result),
    };
    let mut stream = match opened {
        None => {
            return TurnAttempt::Aborted {
                partial: without_tool_calls(accumulator.snapshot(StopReason::Aborted)),
                message_open,
            }
        }
        Some(Err(error)) => {
            return TurnAttempt::Failed {
                error,
                partial: without_tool_calls(accumulator.snapshot(StopReason::Error)),
                message_open,
            }
        }
        Some(Ok(stream)) => stream,
    };

    let idle_timeout_ms = run.request.config.stream_idle_timeout_ms();
    let final_message = loop {
        let next = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => {
                return TurnAttempt::Aborted {
                    partial: without_tool_calls(accumulator.snapshot(StopReason::Aborted)),
                    message_open,
                };
            }
            next = next_delta(&mut stream, idle_timeout_ms) => next,
        };
        match next {
            None => break None,
            Some(Ok(AssistantDelta::Done { message })) => break Some(message),
            Some(Ok(delta)) => {
                accumulator.apply(&delta);
                emit_message_start_if_needed(&run.emitter, &mut message_open, &accumulator);
                run.emitter.emit(AgentEvent::MessageUpdate {
                    message: accumulator.snapshot(StopReason::Stop),
                    delta,
                });
            }
            Some(Err(error)) => {
                return TurnAttempt::Failed {
                    error,
                    partial: without_tool_calls(accumulator.snapshot(StopReason::Error)),
                    message_open,
                };
            }
        }
    };

    let message = match final_message {
        Some(message) => message,
        None => accumulator.finish(),
    };
    if message.stop_reason == StopReason::Error {
        let error = StrandError::provider(
            message
                .error_message
                .clone()
                .unwrap_or_else(|| "model turn ended with an error".to_string()),
            None,
        );
        return TurnAttempt::Failed {
            error,
            partial: without_tool_calls(message),
            message_open,
        };
    }

    if !message_open {
        run.emitter.emit(AgentEvent::MessageStart {
            message: Message::Assistant(message.clone()),
        });
    }
    TurnAttempt::Completed(message)
}
