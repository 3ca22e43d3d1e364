use crate::config::ToolExecutionMode;
use crate::error::StrandError;
use crate::types::{AssistantMessage, Message, ToolCall, ToolResultMessage};

use super::super::super::events::AgentEvent;
use super::super::super::types::LoopState;
use super::super::tooling::{
    aborted_tool_result, emit_tool_execution_end, emit_tool_execution_start,
    execute_parallel_tool_calls, execute_tool_call, skipped_tool_result,
};
use super::LoopRun;

pub(super) enum ToolPhaseOutcome {
    Completed { had_tool_calls: bool },
    /// Steering arrived mid-batch; these messages open the next turn.
    Steered(Vec<Message>),
    Aborted,
    Failed(StrandError),
}

pub(super) async fn run_tool_phase(
    run: &LoopRun,
    turn_index: usize,
    assistant: AssistantMessage,
) -> ToolPhaseOutcome {
    let calls: Vec<ToolCall> = assistant.tool_calls().cloned().collect();
    let mut tool_results = Vec::with_capacity(calls.len());

    let outcome = if calls.is_empty() {
        ToolPhaseOutcome::Completed {
            had_tool_calls: false,
        }
    } else {
        run.emitter.set_state(LoopState::ExecutingTools);
        match run.request.config.tool_execution {
            ToolExecutionMode::Sequential => run_sequential(run, &calls, &mut tool_results).await,
            ToolExecutionMode::Parallel => run_parallel(run, &calls, &mut tool_results).await,
        }
    };

    run.emitter.emit(AgentEvent::TurnEnd {
        run_id: run.emitter.run_id(),
        turn_index,
        message: Some(assistant),
        tool_results,
    });
    outcome
}

async fn run_sequential(
    run: &LoopRun,
    calls: &[ToolCall],
    tool_results: &mut Vec<ToolResultMessage>,
) -> ToolPhaseOutcome {
    for (call_idx, call) in calls.iter().enumerate() {
        if run.cancel.is_cancelled() {
            return abort_remaining(run, &calls[call_idx..], tool_results).await;
        }

        run.emitter.set_state(LoopState::ExecutingTools);
        emit_tool_execution_start(&run.emitter, call);
        let result = execute_tool_call(&run.executor, &run.emitter, call, &run.cancel).await;
        emit_tool_execution_end(&run.emitter, &result);
        if let Err(err) = record_result(run, result, tool_results).await {
            return ToolPhaseOutcome::Failed(err);
        }

        let remaining = &calls[call_idx + 1..];
        if run.cancel.is_cancelled() {
            return abort_remaining(run, remaining, tool_results).await;
        }
        let Some(steering) = run.poll_steering().await else {
            return abort_remaining(run, remaining, tool_results).await;
        };
        if !steering.is_empty() {
            for skipped in remaining {
                emit_tool_execution_start(&run.emitter, skipped);
                let result = skipped_tool_result(skipped);
                emit_tool_execution_end(&run.emitter, &result);
                if let Err(err) = record_result(run, result, tool_results).await {
                    return ToolPhaseOutcome::Failed(err);
                }
            }
            tracing::debug!(
                run_id = %run.emitter.run_id(),
                skipped = remaining.len(),
                "steering interrupted tool batch"
            );
            return ToolPhaseOutcome::Steered(steering);
        }
    }

    ToolPhaseOutcome::Completed {
        had_tool_calls: true,
    }
}

/// All calls run at once; steering is consulted once after the whole batch.
async fn run_parallel(
    run: &LoopRun,
    calls: &[ToolCall],
    tool_results: &mut Vec<ToolResultMessage>,
) -> ToolPhaseOutcome {
    if run.cancel.is_cancelled() {
        return abort_remaining(run, calls, tool_results).await;
    }

    for call in calls {
        emit_tool_execution_start(&run.emitter, call);
    }
    let results = execute_parallel_tool_calls(&run.executor, &run.emitter, calls, &run.cancel).await;
    for result in results {
        emit_tool_execution_end(&run.emitter, &result);
        if let Err(err) = record_result(run, result, tool_results).await {
            return ToolPhaseOutcome::Failed(err);
        }
    }

    if run.cancel.is_cancelled() {
        return ToolPhaseOutcome::Aborted;
    }
    match run.poll_steering().await {
        None => ToolPhaseOutcome::Aborted,
        Some(steering) if !steering.is_empty() => ToolPhaseOutcome::Steered(steering),
        Some(_) => ToolPhaseOutcome::Completed {
            had_tool_calls: true,
        },
    }
}

/// Give every call that never ran a synthetic aborted result.
async fn abort_remaining(
    run: &LoopRun,
    calls: &[ToolCall],
    tool_results: &mut Vec<ToolResultMessage>,
) -> ToolPhaseOutcome {
    for call in calls {
        emit_tool_execution_start(&run.emitter, call);
        let result = aborted_tool_result(call);
        emit_tool_execution_end(&run.emitter, &result);
        if let Err(err) = record_result(run, result, tool_results).await {
            return ToolPhaseOutcome::Failed(err);
        }
    }
    ToolPhaseOutcome::Aborted
}

async fn record_result(
    run: &LoopRun,
    result: ToolResultMessage,
    tool_results: &mut Vec<ToolResultMessage>,
) -> Result<(), StrandError> {
    run.append_message(result.clone().into()).await?;
    tool_results.push(result);
    Ok(())
}
