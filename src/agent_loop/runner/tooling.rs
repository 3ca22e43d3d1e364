use std::sync::Arc;

use chrono::Utc;
use futures::future;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::tools::{aborted_output, ToolExecutor, ToolOutput, ToolUpdate, ToolUpdateCallback};
use crate::types::{ToolCall, ToolResultMessage};

use super::super::events::AgentEvent;
use super::control::AgentEventEmitter;

/// Text of the result stored for calls skipped because steering arrived.
pub const SKIPPED_DUE_TO_STEERING: &str = "Skipped due to steering message.";

pub(super) fn tool_result_message(call: &ToolCall, output: ToolOutput) -> ToolResultMessage {
    ToolResultMessage {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: output.content,
        details: output.details,
        is_error: output.is_error,
        timestamp: Utc::now(),
    }
}

pub(super) fn skipped_tool_result(call: &ToolCall) -> ToolResultMessage {
    tool_result_message(
        call,
        ToolOutput::error(SKIPPED_DUE_TO_STEERING)
            .with_details(json!({ "reason": "skipped_due_to_steering" })),
    )
}

pub(super) fn aborted_tool_result(call: &ToolCall) -> ToolResultMessage {
    tool_result_message(call, aborted_output(None))
}

pub(super) fn emit_tool_execution_start(emitter: &AgentEventEmitter, call: &ToolCall) {
    emitter.emit(AgentEvent::ToolExecutionStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        args: call.arguments.clone(),
    });
}

pub(super) fn emit_tool_execution_end(emitter: &AgentEventEmitter, result: &ToolResultMessage) {
    emitter.emit(AgentEvent::ToolExecutionEnd {
        tool_call_id: result.tool_call_id.clone(),
        tool_name: result.tool_name.clone(),
        result: result.clone(),
        is_error: result.is_error,
    });
}

fn update_callback(emitter: &AgentEventEmitter, call: &ToolCall) -> ToolUpdateCallback {
    let emitter = emitter.clone();
    let tool_call_id = call.id.clone();
    let tool_name = call.name.clone();
    Arc::new(move |partial: ToolUpdate| {
        emitter.emit(AgentEvent::ToolExecutionUpdate {
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            partial,
        });
    })
}

/// Run one call, relaying its progress updates. Start and end events are left
/// to the caller.
pub(super) async fn execute_tool_call(
    executor: &ToolExecutor,
    emitter: &AgentEventEmitter,
    call: &ToolCall,
    cancel: &CancellationToken,
) -> ToolResultMessage {
    tracing::debug!(
        run_id = %emitter.run_id(),
        tool_call_id = %call.id,
        tool_name = %call.name,
        "tool call start"
    );
    let output = executor
        .execute(call, cancel, Some(update_callback(emitter, call)))
        .await;
    tracing::debug!(
        run_id = %emitter.run_id(),
        tool_call_id = %call.id,
        is_error = output.is_error,
        "tool call end"
    );
    tool_result_message(call, output)
}

/// Run a batch concurrently. Results come back in call order.
pub(super) async fn execute_parallel_tool_calls(
    executor: &ToolExecutor,
    emitter: &AgentEventEmitter,
    calls: &[ToolCall],
    cancel: &CancellationToken,
) -> Vec<ToolResultMessage> {
    let futures = calls
        .iter()
        .map(|call| execute_tool_call(executor, emitter, call, cancel));
    future::join_all(futures).await
}
