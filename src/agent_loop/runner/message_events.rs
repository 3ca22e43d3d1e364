use crate::types::{AssistantAccumulator, AssistantMessage, ContentBlock, Message, StopReason};

use super::super::events::AgentEvent;
use super::control::AgentEventEmitter;

pub(super) fn emit_message_start_if_needed(
    emitter: &AgentEventEmitter,
    message_open: &mut bool,
    accumulator: &AssistantAccumulator,
) {
    if !*message_open {
        emitter.emit(AgentEvent::MessageStart {
            message: accumulator.snapshot(StopReason::Stop).into(),
        });
        *message_open = true;
    }
}

pub(super) fn emit_message_end_if_open(
    emitter: &AgentEventEmitter,
    message_open: &mut bool,
    message: &AssistantMessage,
) {
    if *message_open {
        emitter.emit(AgentEvent::MessageEnd {
            message: message.clone().into(),
        });
        *message_open = false;
    }
}

/// Close the streamed message, or announce it whole if nothing was streamed.
pub(super) fn emit_assistant_end(
    emitter: &AgentEventEmitter,
    message_open: &mut bool,
    message: &AssistantMessage,
) {
    if *message_open {
        emit_message_end_if_open(emitter, message_open, message);
    } else {
        emit_message_lifecycle(emitter, &message.clone().into());
    }
}

pub(super) fn emit_message_lifecycle(emitter: &AgentEventEmitter, message: &Message) {
    emitter.emit(AgentEvent::MessageStart {
        message: message.clone(),
    });
    emitter.emit(AgentEvent::MessageEnd {
        message: message.clone(),
    });
}

/// Drop tool calls from a turn that was cut short: a call that never gets a
/// result would leave the history unpaired.
pub(super) fn without_tool_calls(mut message: AssistantMessage) -> AssistantMessage {
    message
        .content
        .retain(|block| !matches!(block, ContentBlock::ToolCall(_)));
    message
}
