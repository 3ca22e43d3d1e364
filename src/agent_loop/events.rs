//! Events emitted while a run progresses.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::types::{RunId, TerminalState};
use crate::session::{CompactionRecord, EntryId};
use crate::tools::ToolUpdate;
use crate::types::{AssistantDelta, AssistantMessage, Message, ToolResultMessage};

/// Why a compaction ran inside a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompactionReason {
    /// The estimated context crossed the reserve threshold before a turn.
    Threshold,
    /// The model rejected a request as too large.
    Overflow,
}

/// Lifecycle events for a run, in the order they happened.
///
/// `AgentEnd` is always the last event of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart {
        run_id: RunId,
    },
    TurnStart {
        run_id: RunId,
        turn_index: usize,
    },
    MessageStart {
        message: Message,
    },
    /// Streaming progress of the assistant message; `message` is the snapshot
    /// after applying `delta`.
    MessageUpdate {
        message: AssistantMessage,
        delta: AssistantDelta,
    },
    MessageEnd {
        message: Message,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        partial: ToolUpdate,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolResultMessage,
        is_error: bool,
    },
    TurnEnd {
        run_id: RunId,
        turn_index: usize,
        message: Option<AssistantMessage>,
        tool_results: Vec<ToolResultMessage>,
    },
    CompactionStart {
        run_id: RunId,
        reason: CompactionReason,
    },
    /// `entry_id` and `record` are absent when nothing could be discarded or
    /// the compaction failed (`error` set).
    CompactionEnd {
        run_id: RunId,
        reason: CompactionReason,
        entry_id: Option<EntryId>,
        record: Option<CompactionRecord>,
        error: Option<String>,
    },
    RetryScheduled {
        run_id: RunId,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error: String,
    },
    AgentEnd {
        run_id: RunId,
        state: TerminalState,
        error: Option<String>,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEnd { .. })
    }
}
